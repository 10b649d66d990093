//! Deterministic stand-in for a diffusion model.
//!
//! Renders a seeded gradient and refines it with one soft blob per step,
//! coarse to fine, so the step count, progress reporting and cancellation
//! behave like a real sampler. The same prompt and seed always produce the
//! same PNG bytes.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tracing::{debug, info};

use crate::engine::{EngineError, InferenceEngine, ProgressSink};
use crate::runtime::types::GenerationRequest;

#[derive(Debug, Clone)]
pub struct ProceduralConfig {
    pub width: u32,
    pub height: u32,
    /// Sleep after each step, to emulate accelerator time.
    pub step_delay: Duration,
    /// Sleep once inside `load`, to emulate reading weights.
    pub load_delay: Duration,
}

impl Default for ProceduralConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            step_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
        }
    }
}

pub struct ProceduralEngine {
    config: ProceduralConfig,
    loaded: AtomicBool,
}

impl ProceduralEngine {
    pub fn new(config: ProceduralConfig) -> Self {
        Self {
            config,
            loaded: AtomicBool::new(false),
        }
    }
}

impl InferenceEngine for ProceduralEngine {
    fn load(&self) -> Result<(), EngineError> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.config.width == 0 || self.config.height == 0 {
            return Err(EngineError::LoadFailed(format!(
                "invalid output size {}x{}",
                self.config.width, self.config.height
            )));
        }
        if !self.config.load_delay.is_zero() {
            std::thread::sleep(self.config.load_delay);
        }
        self.loaded.store(true, Ordering::Release);
        info!(
            width = self.config.width,
            height = self.config.height,
            "procedural engine loaded"
        );
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        progress: &ProgressSink,
    ) -> Result<Vec<u8>, EngineError> {
        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        if request.steps == 0 {
            return Err(EngineError::InvalidParams("steps must be at least 1".into()));
        }
        if request.prompt.trim().is_empty() {
            return Err(EngineError::InvalidParams("prompt must not be empty".into()));
        }

        let mut rng = SplitMix64::new(mix_seed(&request.prompt, request.seed));
        let mut canvas = background(self.config.width, self.config.height, &mut rng);

        for step in 1..=request.steps {
            if progress.is_cancelled() {
                debug!(step, total = request.steps, "generation cancelled");
                return Err(EngineError::Cancelled);
            }
            paint_blob(&mut canvas, &mut rng, step, request.steps);
            if !self.config.step_delay.is_zero() {
                std::thread::sleep(self.config.step_delay);
            }
            progress.report(step, request.steps);
        }

        encode_png(canvas)
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

/// FNV-1a over the prompt, folded with the caller's seed.
fn mix_seed(prompt: &str, seed: u64) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in prompt.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash ^ seed.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

struct SplitMix64(u64);

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    fn color(&mut self) -> Rgb<u8> {
        let v = self.next_u64();
        Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
    }
}

fn lerp(a: Rgb<u8>, b: Rgb<u8>, t: f32) -> Rgb<u8> {
    Rgb(std::array::from_fn(|i| {
        let (a, b) = (f32::from(a[i]), f32::from(b[i]));
        (a + (b - a) * t).round().clamp(0.0, 255.0) as u8
    }))
}

fn background(width: u32, height: u32, rng: &mut SplitMix64) -> RgbImage {
    let top = rng.color();
    let bottom = rng.color();
    RgbImage::from_fn(width, height, |_, y| {
        lerp(top, bottom, y as f32 / height as f32)
    })
}

/// Blend one radial blob into the canvas. Early steps paint large blobs,
/// later steps small ones.
fn paint_blob(canvas: &mut RgbImage, rng: &mut SplitMix64, step: u32, total: u32) {
    let (width, height) = canvas.dimensions();
    let coarseness = 1.0 - (step - 1) as f32 / total as f32;
    let radius = (width.min(height) as f32 * (0.05 + 0.35 * coarseness)).max(1.0);
    let cx = rng.next_f32() * width as f32;
    let cy = rng.next_f32() * height as f32;
    let color = rng.color();

    let r2 = radius * radius;
    let x0 = (cx - radius).max(0.0) as u32;
    let x1 = ((cx + radius).ceil() as u32).min(width);
    let y0 = (cy - radius).max(0.0) as u32;
    let y1 = ((cy + radius).ceil() as u32).min(height);

    for y in y0..y1 {
        for x in x0..x1 {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let d2 = dx * dx + dy * dy;
            if d2 < r2 {
                let pixel = canvas.get_pixel_mut(x, y);
                *pixel = lerp(*pixel, color, 0.6 * (1.0 - d2 / r2));
            }
        }
    }
}

fn encode_png(canvas: RgbImage) -> Result<Vec<u8>, EngineError> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(canvas).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
