pub mod runner;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;
