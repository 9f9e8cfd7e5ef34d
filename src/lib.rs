pub mod config;
pub mod pool;
pub mod provider;
pub mod walker;

mod test_utils;
