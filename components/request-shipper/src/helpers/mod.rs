pub mod load_config;
pub mod retry;
pub mod shutdown;
