pub mod config;
pub mod error;
pub mod problems;
pub mod queue;
pub mod redis;
pub mod store;
pub mod types;
