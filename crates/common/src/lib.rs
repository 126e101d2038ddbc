pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
