pub mod config;
pub mod http;
pub mod pool;
pub mod service;
pub mod telemetry;
