pub mod config;
pub mod log_bridge;
pub mod realtime;
pub mod rest;
