pub mod backend;
pub mod config;
pub mod controller;
pub mod drag;
pub mod order;
pub mod reconcile;
pub mod store;
pub mod types;
