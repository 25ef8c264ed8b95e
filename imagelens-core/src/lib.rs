pub mod commands;
pub mod config;
pub mod core;
pub mod database;
pub mod services;
pub mod storage;

pub use commands::{AppState, CommandError};
pub use config::AppConfig;
