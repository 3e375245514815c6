pub mod browser;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
