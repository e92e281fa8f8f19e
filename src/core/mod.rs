//! Core download orchestration module
//!
//! This module contains the domain models, the progress signal machinery,
//! and the coordinator that drives download attempts end to end.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error_handling;
pub mod listeners;
pub mod models;
pub mod persistence;
pub mod progress;
pub mod task;


// Re-export commonly used types
pub use config::AppConfig;
pub use coordinator::{DownloadCoordinator, DownloadHandle};
