//! Backrest - Backup Orchestration Engine
//!
//! A long-running supervisor that drives an external content-addressed
//! backup tool against configured repositories, on user-defined plans and
//! schedules, recording every attempt in a durable operation log.

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use error::{AppError, Result};
