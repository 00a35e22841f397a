// Shared library for the schedule synchronization pipeline

pub mod calendar;
pub mod config;
pub mod errors;
pub mod identity;
pub mod models;
pub mod retry;
pub mod store;
pub mod sync;
pub mod telemetry;
