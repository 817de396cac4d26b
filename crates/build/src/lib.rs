pub mod acquire;
pub mod base;
pub mod compress;
pub mod config;
pub mod depsolve;
pub mod digest;
pub mod error;
pub mod image;
pub mod metadata;
pub mod orchestrator;
pub mod progress;
pub mod spec;
pub mod tools;
