//! Core library for playlist-dedup
pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod models;
pub mod mutator;
pub mod plan;
pub mod sync;

pub use error::{CallError, SyncError};
