//! Core domain + application logic for the rewards assistant.
//!
//! Framework-agnostic: the model API, the document store and the source
//! folder live behind ports (traits) implemented in adapter crates.

pub mod cache;
pub mod compose;
pub mod config;
pub mod correspondence;
pub mod domain;
pub mod errors;
pub mod filter;
pub mod gateway;
pub mod logging;
pub mod multipart;
pub mod pipeline;
pub mod ports;
pub mod profile;
pub mod rate_limit;
pub mod store;
pub mod sync;
pub mod utils;

pub use errors::{Error, Result};
