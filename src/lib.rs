//! `prophet-stan` library crate.
//!
//! Runs the Prophet Stan model through interchangeable engines behind one
//! `StanBackend` trait. The binary (`prophet-stan`) is a thin wrapper around
//! this library so that:
//!
//! - backends are testable without external engines (engine traits take
//!   test doubles)
//! - callers can embed a backend directly (`models::StanBackendKind::build`)

pub mod app;
pub mod artifacts;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod io;
pub mod models;
pub mod report;
