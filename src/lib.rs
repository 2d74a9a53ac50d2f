//! quire turns stored LaTeX documents into PDF artifacts.
//!
//! Renders run as detached tasks behind a per-subject lock. Each one tries
//! the in-process engine first and, when enabled, falls back to a local
//! engine binary and then to an external compile service that pulls the
//! source through a short-lived content token.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
