//! Core types, config, and errors for the audio helper server.

pub mod config;
pub mod error;
pub mod types;
