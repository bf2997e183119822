//! Runcast CLI
//!
//! Command-line interface for storing scenarios, submitting runs and
//! following them on a Runcast server.

pub mod client;
pub mod commands;
pub mod output;

pub use client::{Health, ServerClient, Submitted};
