//! # vibe-core
//!
//! Core types for the Vibe patch orchestration core.
//!
//! Worker agents propose structured edits ("patches") to tracked resources.
//! The orchestrator applies them in order, keeps an append-only audit trail of
//! what happened, and fans every event out to live observers.
//!
//! ## Core Paradigm
//!
//! - A batch is the unit of atomicity
//! - The event log IS the batch status (nothing else is stored)
//! - Every applied operation carries its own pre-image, so it can always be reversed
//! - Observers subscribe to channels, never to producers

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{HubSettings, PatchSettings, ServerSettings, TokenIdentity, VibeConfig};
pub use error::{Result, VibeError};
pub use types::*;
