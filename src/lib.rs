// Agni - Firecracker microVM control plane
//
// Licensed under the GNU General Public License v3.0

//! Agni supervises Firecracker microVMs: it owns their lifecycle, fans their
//! logs out to subscribers, and gates every operation behind signed session
//! tokens and a per-client rate limiter.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

/// Configuration subsystem
pub mod config;

/// Shared error classification
pub mod error;

/// Tracing setup and the injected logger
pub mod logging;

/// Security subsystem
pub mod security;

/// Service interface
pub mod service;

/// Durable state
pub mod storage;

/// Virtual machine core
pub mod vm;

// Re-export common types
pub use config::{ConfigManager, ServiceConfig};
pub use error::ErrorKind;
pub use service::{Caller, Service, ServiceError};
pub use vm::{Supervisor, VmConfig, VmRecord, VmStatus};
