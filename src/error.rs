//! Ambient error taxonomy for the driver core.
//!
//! Mirrors the failure classes a userspace NVMe driver actually hits:
//! bad configuration, timeouts waiting on controller state, invariant
//! violations that indicate a driver or device bug, typed NVMe status
//! failures, and host memory exhaustion.

use crate::command::status::{Scope, StatusCode};

pub type Result<T> = core::result::Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("invariant violation: {0}")]
    Invariant(&'static str),

    #[error("nvme status failure: {status} ({scope:?}, sc={value:#04x})", status = .status.label, scope = .status.scope, value = .status.value)]
    Status { status: StatusCode },

    #[error("host memory exhausted: {0}")]
    OutOfMemory(&'static str),

    #[error("controller is fault-stopped (CSTS.CFS set)")]
    Faulted,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl DriverError {
    pub fn status(code: StatusCode) -> Self {
        DriverError::Status { status: code }
    }

    /// Scope accessor used by callers that want to branch on generic vs.
    /// command-type status without matching the whole enum.
    pub fn status_scope(&self) -> Option<Scope> {
        match self {
            DriverError::Status { status } => Some(status.scope),
            _ => None,
        }
    }
}
