//! Error types for distributed tiled linear algebra
//!
//! Provides a unified error type for all tessera crates. Every failure
//! belongs to one [`ErrorKind`], so callers can tell configuration mistakes
//! apart from numerical breakdown, resource exhaustion and transport faults.

use std::fmt;
use thiserror::Error;

/// Where an allocation was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    Host,
    Device(usize),
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLocation::Host => write!(f, "host"),
            MemoryLocation::Device(id) => write!(f, "device {id}"),
        }
    }
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any communication; no state was touched
    Configuration,
    /// Factorization stopped at a singular or indefinite pivot
    Numerical,
    /// Host or device memory exhausted; the matrix is invalid
    Resource,
    /// The message-passing layer failed; fatal for the whole computation
    Communication,
    /// The caller asked for something the object cannot do in its state
    Usage,
}

/// Core error type for tiled matrix operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction arguments or mismatched layouts
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid parameter provided to a kernel or helper
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Tile requested on a rank that does not own it
    #[error("Tile ({i}, {j}) is not local: owned by rank {owner}")]
    NotLocal { i: usize, j: usize, owner: usize },

    /// Local tile exists but has no backing storage yet
    #[error("Tile ({i}, {j}) has no storage; call allocate() first")]
    NotMaterialized { i: usize, j: usize },

    /// Effectively zero pivot during LU or band factorization
    #[error("Matrix is singular: zero pivot in panel {panel} at index {index}")]
    Singular { panel: usize, index: usize },

    /// Non-positive diagonal during Cholesky
    #[error("Matrix is not positive definite: leading minor of order {index} (panel {panel})")]
    NotPositiveDefinite { panel: usize, index: usize },

    /// Memory exhaustion on host or device
    #[error("Out of memory on {location}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        location: MemoryLocation,
        requested: usize,
        available: usize,
    },

    /// Message-passing failure
    #[error("Communication error: {0}")]
    Communication(String),

    /// Kernel fault reported by a device queue
    #[error("Device error: {0}")]
    Device(String),

    /// Operation not allowed in the object's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Threading or parallelization error
    #[error("Execution error: {0}")]
    Execution(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

// Helper functions for common error patterns

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfiguration(_) | Error::InvalidParameter(_) => {
                ErrorKind::Configuration
            }
            Error::Singular { .. } | Error::NotPositiveDefinite { .. } => ErrorKind::Numerical,
            Error::OutOfMemory { .. } | Error::Device(_) | Error::Execution(_) => {
                ErrorKind::Resource
            }
            Error::Communication(_) => ErrorKind::Communication,
            Error::NotLocal { .. }
            | Error::NotMaterialized { .. }
            | Error::InvalidState(_)
            | Error::Other(_) => ErrorKind::Usage,
        }
    }

    /// Whether the error leaves the participating matrices unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Resource | ErrorKind::Communication | ErrorKind::Numerical
        )
    }

    /// Create an error for two layouts that should agree but do not
    pub fn layout_mismatch(expected: impl fmt::Debug, actual: impl fmt::Debug, context: &str) -> Self {
        Self::InvalidConfiguration(format!(
            "Layout mismatch in {context}: expected {expected:?}, got {actual:?}"
        ))
    }

    /// Create an error for size mismatch
    pub fn size_mismatch(expected: usize, actual: usize, context: &str) -> Self {
        Self::InvalidParameter(format!(
            "Size mismatch in {context}: expected {expected}, got {actual}"
        ))
    }

    /// Create an error for a poisoned lock
    pub fn poisoned(what: &str) -> Self {
        Self::Execution(format!("{what} lock poisoned"))
    }

    /// Host allocation failure for `count` elements of `elem_size` bytes
    pub fn host_oom(count: usize, elem_size: usize) -> Self {
        Self::OutOfMemory {
            location: MemoryLocation::Host,
            requested: count.saturating_mul(elem_size),
            available: 0,
        }
    }
}
