//! Engine Error Types
//!
//! # Overview
//!
//! One error enum covers every failure the engine can surface. Each variant
//! carries the context a caller needs to act on it, and the enum exposes a
//! stable numeric `code()` and a coarse `category()` for front ends that map
//! errors onto exit codes or log fields.
//!
//! All fallible operations return `EngineResult<T>`; internal helpers
//! propagate the first error they detect and never substitute values.
//!
//! # Example Usage
//!
//! ```no_run
//! use infercore::errors::{EngineError, EngineResult};
//!
//! fn check_dims(rows: usize, cols: usize) -> EngineResult<()> {
//!     if rows == 0 || cols == 0 {
//!         return Err(EngineError::InvalidShape {
//!             context: format!("matrix {}x{}", rows, cols),
//!         });
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error taxonomy
///
/// Variants correspond one-to-one to the failure kinds the public entry
/// points (forward, load, execute) may surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Out-of-range parameter or enum value
    #[error("invalid argument: {what}")]
    InvalidArgument { what: String },

    /// Dimensional mismatch between tensors, weights, or params
    #[error("invalid shape: {context}")]
    InvalidShape { context: String },

    /// File header inconsistent with the expected layout
    #[error("schema mismatch: {context}")]
    SchemaMismatch { context: String },

    /// Allocation request could not be satisfied
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Planned or observed memory exceeds the configured budget
    #[error("memory budget exceeded: need {required} bytes, budget {budget}")]
    BudgetExceeded { required: usize, budget: usize },

    /// A layer output does not fit the scheduler workspace
    #[error("workspace too small: layer needs {required} bytes, workspace {capacity}")]
    WorkspaceTooSmall { required: usize, capacity: usize },

    /// Dependency graph contains a cycle
    #[error("cycle detected at layer {layer}")]
    CycleDetected { layer: usize },

    /// A layer forward function reported failure
    #[error("layer {layer} ({name}) failed: {reason}")]
    LayerFailure {
        layer: usize,
        name: String,
        reason: String,
    },

    /// A compute kernel reported failure
    #[error("kernel '{op}' failed: {reason}")]
    KernelFailure { op: &'static str, reason: String },

    /// Disk read or write failed
    #[error("i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Unsupported layer kind or precision
    #[error("not implemented: {what}")]
    NotImplemented { what: String },
}

impl EngineError {
    /// Stable numeric code for programmatic handling
    pub fn code(&self) -> u32 {
        match self {
            EngineError::InvalidArgument { .. } => 1001,
            EngineError::InvalidShape { .. } => 1002,
            EngineError::SchemaMismatch { .. } => 1003,
            EngineError::OutOfMemory { .. } => 2001,
            EngineError::BudgetExceeded { .. } => 2002,
            EngineError::WorkspaceTooSmall { .. } => 2003,
            EngineError::CycleDetected { .. } => 3001,
            EngineError::LayerFailure { .. } => 3002,
            EngineError::KernelFailure { .. } => 3003,
            EngineError::IoFailure(_) => 4001,
            EngineError::NotImplemented { .. } => 9001,
        }
    }

    /// Coarse category for logging and exit-code mapping
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument { .. }
            | EngineError::InvalidShape { .. }
            | EngineError::SchemaMismatch { .. } => "Validation",

            EngineError::OutOfMemory { .. }
            | EngineError::BudgetExceeded { .. }
            | EngineError::WorkspaceTooSmall { .. } => "Resources",

            EngineError::CycleDetected { .. }
            | EngineError::LayerFailure { .. }
            | EngineError::KernelFailure { .. } => "Execution",

            EngineError::IoFailure(_) => "Io",

            EngineError::NotImplemented { .. } => "Unsupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = EngineError::InvalidShape {
            context: "2x0".into(),
        };
        assert_eq!(err.code(), 1002);

        let err = EngineError::CycleDetected { layer: 3 };
        assert_eq!(err.code(), 3001);
    }

    #[test]
    fn test_error_categories() {
        let err = EngineError::BudgetExceeded {
            required: 100,
            budget: 50,
        };
        assert_eq!(err.category(), "Resources");

        let err = EngineError::KernelFailure {
            op: "matmul_q4_vec",
            reason: "bad".into(),
        };
        assert_eq!(err.category(), "Execution");
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::WorkspaceTooSmall {
            required: 4096,
            capacity: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert_eq!(err.category(), "Io");
    }
}
