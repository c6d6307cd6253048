//! Error types for tessera
//!
//! A single error enum covers every subsystem. Load and configuration
//! errors abort the whole load/setup step, shape and device errors abort
//! only the call that raised them, leaving prior state untouched.

use thiserror::Error;

/// Result type alias for tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Error type for all tessera operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TesseraError {
    /// Shape is invalid for the requested operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the problem
        reason: String,
    },

    /// Supplied data does not match the declared shape
    #[error("Data size {data_size} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Number of elements supplied
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Number of elements the shape requires
        expected: usize,
    },

    /// Logical shape needs more bytes than the tensor has reserved
    #[error("Capacity exceeded: need {required} bytes, have {capacity} (call expansion first)")]
    CapacityExceeded {
        /// Bytes required by the new shape
        required: usize,
        /// Bytes currently reserved
        capacity: usize,
    },

    /// Malformed or truncated weight file
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the problem
        reason: String,
    },

    /// Tensors taking part in one operation live on different devices
    #[error("Device mismatch in {operation}: {left} vs {right}")]
    DeviceMismatch {
        /// Operation that detected the mismatch
        operation: String,
        /// Device of the first tensor
        left: String,
        /// Device of the conflicting tensor
        right: String,
    },

    /// Attempt to move a host-locked tensor onto an accelerator
    #[error("Tensor is locked in CPU memory and cannot move to {target}")]
    LockedInCpu {
        /// Requested device
        target: String,
    },

    /// Invalid quantization parameters
    #[error("Quantization error: {reason}")]
    QuantizationError {
        /// Description of the problem
        reason: String,
    },

    /// Operation not supported for the given inputs
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Why it is not supported
        reason: String,
    },

    /// Invalid engine or generation configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Filesystem or mapping failure
    #[error("I/O error: {message}")]
    IoError {
        /// Underlying error message
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesseraError::CapacityExceeded {
            required: 64,
            capacity: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("32"));
        assert!(msg.contains("expansion"));
    }

    #[test]
    fn test_device_mismatch_display() {
        let err = TesseraError::DeviceMismatch {
            operation: "cat_direct".to_string(),
            left: "cpu".to_string(),
            right: "cuda:0".to_string(),
        };
        assert_eq!(err.to_string(), "Device mismatch in cat_direct: cpu vs cuda:0");
    }

    #[test]
    fn test_invalid_configuration_display() {
        let err = TesseraError::InvalidConfiguration("temperature must be positive".to_string());
        assert!(err.to_string().contains("temperature"));
    }
}
