//! Domain-specific error types.
//!
//! Uses `thiserror` for structured error definitions; every fallible surface
//! reports through one of these enums rather than panicking.

use thiserror::Error;

/// Errors from instruction construction and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstructionError {
    #[error("operand count mismatch for '{name}': expected {expected}, got {got}")]
    OperandCountMismatch {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("operand {index} of '{name}' does not accept this operand kind")]
    OperandKindMismatch { name: &'static str, index: usize },

    #[error("operand {index} of '{name}' must be a register")]
    RegisterExpected { name: &'static str, index: usize },

    #[error("write operand {index} of '{name}' must not be read-only")]
    ReadOnlyDestination { name: &'static str, index: usize },
}

/// Errors from the symbolic memory model.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("strict memory read missed the write log at +{offset} ({bit_count} bits)")]
    StrictMiss { offset: i64, bit_count: u32 },

    #[error("aliasing could not be resolved between two symbolic pointers")]
    AliasFailure,
}

/// Errors from the symbolic virtual machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("instruction '{0}' has no symbolic semantics")]
    Unsupported(&'static str),

    #[error("wide arithmetic beyond 64 bits at vip {0:#x}")]
    WideArithmetic(u64),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors from the binary container codec.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("malformed container: {0}")]
    Malformed(String),

    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),

    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}

/// Errors from the object pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted: {0} live objects")]
    Exhausted(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = MemoryError::StrictMiss {
            offset: 8,
            bit_count: 64,
        };
        assert!(e.to_string().contains("strict memory read"));

        let e = VmError::Unsupported("vemit");
        assert_eq!(e.to_string(), "instruction 'vemit' has no symbolic semantics");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InstructionError>();
        assert_send_sync::<MemoryError>();
        assert_send_sync::<VmError>();
        assert_send_sync::<SerializeError>();
    }
}
