//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or payload handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame header: checksum {checksum:#04x} does not match type tag {type_tag}")]
    MalformedHeader { type_tag: u8, checksum: u8 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("stream assembler stopped after a fatal framing error")]
    Poisoned,

    #[error("payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedHeader { .. }
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::Poisoned
                | ProtocolError::Io(_)
        )
    }
}

/// Error codes carried by error responses.
///
/// The numeric values are part of the protocol contract. Codes this build
/// does not know about are kept as [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Query and request errors
    Operation,
    NumArguments,
    Type,
    Value,
    Overflow,
    ZeroDivision,
    MaxQuota,
    Auth,
    Forbidden,
    Lookup,
    BadData,
    Syntax,
    Node,
    Assertion,

    // Node internal errors
    ResultTooLarge,
    RequestTimeout,
    RequestCancel,
    WriteUv,
    Memory,
    Internal,

    Other(i64),
}

impl ErrorCode {
    /// Maps a wire code to an error code.
    pub fn from_code(code: i64) -> Self {
        match code {
            -63 => ErrorCode::Operation,
            -62 => ErrorCode::NumArguments,
            -61 => ErrorCode::Type,
            -60 => ErrorCode::Value,
            -59 => ErrorCode::Overflow,
            -58 => ErrorCode::ZeroDivision,
            -57 => ErrorCode::MaxQuota,
            -56 => ErrorCode::Auth,
            -55 => ErrorCode::Forbidden,
            -54 => ErrorCode::Lookup,
            -53 => ErrorCode::BadData,
            -52 => ErrorCode::Syntax,
            -51 => ErrorCode::Node,
            -50 => ErrorCode::Assertion,
            -6 => ErrorCode::ResultTooLarge,
            -5 => ErrorCode::RequestTimeout,
            -4 => ErrorCode::RequestCancel,
            -3 => ErrorCode::WriteUv,
            -2 => ErrorCode::Memory,
            -1 => ErrorCode::Internal,
            other => ErrorCode::Other(other),
        }
    }

    /// Returns the wire code.
    pub fn code(&self) -> i64 {
        match self {
            ErrorCode::Operation => -63,
            ErrorCode::NumArguments => -62,
            ErrorCode::Type => -61,
            ErrorCode::Value => -60,
            ErrorCode::Overflow => -59,
            ErrorCode::ZeroDivision => -58,
            ErrorCode::MaxQuota => -57,
            ErrorCode::Auth => -56,
            ErrorCode::Forbidden => -55,
            ErrorCode::Lookup => -54,
            ErrorCode::BadData => -53,
            ErrorCode::Syntax => -52,
            ErrorCode::Node => -51,
            ErrorCode::Assertion => -50,
            ErrorCode::ResultTooLarge => -6,
            ErrorCode::RequestTimeout => -5,
            ErrorCode::RequestCancel => -4,
            ErrorCode::WriteUv => -3,
            ErrorCode::Memory => -2,
            ErrorCode::Internal => -1,
            ErrorCode::Other(code) => *code,
        }
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Node
                | ErrorCode::RequestTimeout
                | ErrorCode::RequestCancel
                | ErrorCode::WriteUv
                | ErrorCode::Memory
        )
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        ErrorCode::from_code(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Operation => write!(f, "OPERATION_ERROR"),
            ErrorCode::NumArguments => write!(f, "NUM_ARGUMENTS"),
            ErrorCode::Type => write!(f, "TYPE_ERROR"),
            ErrorCode::Value => write!(f, "VALUE_ERROR"),
            ErrorCode::Overflow => write!(f, "OVERFLOW"),
            ErrorCode::ZeroDivision => write!(f, "ZERO_DIV"),
            ErrorCode::MaxQuota => write!(f, "MAX_QUOTA"),
            ErrorCode::Auth => write!(f, "AUTH_ERROR"),
            ErrorCode::Forbidden => write!(f, "FORBIDDEN"),
            ErrorCode::Lookup => write!(f, "LOOKUP_ERROR"),
            ErrorCode::BadData => write!(f, "BAD_DATA"),
            ErrorCode::Syntax => write!(f, "SYNTAX_ERROR"),
            ErrorCode::Node => write!(f, "NODE_ERROR"),
            ErrorCode::Assertion => write!(f, "ASSERT_ERROR"),
            ErrorCode::ResultTooLarge => write!(f, "RESULT_TOO_LARGE"),
            ErrorCode::RequestTimeout => write!(f, "REQUEST_TIMEOUT"),
            ErrorCode::RequestCancel => write!(f, "REQUEST_CANCEL"),
            ErrorCode::WriteUv => write!(f, "WRITE_UV"),
            ErrorCode::Memory => write!(f, "MEMORY"),
            ErrorCode::Internal => write!(f, "INTERNAL"),
            ErrorCode::Other(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        for code in (-63..=-50).chain(-6..=-1) {
            let mapped = ErrorCode::from_code(code);
            assert!(!matches!(mapped, ErrorCode::Other(_)), "code {}", code);
            assert_eq!(mapped.code(), code);
        }

        assert_eq!(ErrorCode::from_code(-52), ErrorCode::Syntax);
        assert_eq!(ErrorCode::from(-1), ErrorCode::Internal);
    }

    #[test]
    fn test_unknown_error_code_preserved() {
        let code = ErrorCode::from_code(-7);
        assert_eq!(code, ErrorCode::Other(-7));
        assert_eq!(code.code(), -7);
        assert_eq!(code.to_string(), "UNKNOWN(-7)");
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::Node.is_retryable());
        assert!(ErrorCode::RequestTimeout.is_retryable());

        assert!(!ErrorCode::Syntax.is_retryable());
        assert!(!ErrorCode::Auth.is_retryable());
        assert!(!ErrorCode::Forbidden.is_retryable());
        assert!(!ErrorCode::Other(5).is_retryable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::Operation.to_string(), "OPERATION_ERROR");
        assert_eq!(ErrorCode::ZeroDivision.to_string(), "ZERO_DIV");
        assert_eq!(ErrorCode::Lookup.to_string(), "LOOKUP_ERROR");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::MalformedHeader {
            type_tag: 0x42,
            checksum: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("checksum"));
        assert!(msg.contains("66"));
        assert!(err.is_fatal());

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
        assert!(err.is_fatal());
    }
}
