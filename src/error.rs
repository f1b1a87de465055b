//! Error taxonomy shared by the codecs and the proxy engine.

use thiserror::Error;

/// Failures converting between filter text, the filter AST and BER packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Malformed textual filter.
    #[error("filter parse error at offset {offset}: {reason}")]
    Parse { offset: usize, reason: String },

    /// Malformed BER: wrong arity, unknown tag, missing or truncated field.
    #[error("BER decode error: {0}")]
    Decode(String),

    /// Invariant violation while encoding. Never expected for well-formed values.
    #[error("BER encode error: {0}")]
    Encode(String),
}

impl CodecError {
    pub(crate) fn parse(offset: usize, reason: impl Into<String>) -> Self {
        CodecError::Parse {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        CodecError::Decode(reason.into())
    }
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Failures on either leg of a proxied session.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {addr} failed: {reason}")]
    Tls { addr: String, reason: String },

    #[error("{0} connection closed")]
    Closed(&'static str),

    #[error("{side} sent a {len} byte message, limit is {max}")]
    FrameTooLarge {
        side: &'static str,
        len: usize,
        max: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = CodecError::parse(3, "missing operator");
        assert_eq!(err.to_string(), "filter parse error at offset 3: missing operator");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_codec_error_converts() {
        let err: ProxyError = CodecError::decode("unknown tag").into();
        assert_eq!(err.to_string(), "BER decode error: unknown tag");
    }

    #[test]
    fn test_errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CodecError>();
        assert_send_sync::<ProxyError>();
    }
}
