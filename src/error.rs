//! Error types for the transport layer
//!
//! Provides typed error handling throughout the crate, eliminating the use
//! of generic String errors and unwrap() calls. Every failure is local to
//! one connection; nothing here is ever fatal to a worker or the pool.

use rustls::pki_types::CertificateDer;
use thiserror::Error;

/// Main error type for transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    // ========================================
    // Transport Faults
    // ========================================

    #[error("Failed to connect to {host}:{port} - {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout {
        timeout_secs: u64,
    },

    #[error("Connection closed by remote host")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================
    // Protocol Violations
    // ========================================

    #[error("Bundle too large: {size} bytes (max: {max})")]
    BundleTooLarge {
        size: usize,
        max: usize,
    },

    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("Bundle send queue full: {queued} frames pending")]
    SendQueueFull {
        queued: usize,
    },

    // ========================================
    // TLS Errors
    // ========================================

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Untrusted peer certificate chain ({} certificates)", chain.len())]
    UntrustedCertificate {
        chain: Vec<CertificateDer<'static>>,
    },

    // ========================================
    // Compression Errors
    // ========================================

    #[error("Compression error: {0}")]
    Compression(String),

    // ========================================
    // Generic Errors
    // ========================================

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_connection_failed_error() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::ConnectionFailed {
            host: "localhost".to_string(),
            port: 4000,
            source: io_err,
        };

        assert!(err.to_string().contains("localhost:4000"));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_bundle_too_large_error() {
        let err = TransportError::BundleTooLarge {
            size: 70_000_000,
            max: 67_108_864,
        };

        assert!(err.to_string().contains("70000000"));
        assert!(err.to_string().contains("67108864"));
    }

    #[test]
    fn test_untrusted_certificate_carries_chain() {
        let chain = vec![CertificateDer::from(vec![0x30, 0x82])];
        let err = TransportError::UntrustedCertificate { chain };

        assert!(err.to_string().contains("1 certificates"));

        // The chain must remain accessible for manual-trust handling
        if let TransportError::UntrustedCertificate { chain } = err {
            assert_eq!(chain.len(), 1);
            assert_eq!(chain[0].as_ref(), &[0x30, 0x82]);
        } else {
            panic!("Should match UntrustedCertificate");
        }
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = IoError::new(ErrorKind::NotFound, "not found");
        let err = TransportError::ConnectionFailed {
            host: "game.example.com".to_string(),
            port: 7777,
            source: io_err,
        };

        assert!(std::error::Error::source(&err).is_some());
    }
}
