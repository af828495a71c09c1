//! Image transport abstraction.
//!
//! Defines the `ImageTransport` trait the update flow pulls bytes through,
//! and the completion policy that tells a finished download from a dropped one.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to open {url}: {message}")]
    OpenFailed { url: String, message: String },

    #[error("Invalid server credential: {0}")]
    Credential(String),

    #[error("Connection not open")]
    NotConnected,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transfer incomplete: received {received} bytes (expected {expected:?})")]
    Incomplete { received: u64, expected: Option<u64> },

    #[error("Server responded with status {0}")]
    Status(u16),
}

impl TransportError {
    /// Whether the peer closed or dropped the connection.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionReset | TransportError::NotConnected
        )
    }
}

/// Options passed to [`ImageTransport::open`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// PEM encoded certificate the server must present.
    pub server_cert_pem: Option<Vec<u8>>,
    /// Bound on connecting and on each read.
    pub timeout: Duration,
    pub keep_alive: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            server_cert_pem: None,
            timeout: Duration::from_millis(5000),
            keep_alive: true,
        }
    }
}

/// Byte-stream source of an image.
///
/// `read` returns `Ok(0)` once the transport has nothing more to deliver;
/// whether that means the download finished is decided by a [`CompletionPolicy`].
pub trait ImageTransport: Send {
    fn open(&mut self, url: &str, options: &TransportOptions) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Whether the whole response body has been received.
    fn is_complete(&self) -> bool;

    /// Declared body length, when the server sent one.
    fn content_length(&self) -> Option<u64> {
        None
    }

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);
}

impl<T: ImageTransport + ?Sized> ImageTransport for Box<T> {
    fn open(&mut self, url: &str, options: &TransportOptions) -> Result<(), TransportError> {
        (**self).open(url, options)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn is_complete(&self) -> bool {
        (**self).is_complete()
    }

    fn content_length(&self) -> Option<u64> {
        (**self).content_length()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// How the end of a download is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionPolicy {
    /// A read returning fewer bytes than the buffer holds is the last one.
    ShortChunk,
    /// Read until the transport reports end of data, then require it to
    /// report the body complete.
    #[default]
    ContentComplete,
}

/// What to do with one read result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStep {
    /// `len` bytes arrived; `last` marks the final chunk.
    Data { len: usize, last: bool },
    /// Nothing more will arrive.
    End,
}

impl CompletionPolicy {
    /// Classify the outcome of a read of at most `capacity` bytes after
    /// `received` bytes have already arrived.
    ///
    /// A read error is always fatal; a reset never counts as end of data.
    pub fn classify<T: ImageTransport + ?Sized>(
        &self,
        transport: &T,
        read: Result<usize, TransportError>,
        capacity: usize,
        received: u64,
    ) -> Result<StreamStep, TransportError> {
        let n = read?;
        match self {
            CompletionPolicy::ShortChunk => Ok(match n {
                0 => StreamStep::End,
                n => StreamStep::Data {
                    len: n,
                    last: n < capacity,
                },
            }),
            CompletionPolicy::ContentComplete => {
                if n > 0 {
                    return Ok(StreamStep::Data { len: n, last: false });
                }
                if transport.is_complete() {
                    Ok(StreamStep::End)
                } else {
                    Err(TransportError::Incomplete {
                        received,
                        expected: transport.content_length(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_short_chunk_policy() {
        let t = MockTransport::new();
        let policy = CompletionPolicy::ShortChunk;
        assert_eq!(
            policy.classify(&t, Ok(1024), 1024, 0),
            Ok(StreamStep::Data { len: 1024, last: false })
        );
        assert_eq!(
            policy.classify(&t, Ok(512), 1024, 2048),
            Ok(StreamStep::Data { len: 512, last: true })
        );
        assert_eq!(policy.classify(&t, Ok(0), 1024, 2560), Ok(StreamStep::End));
    }

    #[test]
    fn test_reset_is_never_completion() {
        let t = MockTransport::new();
        for policy in [CompletionPolicy::ShortChunk, CompletionPolicy::ContentComplete] {
            assert_eq!(
                policy.classify(&t, Err(TransportError::ConnectionReset), 1024, 1024),
                Err(TransportError::ConnectionReset)
            );
        }
    }

    #[test]
    fn test_content_complete_requires_completion() {
        let t = MockTransport::new().with_content_length(4096);
        let policy = CompletionPolicy::ContentComplete;
        assert_eq!(
            policy.classify(&t, Ok(0), 1024, 2048),
            Err(TransportError::Incomplete {
                received: 2048,
                expected: Some(4096)
            })
        );
    }
}
