//! HTTP(S) image transport built on `reqwest::blocking`.

use std::io::{ErrorKind, Read};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::{debug, info};

use super::traits::{ImageTransport, TransportError, TransportOptions};

/// Downloads an image with a single GET request.
///
/// When a server certificate is configured it becomes the only trusted root.
#[derive(Default)]
pub struct HttpTransport {
    response: Option<Response>,
    content_length: Option<u64>,
    timeout_ms: u64,
    received: u64,
    eof: bool,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_client(options: &TransportOptions) -> Result<Client, TransportError> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout);

        if options.keep_alive {
            builder = builder.tcp_keepalive(Some(Duration::from_secs(60)));
        } else {
            builder = builder.pool_max_idle_per_host(0);
        }

        if let Some(pem) = &options.server_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| TransportError::Credential(e.to_string()))?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| TransportError::Credential(e.to_string()))
    }

    fn map_io(&self, e: std::io::Error) -> TransportError {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout {
                timeout_ms: self.timeout_ms,
            },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::ConnectionReset,
            ErrorKind::NotConnected => TransportError::NotConnected,
            _ => TransportError::ReadFailed(e.to_string()),
        }
    }
}

impl ImageTransport for HttpTransport {
    fn open(&mut self, url: &str, options: &TransportOptions) -> Result<(), TransportError> {
        self.close();
        self.timeout_ms = options.timeout.as_millis() as u64;
        self.received = 0;
        self.eof = false;
        self.content_length = None;

        let client = Self::build_client(options)?;
        info!(url, "Connecting to update server");
        let timeout_ms = self.timeout_ms;
        let response = client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout { timeout_ms }
            } else {
                TransportError::OpenFailed {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        self.content_length = response.content_length();
        debug!(status = status.as_u16(), content_length = ?self.content_length, "Response received");
        self.response = Some(response);
        Ok(())
    }

    /// Fills `buf` completely unless the body ends first.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let response = self.response.as_mut().ok_or(TransportError::NotConnected)?;
            match response.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.map_io(e)),
            }
        }
        self.received += filled as u64;
        Ok(filled)
    }

    fn is_complete(&self) -> bool {
        self.eof && self.content_length().is_none_or(|len| len == self.received)
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn close(&mut self) {
        if self.response.take().is_some() {
            debug!(received = self.received, "Connection closed");
        }
    }
}
