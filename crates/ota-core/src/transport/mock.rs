//! Mock image transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{ImageTransport, TransportError, TransportOptions};

/// One scripted read result.
#[derive(Debug, Clone)]
pub enum MockRead {
    /// Deliver these bytes, split across reads if the buffer is smaller.
    Data(Vec<u8>),
    /// Report end of data.
    Empty,
    /// Fail the read.
    Fail(TransportError),
}

/// Scripted transport. Clones share state so tests can inspect it after the
/// transport has been handed to the sequencer.
#[derive(Clone, Default)]
pub struct MockTransport {
    /// Queued read results.
    script: Arc<Mutex<VecDeque<MockRead>>>,
    /// URLs passed to open.
    opened: Arc<Mutex<Vec<String>>>,
    /// Number of close calls.
    closed: Arc<Mutex<usize>>,
    /// Whether a connection is currently open.
    connected: Arc<Mutex<bool>>,
    /// Bytes delivered so far.
    delivered: Arc<Mutex<u64>>,
    content_length: Option<u64>,
    open_error: Option<TransportError>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `image` in chunks of `chunk` bytes, declaring its length.
    pub fn from_image(image: &[u8], chunk: usize) -> Self {
        let mock = Self::new().with_content_length(image.len() as u64);
        for part in image.chunks(chunk) {
            mock.push(MockRead::Data(part.to_vec()));
        }
        mock
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    /// Make `open` fail.
    pub fn fail_open(mut self, error: TransportError) -> Self {
        self.open_error = Some(error);
        self
    }

    /// Queue a read result.
    pub fn push(&self, read: MockRead) {
        self.script.lock().unwrap().push_back(read);
    }

    /// URLs passed to `open`.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        *self.closed.lock().unwrap()
    }

    pub fn delivered(&self) -> u64 {
        *self.delivered.lock().unwrap()
    }
}

impl ImageTransport for MockTransport {
    fn open(&mut self, url: &str, _options: &TransportOptions) -> Result<(), TransportError> {
        self.opened.lock().unwrap().push(url.to_string());
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            None | Some(MockRead::Empty) => Ok(0),
            Some(MockRead::Fail(e)) => Err(e),
            Some(MockRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    script.push_front(MockRead::Data(data[n..].to_vec()));
                }
                *self.delivered.lock().unwrap() += n as u64;
                Ok(n)
            }
        }
    }

    fn is_complete(&self) -> bool {
        let drained = !self
            .script
            .lock()
            .unwrap()
            .iter()
            .any(|r| matches!(r, MockRead::Data(_)));
        let delivered = *self.delivered.lock().unwrap();
        drained && self.content_length.is_none_or(|len| len == delivered)
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn close(&mut self) {
        *self.connected.lock().unwrap() = false;
        *self.closed.lock().unwrap() += 1;
    }
}
