//! Local image transport for `file://` URLs.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tracing::info;

use super::traits::{ImageTransport, TransportError, TransportOptions};

#[derive(Default)]
pub struct FileTransport {
    file: Option<File>,
    len: Option<u64>,
    received: u64,
    eof: bool,
}

impl FileTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl ImageTransport for FileTransport {
    fn open(&mut self, url: &str, _options: &TransportOptions) -> Result<(), TransportError> {
        let path = Self::path_of(url);
        let open_failed = |e: std::io::Error| TransportError::OpenFailed {
            url: url.to_string(),
            message: e.to_string(),
        };
        let file = File::open(&path).map_err(open_failed)?;
        let len = file.metadata().map_err(open_failed)?.len();
        info!(path = %path.display(), len, "Streaming image from file");

        self.file = Some(file);
        self.len = Some(len);
        self.received = 0;
        self.eof = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::NotConnected)?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
            }
        }
        self.received += filled as u64;
        Ok(filled)
    }

    fn is_complete(&self) -> bool {
        self.eof && self.len == Some(self.received)
    }

    fn content_length(&self) -> Option<u64> {
        self.len
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![0x5A; 2500]).unwrap();

        let mut t = FileTransport::new();
        t.open(&format!("file://{}", path.display()), &TransportOptions::default())
            .unwrap();
        assert_eq!(t.content_length(), Some(2500));

        let mut buf = [0u8; 1024];
        let sizes: Vec<usize> = std::iter::from_fn(|| match t.read(&mut buf).unwrap() {
            0 => None,
            n => Some(n),
        })
        .collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert!(t.is_complete());
    }

    #[test]
    fn test_missing_file() {
        let mut t = FileTransport::new();
        assert!(matches!(
            t.open("file:///nonexistent/fw.bin", &TransportOptions::default()),
            Err(TransportError::OpenFailed { .. })
        ));
    }
}
