//! Image Stream Parser.
//!
//! Watches the first chunk of an incoming image for the header region and
//! captures the embedded metadata exactly once. Every byte is passed through
//! unchanged; accepting or rejecting the image is the version gate's job.

use thiserror::Error;
use tracing::{debug, warn};

use crate::image::constants::IMAGE_MAGIC;
use crate::image::{AppDescriptor, HEADER_MIN_BYTES, ImageHeader, ImageMetadata};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedStream {
    #[error("First chunk holds {got} bytes, header needs {needed}")]
    HeaderTooShort { needed: usize, got: usize },
    #[error("Stream ended before any image data arrived")]
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    AwaitingHeader,
    HeaderParsed,
}

/// Result of feeding one chunk.
#[derive(Debug)]
pub struct Fed<'a> {
    /// Metadata, set only on the chunk that completed the header.
    pub captured: Option<ImageMetadata>,
    /// Bytes to hand to the write pipeline.
    pub bytes: &'a [u8],
}

pub struct ImageStreamParser {
    state: ParserState,
    metadata: Option<ImageMetadata>,
    consumed: u64,
}

impl Default for ImageStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStreamParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::AwaitingHeader,
            metadata: None,
            consumed: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn metadata(&self) -> Option<&ImageMetadata> {
        self.metadata.as_ref()
    }

    /// Total bytes passed through so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Feed the next chunk.
    ///
    /// The header is never assembled across chunks: a first chunk shorter than
    /// [`HEADER_MIN_BYTES`] is a malformed stream.
    pub fn feed<'a>(&mut self, chunk: &'a [u8]) -> Result<Fed<'a>, MalformedStream> {
        let mut captured = None;
        if self.state == ParserState::AwaitingHeader {
            let metadata = parse_header(chunk)?;
            debug!(version = %metadata.version, project = %metadata.project_name, "Header parsed");
            self.metadata = Some(metadata.clone());
            self.state = ParserState::HeaderParsed;
            captured = Some(metadata);
        }
        self.consumed += chunk.len() as u64;
        Ok(Fed {
            captured,
            bytes: chunk,
        })
    }
}

/// Extract metadata from the header region at the start of `chunk`.
pub fn parse_header(chunk: &[u8]) -> Result<ImageMetadata, MalformedStream> {
    if chunk.is_empty() {
        return Err(MalformedStream::NoData);
    }
    let too_short = || MalformedStream::HeaderTooShort {
        needed: HEADER_MIN_BYTES,
        got: chunk.len(),
    };
    let header = ImageHeader::from_bytes(chunk).map_err(|_| too_short())?;
    let descriptor = AppDescriptor::from_image_prefix(chunk).map_err(|_| too_short())?;

    // Structural problems are left to the integrity check at finalize.
    if header.magic != IMAGE_MAGIC {
        warn!(magic = %format!("0x{:02X}", header.magic), "Unexpected image magic");
    }
    if !descriptor.is_valid_magic() {
        warn!(magic = %format!("0x{:08X}", descriptor.magic), "Unexpected descriptor magic");
    }
    Ok(ImageMetadata::from(&descriptor))
}
