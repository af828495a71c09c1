//! Whole-image integrity check run when an update session is finalized.
//!
//! Walks the segment table, recomputes the XOR checksum and, when the header
//! says so, the appended SHA-256 digest. The image must end exactly where the
//! format says it ends.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::constants::*;
use super::header::{AppDescriptor, ImageHeader, ImageMetadata, SegmentHeader, fixed_field};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFault {
    #[error("Image is empty")]
    Empty,
    #[error("Invalid image magic: expected 0x{expected:02X}, got 0x{actual:02X}", expected = IMAGE_MAGIC)]
    BadMagic { actual: u8 },
    #[error("Invalid segment count {0}")]
    BadSegmentCount(u8),
    #[error("Application descriptor missing or corrupt")]
    BadDescriptor,
    #[error("Image truncated at offset {offset} (have {actual} bytes)")]
    Truncated { offset: usize, actual: usize },
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("SHA-256 digest mismatch")]
    DigestMismatch,
    #[error("Length mismatch: image is {expected} bytes, {actual} bytes written")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Facts established by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedImage {
    pub length: usize,
    pub segment_count: u8,
    pub checksum: u8,
    pub digest: Option<[u8; HASH_LEN]>,
    pub metadata: ImageMetadata,
}

fn truncated(offset: usize, data: &[u8]) -> ValidationFault {
    ValidationFault::Truncated {
        offset,
        actual: data.len(),
    }
}

/// Verify a complete image held in `data`.
pub fn verify_image(data: &[u8]) -> Result<VerifiedImage, ValidationFault> {
    let verified = verify_image_prefix(data)?;
    if data.len() != verified.length {
        return Err(ValidationFault::LengthMismatch {
            expected: verified.length,
            actual: data.len(),
        });
    }
    Ok(verified)
}

/// Verify the image at the start of `data`, ignoring anything after its end.
///
/// Used on whole slots, where the image is followed by erased flash.
pub fn verify_image_prefix(data: &[u8]) -> Result<VerifiedImage, ValidationFault> {
    if data.is_empty() {
        return Err(ValidationFault::Empty);
    }

    let header = ImageHeader::from_bytes(data).map_err(|_| truncated(0, data))?;
    if header.magic != IMAGE_MAGIC {
        return Err(ValidationFault::BadMagic {
            actual: header.magic,
        });
    }
    if header.segment_count == 0 || header.segment_count > MAX_SEGMENTS {
        return Err(ValidationFault::BadSegmentCount(header.segment_count));
    }

    let descriptor = AppDescriptor::from_image_prefix(data).map_err(|_| truncated(APP_DESC_OFFSET, data))?;
    if !descriptor.is_valid_magic() {
        return Err(ValidationFault::BadDescriptor);
    }

    let mut offset = ImageHeader::SIZE;
    let mut checksum = CHECKSUM_SEED;
    for index in 0..header.segment_count {
        let segment = data
            .get(offset..)
            .and_then(|rest| SegmentHeader::from_bytes(rest).ok())
            .ok_or_else(|| truncated(offset, data))?;
        offset += SegmentHeader::SIZE;

        let end = offset
            .checked_add(segment.data_len as usize)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| truncated(offset, data))?;

        checksum = data[offset..end].iter().fold(checksum, |acc, b| acc ^ b);
        debug!(
            index,
            load_addr = %format!("0x{:08X}", segment.load_addr),
            len = segment.data_len,
            "Segment verified"
        );
        offset = end;
    }

    // Checksum byte sits in the last byte of the 16-byte aligned block.
    let checksum_end = (offset + 1).div_ceil(CHECKSUM_ALIGN) * CHECKSUM_ALIGN;
    if checksum_end > data.len() {
        return Err(truncated(checksum_end - 1, data));
    }
    let stored = data[checksum_end - 1];
    if stored != checksum {
        return Err(ValidationFault::ChecksumMismatch {
            expected: checksum,
            actual: stored,
        });
    }

    let mut length = checksum_end;
    let mut digest = None;
    if header.has_hash() {
        length += HASH_LEN;
        if length > data.len() {
            return Err(truncated(checksum_end, data));
        }
        let computed: [u8; HASH_LEN] = Sha256::digest(&data[..checksum_end]).into();
        if computed[..] != data[checksum_end..length] {
            return Err(ValidationFault::DigestMismatch);
        }
        digest = Some(computed);
    }

    Ok(VerifiedImage {
        length,
        segment_count: header.segment_count,
        checksum,
        digest,
        metadata: ImageMetadata::from(&descriptor),
    })
}

/// Builds well-formed images, for host tooling and tests.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    descriptor: AppDescriptor,
    entry_addr: u32,
    segments: Vec<(u32, Vec<u8>)>,
    hash_appended: bool,
}

impl ImageBuilder {
    /// DROM load address of the first segment (the one carrying the descriptor).
    pub const DROM_ADDR: u32 = 0x3F40_0020;

    pub fn new(version: &str) -> Self {
        Self {
            descriptor: AppDescriptor::new(version, "app"),
            entry_addr: 0x4008_0000,
            segments: Vec::new(),
            hash_appended: true,
        }
    }

    pub fn project(mut self, name: &str) -> Self {
        self.descriptor.project_name = fixed_field(name);
        self
    }

    pub fn secure_version(mut self, secure_version: u32) -> Self {
        self.descriptor.secure_version = secure_version;
        self
    }

    /// Append a segment. The first segment's data follows the descriptor.
    pub fn segment(mut self, load_addr: u32, data: impl Into<Vec<u8>>) -> Self {
        self.segments.push((load_addr, data.into()));
        self
    }

    pub fn hash_appended(mut self, enabled: bool) -> Self {
        self.hash_appended = enabled;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut segments: Vec<(u32, Vec<u8>)> = Vec::with_capacity(self.segments.len() + 1);
        let mut drom = self.descriptor.to_bytes();
        let mut rest = self.segments.iter();
        if let Some((_, first)) = rest.next() {
            drom.extend_from_slice(first);
        }
        segments.push((Self::DROM_ADDR, drom));
        segments.extend(rest.cloned());

        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            segment_count: segments.len() as u8,
            spi_mode: 2,
            spi_speed_size: 0x20,
            entry_addr: self.entry_addr,
            wp_pin: 0xEE,
            hash_appended: u8::from(self.hash_appended),
            ..Default::default()
        };

        let mut image = header.to_bytes();
        let mut checksum = CHECKSUM_SEED;
        for (load_addr, data) in &segments {
            let seg = SegmentHeader {
                load_addr: *load_addr,
                data_len: data.len() as u32,
            };
            image.extend_from_slice(&seg.to_bytes());
            image.extend_from_slice(data);
            checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
        }

        let checksum_end = (image.len() + 1).div_ceil(CHECKSUM_ALIGN) * CHECKSUM_ALIGN;
        image.resize(checksum_end - 1, 0);
        image.push(checksum);

        if self.hash_appended {
            let digest = Sha256::digest(&image);
            image.extend_from_slice(&digest);
        }
        image
    }
}
