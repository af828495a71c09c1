//! Application image format constants.
//!
//! Layout follows the ESP-IDF application image: image header, segment
//! headers with their data, checksum byte and an optional SHA-256 digest.

// ============================================================================
// Image Header
// ============================================================================

/// First byte of every application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Size of the image header (24 bytes).
pub const IMAGE_HEADER_SIZE: usize = 24;

/// Upper bound on the segment count accepted by the verifier.
pub const MAX_SEGMENTS: u8 = 16;

/// Offset of the `hash_appended` flag inside the image header.
pub const HASH_APPENDED_OFFSET: usize = 23;

// ============================================================================
// Segments
// ============================================================================

/// Size of a segment header (load address + data length).
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Checksum seed; the checksum is this value XORed with every segment byte.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Image length (including the checksum byte) is padded to this alignment.
pub const CHECKSUM_ALIGN: usize = 16;

/// Length of the appended SHA-256 digest.
pub const HASH_LEN: usize = 32;

// ============================================================================
// Application Descriptor
// ============================================================================

/// Magic word at the start of the application descriptor.
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

/// Size of the application descriptor (256 bytes).
pub const APP_DESC_SIZE: usize = 256;

/// Width of the version field, compared byte-exact including padding.
pub const VERSION_LEN: usize = 32;
pub const PROJECT_NAME_LEN: usize = 32;
pub const TIME_LEN: usize = 16;
pub const DATE_LEN: usize = 16;
pub const IDF_VER_LEN: usize = 32;

/// Offset of the descriptor inside an image (after the image and first segment headers).
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE;

/// Offset of the version field inside an image.
pub const VERSION_OFFSET: usize = APP_DESC_OFFSET + 16;

/// Bytes the first chunk must carry before metadata can be extracted.
pub const HEADER_MIN_BYTES: usize = IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE + APP_DESC_SIZE;
