//! Application image format: header types, metadata and integrity check.

pub mod constants;
pub mod header;
pub mod verify;

pub use constants::HEADER_MIN_BYTES;
pub use header::{AppDescriptor, FirmwareVersion, HeaderError, ImageHeader, ImageMetadata, SegmentHeader};
pub use verify::{ImageBuilder, ValidationFault, VerifiedImage, verify_image, verify_image_prefix};
