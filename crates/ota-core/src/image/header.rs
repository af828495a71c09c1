//! Typed views of the image header, segment header and application descriptor.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), HeaderError> {
    if data.len() < expected {
        return Err(HeaderError::BufferTooSmall {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u8; N], HeaderError> {
    let mut buf = [0u8; N];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// NUL-terminated fixed field rendered as text.
fn fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub(crate) fn fixed_field<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Fixed-width firmware version identifier.
///
/// Equality is byte-exact over all 32 bytes, trailing padding included.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareVersion([u8; VERSION_LEN]);

impl FirmwareVersion {
    /// Build a version from a label, zero-padded (or truncated) to the field width.
    pub fn new(label: &str) -> Self {
        Self(fixed_field(label))
    }

    pub fn from_raw(raw: [u8; VERSION_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; VERSION_LEN] {
        &self.0
    }

    /// Label up to the first NUL byte.
    pub fn label(&self) -> String {
        fixed_str(&self.0)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareVersion({:?})", self.label())
    }
}

/// Image header (24 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub spi_mode: u8,
    /// Flash speed (low nibble) and size (high nibble).
    pub spi_speed_size: u8,
    pub entry_addr: u32,
    pub wp_pin: u8,
    pub spi_pin_drv: [u8; 3],
    pub chip_id: u16,
    pub min_chip_rev: u8,
    pub min_chip_rev_full: u16,
    pub max_chip_rev_full: u16,
    pub reserved: [u8; 4],
    pub hash_appended: u8,
}

impl ImageHeader {
    pub const SIZE: usize = IMAGE_HEADER_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            magic: cursor.read_u8()?,
            segment_count: cursor.read_u8()?,
            spi_mode: cursor.read_u8()?,
            spi_speed_size: cursor.read_u8()?,
            entry_addr: cursor.read_u32::<LittleEndian>()?,
            wp_pin: cursor.read_u8()?,
            spi_pin_drv: read_array(&mut cursor)?,
            chip_id: cursor.read_u16::<LittleEndian>()?,
            min_chip_rev: cursor.read_u8()?,
            min_chip_rev_full: cursor.read_u16::<LittleEndian>()?,
            max_chip_rev_full: cursor.read_u16::<LittleEndian>()?,
            reserved: read_array(&mut cursor)?,
            hash_appended: cursor.read_u8()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.magic);
        buf.push(self.segment_count);
        buf.push(self.spi_mode);
        buf.push(self.spi_speed_size);
        buf.write_u32::<LittleEndian>(self.entry_addr).unwrap();
        buf.push(self.wp_pin);
        buf.extend_from_slice(&self.spi_pin_drv);
        buf.write_u16::<LittleEndian>(self.chip_id).unwrap();
        buf.push(self.min_chip_rev);
        buf.write_u16::<LittleEndian>(self.min_chip_rev_full).unwrap();
        buf.write_u16::<LittleEndian>(self.max_chip_rev_full).unwrap();
        buf.extend_from_slice(&self.reserved);
        buf.push(self.hash_appended);
        buf
    }

    pub fn has_hash(&self) -> bool {
        self.hash_appended == 1
    }
}

/// Segment header (8 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    pub load_addr: u32,
    pub data_len: u32,
}

impl SegmentHeader {
    pub const SIZE: usize = SEGMENT_HEADER_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            load_addr: cursor.read_u32::<LittleEndian>()?,
            data_len: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.load_addr).unwrap();
        buf.write_u32::<LittleEndian>(self.data_len).unwrap();
        buf
    }
}

/// Application descriptor (256 bytes), embedded at the start of the first segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub magic: u32,
    pub secure_version: u32,
    pub version: FirmwareVersion,
    pub project_name: [u8; PROJECT_NAME_LEN],
    pub time: [u8; TIME_LEN],
    pub date: [u8; DATE_LEN],
    pub idf_ver: [u8; IDF_VER_LEN],
    pub app_elf_sha256: [u8; HASH_LEN],
}

impl AppDescriptor {
    pub const SIZE: usize = APP_DESC_SIZE;

    pub fn new(version: &str, project_name: &str) -> Self {
        Self {
            magic: APP_DESC_MAGIC,
            secure_version: 0,
            version: FirmwareVersion::new(version),
            project_name: fixed_field(project_name),
            time: [0; TIME_LEN],
            date: [0; DATE_LEN],
            idf_ver: [0; IDF_VER_LEN],
            app_elf_sha256: [0; HASH_LEN],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        let secure_version = cursor.read_u32::<LittleEndian>()?;
        // reserv1[2]
        cursor.set_position(cursor.position() + 8);
        Ok(Self {
            magic,
            secure_version,
            version: FirmwareVersion::from_raw(read_array(&mut cursor)?),
            project_name: read_array(&mut cursor)?,
            time: read_array(&mut cursor)?,
            date: read_array(&mut cursor)?,
            idf_ver: read_array(&mut cursor)?,
            app_elf_sha256: read_array(&mut cursor)?,
        })
    }

    /// Parse the descriptor out of the first bytes of an image.
    pub fn from_image_prefix(data: &[u8]) -> Result<Self, HeaderError> {
        ensure_len(data, HEADER_MIN_BYTES)?;
        Self::from_bytes(&data[APP_DESC_OFFSET..HEADER_MIN_BYTES])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.magic).unwrap();
        buf.write_u32::<LittleEndian>(self.secure_version).unwrap();
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(&self.project_name);
        buf.extend_from_slice(&self.time);
        buf.extend_from_slice(&self.date);
        buf.extend_from_slice(&self.idf_ver);
        buf.extend_from_slice(&self.app_elf_sha256);
        buf.resize(Self::SIZE, 0);
        buf
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == APP_DESC_MAGIC
    }
}

/// Identity metadata captured once from an incoming image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub version: FirmwareVersion,
    pub project_name: String,
    pub secure_version: u32,
    pub build_date: String,
    pub build_time: String,
    pub idf_version: String,
}

impl From<&AppDescriptor> for ImageMetadata {
    fn from(desc: &AppDescriptor) -> Self {
        Self {
            version: desc.version,
            project_name: fixed_str(&desc.project_name),
            secure_version: desc.secure_version,
            build_date: fixed_str(&desc.date),
            build_time: fixed_str(&desc.time),
            idf_version: fixed_str(&desc.idf_ver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_padding_is_significant() {
        let a = FirmwareVersion::new("v1.0");
        let mut raw = *a.as_bytes();
        raw[31] = b' ';
        let b = FirmwareVersion::from_raw(raw);

        assert_eq!(a.label(), "v1.0");
        assert_eq!(b.label(), "v1.0");
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_truncates_long_label() {
        let long = "x".repeat(40);
        let v = FirmwareVersion::new(&long);
        assert_eq!(v.label().len(), VERSION_LEN);
    }

    #[test]
    fn test_image_header_layout() {
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            segment_count: 2,
            entry_addr: 0x4008_0000,
            hash_appended: 1,
            ..Default::default()
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), ImageHeader::SIZE);
        assert_eq!(bytes[HASH_APPENDED_OFFSET], 1);

        let parsed = ImageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.has_hash());
    }

    #[test]
    fn test_descriptor_version_offset() {
        let desc = AppDescriptor::new("2.1.0", "blink");
        let mut image = vec![0u8; APP_DESC_OFFSET];
        image.extend_from_slice(&desc.to_bytes());

        assert_eq!(&image[VERSION_OFFSET..VERSION_OFFSET + 5], b"2.1.0");

        let parsed = AppDescriptor::from_image_prefix(&image).unwrap();
        assert!(parsed.is_valid_magic());
        let meta = ImageMetadata::from(&parsed);
        assert_eq!(meta.version, FirmwareVersion::new("2.1.0"));
        assert_eq!(meta.project_name, "blink");
    }

    #[test]
    fn test_descriptor_too_short() {
        let err = AppDescriptor::from_image_prefix(&[0u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::BufferTooSmall {
                expected: HEADER_MIN_BYTES,
                actual: 100
            }
        ));
    }
}
