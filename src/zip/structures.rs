//! Binary records of the ZIP container format.
//!
//! Each record knows how to parse itself from a byte slice; offsets and
//! sizes are untrusted and validated by the caller against the source
//! length before use.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// ZIP compression methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, CompressionMethod::Unknown(_))
    }
}

/// End of Central Directory (EOCD) record, 22 bytes minimum.
#[derive(Debug)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::archive_open("invalid end of central directory"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let read = |c: &mut Cursor<&[u8]>| -> std::io::Result<Self> {
            Ok(Self {
                disk_number: c.read_u16::<LittleEndian>()?,
                disk_with_cd: c.read_u16::<LittleEndian>()?,
                disk_entries: c.read_u16::<LittleEndian>()?,
                total_entries: c.read_u16::<LittleEndian>()?,
                cd_size: c.read_u32::<LittleEndian>()?,
                cd_offset: c.read_u32::<LittleEndian>()?,
                comment_len: c.read_u16::<LittleEndian>()?,
            })
        };
        read(&mut cursor).map_err(|_| Error::archive_open("truncated end of central directory"))
    }

    /// Any sentinel field means the real values live in the ZIP64 EOCD.
    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFF_FFFF
            || self.cd_offset == 0xFFFF_FFFF
    }
}

/// ZIP64 End of Central Directory Locator, 20 bytes.
pub struct Zip64EocdLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EocdLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::archive_open("invalid ZIP64 locator"));
        }
        let mut c = Cursor::new(&data[4..]);
        let parse = |c: &mut Cursor<&[u8]>| -> std::io::Result<Self> {
            Ok(Self {
                disk_with_eocd64: c.read_u32::<LittleEndian>()?,
                eocd64_offset: c.read_u64::<LittleEndian>()?,
                total_disks: c.read_u32::<LittleEndian>()?,
            })
        };
        parse(&mut c).map_err(|_| Error::archive_open("truncated ZIP64 locator"))
    }
}

/// ZIP64 End of Central Directory record, 56 bytes minimum.
pub struct Zip64Eocd {
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64Eocd {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::archive_open("invalid ZIP64 end of central directory"));
        }
        let mut c = Cursor::new(&data[4..]);
        let parse = |c: &mut Cursor<&[u8]>| -> std::io::Result<Self> {
            let _eocd64_size = c.read_u64::<LittleEndian>()?;
            let _version_made_by = c.read_u16::<LittleEndian>()?;
            let _version_needed = c.read_u16::<LittleEndian>()?;
            let _disk_number = c.read_u32::<LittleEndian>()?;
            let _disk_with_cd = c.read_u32::<LittleEndian>()?;
            Ok(Zip64Eocd {
                disk_entries: c.read_u64::<LittleEndian>()?,
                total_entries: c.read_u64::<LittleEndian>()?,
                cd_size: c.read_u64::<LittleEndian>()?,
                cd_offset: c.read_u64::<LittleEndian>()?,
            })
        };
        parse(&mut c).map_err(|_| Error::archive_open("truncated ZIP64 end of central directory"))
    }
}

/// Central Directory File Header signature (`PK\x01\x02`).
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";

/// Local File Header signature (`PK\x03\x04`) and fixed length.
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// General-purpose flag bit 0: entry payload is encrypted.
const FLAG_ENCRYPTED: u16 = 0x0001;

/// One entry's metadata as recorded in the central directory.
///
/// Every field here came from the archive and is untrusted: the name may
/// attempt traversal, and the declared sizes may lie. Validation belongs to
/// the filter and to the streaming reader, which never trusts
/// `uncompressed_size` for allocation.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub method: CompressionMethod,
    pub flags: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub is_directory: bool,
}

impl ZipEntry {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Parse modification date to (year, month, day).
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second).
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eocd_bytes(total_entries: u16, cd_size: u32, cd_offset: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        buf.extend_from_slice(&0u16.to_le_bytes()); // disk number
        buf.extend_from_slice(&0u16.to_le_bytes()); // disk with cd
        buf.extend_from_slice(&total_entries.to_le_bytes());
        buf.extend_from_slice(&total_entries.to_le_bytes());
        buf.extend_from_slice(&cd_size.to_le_bytes());
        buf.extend_from_slice(&cd_offset.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // comment length
        buf
    }

    #[test]
    fn parses_eocd() {
        let eocd = EndOfCentralDirectory::from_bytes(&eocd_bytes(3, 150, 4096)).unwrap();
        assert_eq!(eocd.total_entries, 3);
        assert_eq!(eocd.cd_size, 150);
        assert_eq!(eocd.cd_offset, 4096);
        assert!(!eocd.is_zip64());
    }

    #[test]
    fn sentinel_fields_flag_zip64() {
        let eocd = EndOfCentralDirectory::from_bytes(&eocd_bytes(0xFFFF, 150, 4096)).unwrap();
        assert!(eocd.is_zip64());
    }

    #[test]
    fn bad_signature_is_archive_open_error() {
        let mut bytes = eocd_bytes(1, 10, 0);
        bytes[0] = b'Q';
        let err = EndOfCentralDirectory::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::ArchiveOpen { .. }));
    }

    #[test]
    fn truncated_eocd_rejected() {
        let bytes = eocd_bytes(1, 10, 0);
        assert!(EndOfCentralDirectory::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn dos_timestamp_decoding() {
        let entry = ZipEntry {
            name: "a.txt".into(),
            method: CompressionMethod::Stored,
            flags: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            // 2024-06-15 10:30:00
            last_mod_time: (10 << 11) | (30 << 5),
            last_mod_date: ((2024 - 1980) << 9) | (6 << 5) | 15,
            is_directory: false,
        };
        assert_eq!(entry.mod_date(), (2024, 6, 15));
        assert_eq!(entry.mod_time(), (10, 30, 0));
    }

    #[test]
    fn encryption_flag() {
        let mut entry = ZipEntry {
            name: "a".into(),
            method: CompressionMethod::Deflate,
            flags: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            last_mod_time: 0,
            last_mod_date: 0,
            is_directory: false,
        };
        assert!(!entry.is_encrypted());
        entry.flags = 1;
        assert!(entry.is_encrypted());
    }
}
