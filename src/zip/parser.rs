//! Central-directory parsing over a random-access source.
//!
//! The parser reads the EOCD from the tail of the source (handling trailing
//! comments and ZIP64 archives), then walks the central directory to
//! produce [`ZipEntry`] metadata. It performs no payload I/O itself;
//! [`open_entry`](ZipParser::open_entry) resolves an entry's local header
//! and hands back a streaming [`EntryReader`].

use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, MemoryPhase, Result};
use crate::io::ReadAt;
use crate::memory::MemoryMonitor;

use super::stream::EntryReader;
use super::structures::{
    CDFH_SIGNATURE, CompressionMethod, EndOfCentralDirectory, LFH_SIGNATURE, LFH_SIZE, Zip64Eocd,
    Zip64EocdLocator, ZipEntry,
};

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// Limits the search window when locating an EOCD behind a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Low-level ZIP container parser.
///
/// Generic over the source so the same code serves local files and
/// in-memory buffers. All offsets and sizes read from the archive are
/// validated against the source length before being dereferenced.
pub struct ZipParser<R: ReadAt> {
    source: Arc<R>,
    size: u64,
    monitor: Option<Arc<MemoryMonitor>>,
}

impl<R: ReadAt + 'static> ZipParser<R> {
    pub fn new(source: Arc<R>) -> Self {
        let size = source.size();
        Self {
            source,
            size,
            monitor: None,
        }
    }

    /// Parser whose own allocations (the central directory buffer) are
    /// charged against `monitor` before they happen.
    pub fn with_monitor(source: Arc<R>, monitor: Arc<MemoryMonitor>) -> Self {
        Self {
            monitor: Some(monitor),
            ..Self::new(source)
        }
    }

    /// Total size of the underlying source in bytes.
    pub fn source_size(&self) -> u64 {
        self.size
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Tries the comment-free position first, then searches backwards
    /// through the maximum comment window. Returns the record and its
    /// offset in the source.
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        if self.size < EndOfCentralDirectory::SIZE as u64 {
            return Err(Error::archive_open("file too small to be a ZIP archive"));
        }

        // Common case: no trailing comment, EOCD sits exactly at the end.
        let offset = self.size - EndOfCentralDirectory::SIZE as u64;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        self.read_exact(offset, &mut buf).await?;
        if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            ensure_single_disk(&eocd)?;
            return Ok((eocd, offset));
        }

        // Search backwards through the comment window for the signature.
        let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(self.size);
        let search_start = self.size - search_size;
        let mut window = vec![0u8; search_size as usize];
        self.read_exact(search_start, &mut window).await?;

        for i in (0..window.len().saturating_sub(EndOfCentralDirectory::SIZE)).rev() {
            if &window[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // Candidate: the comment-length field must account for
                // exactly the bytes that follow the record.
                let comment_len = u16::from_le_bytes([window[i + 20], window[i + 21]]) as usize;
                if comment_len == window.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd = EndOfCentralDirectory::from_bytes(
                        &window[i..i + EndOfCentralDirectory::SIZE],
                    )?;
                    ensure_single_disk(&eocd)?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(Error::archive_open("no end of central directory found"))
    }

    /// Read the ZIP64 EOCD via its locator, which sits immediately before
    /// the regular EOCD.
    async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<Zip64Eocd> {
        let locator_offset = eocd_offset
            .checked_sub(Zip64EocdLocator::SIZE as u64)
            .ok_or_else(|| Error::archive_open("missing ZIP64 locator"))?;
        let mut locator_buf = vec![0u8; Zip64EocdLocator::SIZE];
        self.read_exact(locator_offset, &mut locator_buf).await?;
        let locator = Zip64EocdLocator::from_bytes(&locator_buf)?;
        if locator.total_disks > 1 || locator.disk_with_eocd64 != 0 {
            return Err(Error::archive_open("multi-disk archives are not supported"));
        }

        if locator.eocd64_offset.saturating_add(Zip64Eocd::MIN_SIZE as u64) > self.size {
            return Err(Error::archive_open("ZIP64 locator points past end of file"));
        }
        let mut eocd64_buf = vec![0u8; Zip64Eocd::MIN_SIZE];
        self.read_exact(locator.eocd64_offset, &mut eocd64_buf)
            .await?;
        let eocd64 = Zip64Eocd::from_bytes(&eocd64_buf)?;
        if eocd64.disk_entries != eocd64.total_entries {
            return Err(Error::archive_open("multi-disk archives are not supported"));
        }
        Ok(eocd64)
    }

    /// Number of entries the archive declares, without parsing the full
    /// central directory. Used for the entry-count guard.
    pub async fn declared_entry_count(&self) -> Result<u64> {
        let (eocd, eocd_offset) = self.find_eocd().await?;
        if eocd.is_zip64() {
            Ok(self.read_zip64_eocd(eocd_offset).await?.total_entries)
        } else {
            Ok(eocd.total_entries as u64)
        }
    }

    /// List all entries by parsing the central directory.
    pub async fn list_entries(&self) -> Result<Vec<ZipEntry>> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        let (cd_offset, cd_size, total_entries) = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries)
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
            )
        };

        if cd_offset.saturating_add(cd_size) > self.size {
            return Err(Error::archive_open("central directory extends past end of file"));
        }

        // The central directory buffer is archive-controlled in size, so it
        // is charged against the ceiling like any payload allocation.
        let _reservation = match &self.monitor {
            Some(monitor) => {
                monitor.check_additional(cd_size, MemoryPhase::BeforeProcessing)?;
                Some(monitor.reserve(cd_size))
            }
            None => None,
        };
        let mut cd_data = vec![0u8; cd_size as usize];
        self.read_exact(cd_offset, &mut cd_data).await?;

        let mut entries = Vec::with_capacity((total_entries as usize).min(4096));
        let mut cursor = Cursor::new(cd_data.as_slice());
        for _ in 0..total_entries {
            entries.push(self.parse_cdfh(&mut cursor)?);
        }
        tracing::debug!(entries = entries.len(), "parsed central directory");
        Ok(entries)
    }

    /// Parse one Central Directory File Header.
    fn parse_cdfh(&self, cursor: &mut Cursor<&[u8]>) -> Result<ZipEntry> {
        let corrupt = |_| Error::archive_open("truncated central directory entry");

        let mut sig = [0u8; 4];
        cursor.read_exact(&mut sig).map_err(corrupt)?;
        if sig != CDFH_SIGNATURE {
            return Err(Error::archive_open("invalid central directory entry"));
        }

        let _version_made_by = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let _version_needed = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let flags = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let method = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let last_mod_time = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let last_mod_date = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let crc32 = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
        let mut compressed_size = cursor.read_u32::<LittleEndian>().map_err(corrupt)? as u64;
        let mut uncompressed_size = cursor.read_u32::<LittleEndian>().map_err(corrupt)? as u64;
        let name_len = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let extra_len = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let comment_len = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let _disk_number_start = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let _internal_attrs = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
        let _external_attrs = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
        let mut lfh_offset = cursor.read_u32::<LittleEndian>().map_err(corrupt)? as u64;

        let mut name_bytes = vec![0u8; name_len as usize];
        cursor.read_exact(&mut name_bytes).map_err(corrupt)?;
        // Lossy conversion keeps hostile non-UTF8 names inspectable by the
        // filter instead of failing the whole archive.
        let name = String::from_utf8_lossy(&name_bytes).to_string();
        let is_directory = name.ends_with('/') || name.ends_with('\\');

        // ZIP64 extended information lives in extra field 0x0001; each
        // 64-bit value is present only when its 32-bit field is a sentinel.
        let extra_end = cursor.position() + extra_len as u64;
        while cursor.position() + 4 <= extra_end {
            let header_id = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
            let field_size = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
            if header_id == 0x0001 {
                if uncompressed_size == 0xFFFF_FFFF && cursor.position() + 8 <= extra_end {
                    uncompressed_size = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
                }
                if compressed_size == 0xFFFF_FFFF && cursor.position() + 8 <= extra_end {
                    compressed_size = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
                }
                if lfh_offset == 0xFFFF_FFFF && cursor.position() + 8 <= extra_end {
                    lfh_offset = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
                }
                break;
            }
            cursor.set_position(cursor.position() + field_size as u64);
        }
        cursor.set_position(extra_end + comment_len as u64);

        Ok(ZipEntry {
            name,
            method: CompressionMethod::from_u16(method),
            flags,
            compressed_size,
            uncompressed_size,
            crc32,
            lfh_offset,
            last_mod_time,
            last_mod_date,
            is_directory,
        })
    }

    /// Resolve where an entry's payload starts.
    ///
    /// The local header repeats the variable-length name and extra field
    /// with lengths that may differ from the central directory, so the
    /// data offset must be computed from the local header itself.
    pub async fn data_offset(&self, entry: &ZipEntry) -> Result<u64> {
        if entry.lfh_offset.saturating_add(LFH_SIZE as u64) > self.size {
            return Err(Error::archive_open("local header offset past end of file"));
        }
        let mut lfh_buf = vec![0u8; LFH_SIZE];
        self.read_exact(entry.lfh_offset, &mut lfh_buf).await?;
        if &lfh_buf[0..4] != LFH_SIGNATURE {
            return Err(Error::archive_open("invalid local file header"));
        }

        let name_len = u16::from_le_bytes([lfh_buf[26], lfh_buf[27]]) as u64;
        let extra_len = u16::from_le_bytes([lfh_buf[28], lfh_buf[29]]) as u64;
        Ok(entry.lfh_offset + LFH_SIZE as u64 + name_len + extra_len)
    }

    /// Open a streaming reader over one entry's payload.
    ///
    /// Each call yields a fresh single-consumer stream; re-reading an entry
    /// means re-opening it.
    pub async fn open_entry(&self, entry: &ZipEntry) -> Result<EntryReader<R>> {
        if entry.is_encrypted() {
            return Err(Error::StreamProcessing(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("entry '{}' is encrypted", entry.name),
            )));
        }
        if !entry.method.is_supported() {
            return Err(Error::StreamProcessing(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!(
                    "entry '{}' uses unsupported compression method {}",
                    entry.name,
                    entry.method.as_u16()
                ),
            )));
        }

        let data_offset = self.data_offset(entry).await?;
        if data_offset.saturating_add(entry.compressed_size) > self.size {
            return Err(Error::archive_open("entry data extends past end of file"));
        }
        Ok(EntryReader::new(
            Arc::clone(&self.source),
            entry.method,
            data_offset,
            entry.compressed_size,
            entry.uncompressed_size,
        ))
    }

    async fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.source
            .read_exact_at(offset, buf)
            .await
            .map_err(Error::StreamProcessing)
    }
}

/// Spanned archives split the central directory across disks; this parser
/// only handles the single-disk layout. Sentinel values defer to ZIP64.
fn ensure_single_disk(eocd: &EndOfCentralDirectory) -> Result<()> {
    let spans = (eocd.disk_number != 0 && eocd.disk_number != 0xFFFF)
        || (eocd.disk_with_cd != 0 && eocd.disk_with_cd != 0xFFFF);
    if spans {
        return Err(Error::archive_open("multi-disk archives are not supported"));
    }
    Ok(())
}
