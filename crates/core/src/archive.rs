//! Archive codec: bundles a file set into one byte blob and restores it
//!
//! The container is a plain `tar` stream holding regular-file entries only;
//! directories are implied by entry paths. Each header carries the relative
//! path, size, permission bits and modification time (whole seconds).
//!
//! With [`Compression::On`] the finished tar stream is wrapped in a single
//! zstd frame. Decoding detects the zstd magic number, so a receiver accepts
//! both forms regardless of its own setting. An empty byte buffer is a valid
//! archive with no entries.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use filetime::{FileTime, set_file_mtime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::path::{contained_join, join_relative, normalize, validate_relative};

/// Largest tar stream a compressed archive may inflate to
pub const MAX_UNPACKED_LEN: u64 = 1 << 30;

/// First four bytes of every zstd frame
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd level used when compression is on
const ZSTD_LEVEL: i32 = 3;

/// Permission bits carried in archive headers
pub const PERMISSION_BITS: u32 = 0o7777;

/// Whether the archive stream is wrapped in a compression filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    On,
    /// Plain concatenated entries
    #[default]
    Off,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown compression {other:?}, expected on or off")),
        }
    }
}

/// One file inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the archive root, `/`-separated
    pub path: String,
    /// Permission bits
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch
    pub modified: u64,
    /// File contents
    pub data: Bytes,
}

impl ArchiveEntry {
    /// Payload size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Convert a timestamp to whole seconds, clamping pre-epoch times to zero
#[must_use]
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An ordered, in-memory set of archive entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    entries: Vec<ArchiveEntry>,
}

impl Archive {
    /// Create an empty archive
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, entry: ArchiveEntry) {
        self.entries.push(entry);
    }

    /// Entries in archive order
    #[must_use]
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all payload sizes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(ArchiveEntry::size).sum()
    }

    /// Serialize to a tar stream, optionally zstd-compressed
    ///
    /// # Errors
    /// Returns [`Error::InvalidPath`] if an entry path is not a portable
    /// relative path, or [`Error::Io`] if the stream cannot be written.
    pub fn to_bytes(&self, compression: Compression) -> Result<Bytes> {
        let mut builder = tar::Builder::new(Vec::new());

        for entry in &self.entries {
            validate_relative(&entry.path)?;

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(entry.size());
            header.set_mode(entry.mode & PERMISSION_BITS);
            header.set_mtime(entry.modified);
            builder
                .append_data(&mut header, &entry.path, entry.data.as_ref())
                .map_err(|e| Error::io("failed to append", &entry.path, e))?;
        }

        let stream = builder
            .into_inner()
            .map_err(|e| Error::io("failed to finish", "archive", e))?;

        match compression {
            Compression::Off => Ok(Bytes::from(stream)),
            Compression::On => {
                let compressed = zstd::encode_all(stream.as_slice(), ZSTD_LEVEL)
                    .map_err(|e| Error::io("failed to compress", "archive", e))?;
                Ok(Bytes::from(compressed))
            }
        }
    }

    /// Parse an archive produced by [`Archive::to_bytes`]
    ///
    /// # Errors
    /// Returns [`Error::CorruptArchive`] if a header cannot be parsed, an
    /// entry path escapes the root, or the stream ends mid-entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }

        let decompressed;
        let stream: &[u8] = if bytes.starts_with(&ZSTD_MAGIC) {
            decompressed = decompress(bytes, MAX_UNPACKED_LEN)?;
            &decompressed
        } else {
            bytes
        };

        let mut tar = tar::Archive::new(stream);
        let mut archive = Self::new();

        for entry in tar.entries().map_err(|e| corrupt("entries", &e))? {
            let mut entry = entry.map_err(|e| corrupt("header", &e))?;
            let raw_path = entry
                .path()
                .map_err(|e| corrupt("entry path", &e))?
                .into_owned();

            let (entry_type, mode, modified) = {
                let header = entry.header();
                (
                    header.entry_type(),
                    header.mode().map_err(|e| corrupt("entry mode", &e))?,
                    header.mtime().map_err(|e| corrupt("entry mtime", &e))?,
                )
            };

            if entry_type.is_dir() {
                continue;
            }
            if !entry_type.is_file() {
                warn!("skipping non-file entry {} ({entry_type:?})", raw_path.display());
                continue;
            }

            let path = normalize(&raw_path)
                .map_err(|e| Error::CorruptArchive(format!("bad entry path: {e}")))?;

            let size = entry.size();
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| corrupt("entry data", &e))?;
            if data.len() as u64 != size {
                return Err(Error::CorruptArchive(format!(
                    "archive ends mid-entry: {path} has {} of {size} bytes",
                    data.len()
                )));
            }

            archive.push(ArchiveEntry {
                path,
                mode: mode & PERMISSION_BITS,
                modified,
                data: Bytes::from(data),
            });
        }

        Ok(archive)
    }
}

/// Inflate a zstd stream, refusing output past `limit` bytes
fn decompress(bytes: &[u8], limit: u64) -> Result<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(bytes).map_err(|e| corrupt("zstd frame", &e))?;
    let mut out = Vec::new();
    decoder
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| corrupt("zstd frame", &e))?;
    if out.len() as u64 > limit {
        return Err(Error::CorruptArchive(format!(
            "zstd frame inflates past {limit} bytes"
        )));
    }
    Ok(out)
}

fn corrupt(what: &str, err: &std::io::Error) -> Error {
    Error::CorruptArchive(format!("failed to read {what}: {err}"))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;
    metadata.permissions().mode() & PERMISSION_BITS
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Read the listed files below `root` and encode them as one archive
///
/// Any file that cannot be opened, stat'd or read aborts the whole archive.
///
/// # Errors
/// Returns [`Error::Io`] on filesystem failure or [`Error::InvalidPath`]
/// for a malformed relative path.
pub fn pack<I, S>(root: &Path, paths: I, compression: Compression) -> Result<Bytes>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut archive = Archive::new();

    for rel in paths {
        let rel = rel.as_ref();
        let full_path = join_relative(root, rel)?;

        let mut file = fs::File::open(&full_path)
            .map_err(|e| Error::io("failed to open", &full_path, e))?;
        let metadata = file
            .metadata()
            .map_err(|e| Error::io("failed to stat", &full_path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| Error::io("failed to read mtime of", &full_path, e))?;

        let mut data = Vec::with_capacity(usize::try_from(metadata.len()).unwrap_or(0));
        file.read_to_end(&mut data)
            .map_err(|e| Error::io("failed to read", &full_path, e))?;

        debug!("packing {rel} ({} bytes)", data.len());
        archive.push(ArchiveEntry {
            path: rel.to_string(),
            mode: file_mode(&metadata),
            modified: unix_seconds(modified),
            data: Bytes::from(data),
        });
    }

    archive.to_bytes(compression)
}

/// What an unpack wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Files written
    pub files: usize,
    /// Payload bytes written
    pub bytes: u64,
}

/// Restore an archive below `destination`, overwriting existing files
///
/// The destination and any missing parent directories are created. The
/// whole archive is parsed, and every target checked for symbolic-link
/// parents, before the first file is written, so a rejected archive leaves
/// the destination untouched.
///
/// # Errors
/// Returns [`Error::Io`] if the destination cannot be written, or
/// [`Error::CorruptArchive`] if the archive cannot be parsed.
pub fn unpack(bytes: &[u8], destination: &Path) -> Result<UnpackSummary> {
    let archive = Archive::from_bytes(bytes)?;
    fs::create_dir_all(destination)
        .map_err(|e| Error::io("failed to create", destination, e))?;
    let mut summary = UnpackSummary::default();

    let targets = archive
        .entries()
        .iter()
        .map(|entry| contained_join(destination, &entry.path))
        .collect::<Result<Vec<_>>>()?;

    for (entry, target) in archive.entries().iter().zip(&targets) {
        write_entry(target, entry)?;
        summary.files += 1;
        summary.bytes += entry.size();
    }

    debug!(
        "unpacked {} files ({} bytes) into {}",
        summary.files,
        summary.bytes,
        destination.display()
    );
    Ok(summary)
}

fn write_entry(target: &Path, entry: &ArchiveEntry) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io("failed to create", parent, e))?;
    }

    // Replace rather than write through: the old file may be read-only or a symlink
    if fs::symlink_metadata(target).is_ok_and(|m| !m.is_dir()) {
        fs::remove_file(target).map_err(|e| Error::io("failed to replace", target, e))?;
    }

    fs::write(target, &entry.data).map_err(|e| Error::io("failed to write", target, e))?;

    let mtime = FileTime::from_unix_time(i64::try_from(entry.modified).unwrap_or(i64::MAX), 0);
    set_file_mtime(target, mtime).map_err(|e| Error::io("failed to set mtime on", target, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let perms = fs::Permissions::from_mode(entry.mode & PERMISSION_BITS);
        fs::set_permissions(target, perms)
            .map_err(|e| Error::io("failed to set mode on", target, e))?;
    }
    #[cfg(not(unix))]
    let _ = entry.mode;

    Ok(())
}
