//! Streaming reader/writer for WPRIME containers.
//!
//! Both halves are offset-addressable so a time-limited host can stop
//! mid-archive and continue in a later invocation: the writer re-opens at the
//! last acknowledged offset and overwrites anything past it, the reader seeks
//! straight to the saved entry header. Every mutating operation
//! returns the tagged [`StepOutcome`] — `Complete`, `Partial` (cooperative
//! yield, call again with the carried state) — or an error for unrecoverable
//! I/O. Yields happen only after a chunk has been durably flushed, never
//! mid-header, so a partially written archive is always continuable.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::crypto::{FileCipher, KEY_SIZE};
use crate::format::{
    padded_len, EntryHeader, EntryKind, BLOCK_SIZE, CLOSED_SENTINEL_NAME, PACKAGE_CONFIG_NAME,
};
use crate::fsx;
use crate::resume::{ResumeState, StepOutcome, TimeBudget};
use crate::WprimeError;

/// Streaming unit for payload reads and writes. Yield checks happen at this
/// granularity, so it bounds how far one invocation can overrun its budget.
const CHUNK_SIZE: usize = 1 << 16; // 64 KiB

/// Ceiling for the embedded configuration entry. The sidecar is a small JSON
/// document; a header claiming more than this is not a real package.
const CONFIG_SIZE_CEILING: u64 = 1 << 20; // 1 MiB

/// Result of a structural scan over a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveIntegrity {
    /// Headers, payload lengths and the closing terminator all check out.
    Sound,
    /// The diagnostic describes the first structural problem found.
    Corrupted(String),
}

impl ArchiveIntegrity {
    pub fn is_sound(&self) -> bool {
        matches!(self, ArchiveIntegrity::Sound)
    }
}

/// One entry as reported by [`WprimeReader::list_entries`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySummary {
    pub name: String,
    pub size: u64,
    pub owner: u64,
    pub encrypted: bool,
    pub kind: EntryKind,
    /// Archive offset of the entry's header block.
    pub header_offset: u64,
}

/// Resolve an entry name below `dest`, rejecting names that would escape the
/// extraction directory (absolute paths, `..` components).
fn entry_target(dest: &Path, name: &str) -> Result<PathBuf, WprimeError> {
    let rel = Path::new(name);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(WprimeError::Corrupted(format!(
            "entry name '{}' escapes the extraction directory",
            name
        )));
    }
    Ok(dest.join(rel))
}

fn mtime_of(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Appends entries to a WPRIME container.
///
/// Generic over any `Write + Seek` sink; production code uses a [`File`],
/// tests can use an in-memory cursor.
pub struct WprimeWriter<W: Write + Seek> {
    out: W,
    offset: u64,
}

impl WprimeWriter<File> {
    /// Open for writing from scratch, truncating any existing file.
    pub fn create(path: &Path) -> Result<Self, WprimeError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| WprimeError::io(e, path))?;
        Ok(WprimeWriter { out: file, offset: 0 })
    }

    /// Re-open an existing container to append the closing sentinel or to
    /// continue after a clean between-entry yield. Writing continues at the
    /// current end of the file.
    pub fn append(path: &Path) -> Result<Self, WprimeError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| WprimeError::io(e, path))?;
        WprimeWriter::from_sink(file)
    }

    /// Re-open an existing container at the last acknowledged offset.
    ///
    /// A host that delivers invocations at-least-once can replay a resume
    /// call whose acknowledgment was lost; anything the replayed-over run
    /// wrote past `acknowledged` is discarded so the same payload range is
    /// overwritten instead of appended twice.
    pub fn resume_at(path: &Path, acknowledged: u64) -> Result<Self, WprimeError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| WprimeError::io(e, path))?;
        let len = file.metadata().map_err(|e| WprimeError::io(e, path))?.len();
        if len < acknowledged {
            return Err(WprimeError::Corrupted(format!(
                "archive is {} bytes but {} were acknowledged; cannot resume",
                len, acknowledged
            )));
        }
        if len > acknowledged {
            file.set_len(acknowledged).map_err(|e| WprimeError::io(e, path))?;
        }
        let mut out = file;
        out.seek(SeekFrom::Start(acknowledged))?;
        Ok(WprimeWriter { out, offset: acknowledged })
    }
}

impl<W: Write + Seek> WprimeWriter<W> {
    /// Wrap an arbitrary sink, continuing at its current end.
    pub fn from_sink(mut out: W) -> Result<Self, WprimeError> {
        let offset = out.seek(SeekFrom::End(0))?;
        Ok(WprimeWriter { out, offset })
    }

    /// Running byte offset of the container.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stream one filesystem entry into the container.
    ///
    /// `file_position` is zero unless this call resumes an interrupted write,
    /// in which case `iv` must carry the IV the interrupted call returned and
    /// the writer must have been opened with [`WprimeWriter::resume_at`] at
    /// the yielded `bytes_written` offset, so a replayed call overwrites the
    /// same payload range instead of duplicating it. At least one chunk is
    /// written per call even when the budget is already exhausted.
    pub fn append_file(
        &mut self,
        source: &Path,
        local_name: &str,
        owner: u64,
        key: Option<&[u8; KEY_SIZE]>,
        file_position: u64,
        iv: &[u8],
        budget: &TimeBudget,
    ) -> Result<StepOutcome, WprimeError> {
        let meta = fs::metadata(source).map_err(|e| WprimeError::io(e, source))?;

        if meta.is_dir() {
            let header = EntryHeader {
                name: local_name.to_string(),
                mode: fsx::maybe_unix_mode(&meta).unwrap_or(0o755),
                owner,
                size: 0,
                mtime: mtime_of(&meta),
                kind: EntryKind::Directory,
                iv: None,
            };
            self.write_block(&header.encode()?)?;
            self.out.flush()?;
            return Ok(StepOutcome::Complete { offset: self.offset });
        }

        let size = meta.len();
        let mut cipher = match key {
            None => None,
            Some(k) if file_position == 0 => Some(FileCipher::new(k, iv)?),
            Some(k) => Some(FileCipher::resume_at(k, iv, file_position)?),
        };

        if file_position == 0 {
            let header = EntryHeader {
                name: local_name.to_string(),
                mode: fsx::maybe_unix_mode(&meta).unwrap_or(0o644),
                owner,
                size,
                mtime: mtime_of(&meta),
                kind: EntryKind::File,
                iv: cipher.as_ref().map(FileCipher::iv),
            };
            self.write_block(&header.encode()?)?;
        }

        let mut src = File::open(source).map_err(|e| WprimeError::io(e, source))?;
        if file_position > 0 {
            src.seek(SeekFrom::Start(file_position))
                .map_err(|e| WprimeError::io(e, source))?;
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut pos = file_position;
        while pos < size {
            let want = (size - pos).min(CHUNK_SIZE as u64) as usize;
            src.read_exact(&mut buf[..want]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    WprimeError::Corrupted(format!(
                        "source file '{}' shrank while being archived",
                        source.display()
                    ))
                } else {
                    WprimeError::io(e, source)
                }
            })?;
            if let Some(c) = cipher.as_mut() {
                c.apply(&mut buf[..want]);
            }
            self.out.write_all(&buf[..want])?;
            self.offset += want as u64;
            pos += want as u64;

            if pos < size && budget.exhausted() {
                self.out.flush()?;
                debug!(entry = local_name, position = pos, "yielding mid-file");
                return Ok(StepOutcome::Partial(ResumeState {
                    list_position: 0,
                    file_position: pos,
                    bytes_written: self.offset,
                    files_archived: 0,
                    initialization_vector: cipher
                        .as_ref()
                        .map(|c| c.iv().to_vec())
                        .unwrap_or_default(),
                }));
            }
        }

        self.pad_to_boundary(size)?;
        self.out.flush()?;
        Ok(StepOutcome::Complete { offset: self.offset })
    }

    /// Append a small, unencrypted entry from an in-memory buffer. Used for
    /// the package configuration and the closure sentinel, which are never
    /// large enough to warrant yielding. Synthetic entries carry a zero
    /// mtime so identical exports stay byte-identical.
    pub fn append_bytes(
        &mut self,
        data: &[u8],
        local_name: &str,
        owner: u64,
    ) -> Result<u64, WprimeError> {
        let header = EntryHeader {
            name: local_name.to_string(),
            mode: 0o644,
            owner,
            size: data.len() as u64,
            mtime: 0,
            kind: EntryKind::File,
            iv: None,
        };
        self.write_block(&header.encode()?)?;
        self.out.write_all(data)?;
        self.offset += data.len() as u64;
        self.pad_to_boundary(data.len() as u64)?;
        self.out.flush()?;
        Ok(self.offset)
    }

    /// Write the two-block end-of-archive terminator.
    pub fn finish(&mut self) -> Result<u64, WprimeError> {
        let zeros = [0u8; BLOCK_SIZE];
        self.write_block(&zeros)?;
        self.write_block(&zeros)?;
        self.out.flush()?;
        Ok(self.offset)
    }

    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<(), WprimeError> {
        self.out.write_all(block)?;
        self.offset += BLOCK_SIZE as u64;
        Ok(())
    }

    fn pad_to_boundary(&mut self, payload: u64) -> Result<(), WprimeError> {
        let pad = (padded_len(payload) - payload) as usize;
        if pad > 0 {
            self.out.write_all(&vec![0u8; pad])?;
            self.offset += pad as u64;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads a WPRIME container from any `Read + Seek` source.
///
/// The source seam replaces the original format's local-vs-remote toggle: a
/// local [`File`], an in-memory cursor and a remote range-request adapter all
/// plug in the same way. `base_read_offset` lets an extraction resume
/// mid-stream without rescanning from byte zero.
pub struct WprimeReader<R: Read + Seek> {
    src: R,
    base: u64,
}

impl WprimeReader<File> {
    pub fn open(path: &Path, base_read_offset: u64) -> Result<Self, WprimeError> {
        let file = File::open(path).map_err(|e| WprimeError::io(e, path))?;
        Ok(WprimeReader { src: file, base: base_read_offset })
    }
}

impl<R: Read + Seek> WprimeReader<R> {
    pub fn with_source(src: R, base_read_offset: u64) -> Self {
        WprimeReader { src, base: base_read_offset }
    }

    /// Read one block at `offset`. `Ok(None)` means clean EOF exactly at the
    /// block boundary; a short block is structural corruption.
    fn read_block_at(&mut self, offset: u64) -> Result<Option<[u8; BLOCK_SIZE]>, WprimeError> {
        self.src.seek(SeekFrom::Start(offset))?;
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.src.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < BLOCK_SIZE {
            return Err(WprimeError::Corrupted(format!(
                "short header block at offset {} ({} of {} bytes)",
                offset, filled, BLOCK_SIZE
            )));
        }
        Ok(Some(block))
    }

    /// Walk all entry headers without touching payloads.
    ///
    /// Stops at the terminator or at a clean EOF (an archive still being
    /// written has no terminator yet). Structural corruption is an error.
    pub fn list_entries(&mut self) -> Result<Vec<EntrySummary>, WprimeError> {
        let mut entries = Vec::new();
        let mut offset = self.base;
        loop {
            let block = match self.read_block_at(offset)? {
                None => break,
                Some(b) => b,
            };
            let header = match EntryHeader::decode(&block)? {
                None => break,
                Some(h) => h,
            };
            entries.push(EntrySummary {
                name: header.name.clone(),
                size: header.size,
                owner: header.owner,
                encrypted: header.iv.is_some(),
                kind: header.kind,
                header_offset: offset,
            });
            offset += BLOCK_SIZE as u64 + padded_len(header.size);
        }
        Ok(entries)
    }

    /// Structural scan of the whole container.
    ///
    /// Sound means: every header decodes, every payload is fully present, and
    /// the archive ends with the two-block terminator and nothing after it.
    /// An archive that was never closed therefore reports as corrupted, which
    /// is exactly the restorability question callers are asking.
    pub fn integrity(&mut self) -> Result<ArchiveIntegrity, WprimeError> {
        let len = self.src.seek(SeekFrom::End(0))?;
        let mut offset = self.base;
        loop {
            if offset == len {
                return Ok(ArchiveIntegrity::Corrupted(format!(
                    "archive ends at offset {} without the closing terminator",
                    offset
                )));
            }
            if offset + BLOCK_SIZE as u64 > len {
                return Ok(ArchiveIntegrity::Corrupted(format!(
                    "truncated header block at offset {}",
                    offset
                )));
            }
            let block = match self.read_block_at(offset) {
                Ok(Some(b)) => b,
                Ok(None) => unreachable!("length was checked above"),
                Err(WprimeError::Corrupted(msg)) => return Ok(ArchiveIntegrity::Corrupted(msg)),
                Err(e) => return Err(e),
            };
            let header = match EntryHeader::decode(&block) {
                Ok(Some(h)) => h,
                Ok(None) => {
                    // Terminator: a second zero block must follow, then EOF.
                    let second_end = offset + 2 * BLOCK_SIZE as u64;
                    if second_end > len {
                        return Ok(ArchiveIntegrity::Corrupted(
                            "terminator is missing its second zero block".into(),
                        ));
                    }
                    match self.read_block_at(offset + BLOCK_SIZE as u64) {
                        Ok(Some(b)) if b.iter().all(|&x| x == 0) => {}
                        Ok(_) => {
                            return Ok(ArchiveIntegrity::Corrupted(
                                "terminator is missing its second zero block".into(),
                            ))
                        }
                        Err(WprimeError::Corrupted(msg)) => {
                            return Ok(ArchiveIntegrity::Corrupted(msg))
                        }
                        Err(e) => return Err(e),
                    }
                    if second_end != len {
                        return Ok(ArchiveIntegrity::Corrupted(format!(
                            "{} trailing bytes after the terminator",
                            len - second_end
                        )));
                    }
                    return Ok(ArchiveIntegrity::Sound);
                }
                Err(WprimeError::Corrupted(msg)) => {
                    return Ok(ArchiveIntegrity::Corrupted(format!(
                        "{} (header at offset {})",
                        msg, offset
                    )))
                }
                Err(e) => return Err(e),
            };
            let next = offset + BLOCK_SIZE as u64 + padded_len(header.size);
            if next > len {
                return Ok(ArchiveIntegrity::Corrupted(format!(
                    "payload of entry '{}' is truncated",
                    header.name
                )));
            }
            offset = next;
        }
    }

    /// Probe for the embedded package configuration.
    ///
    /// Returns the raw JSON text when the container carries a readable
    /// configuration entry, `None` when it does not — including when the
    /// structure is too damaged to scan (a corrupted archive is simply not a
    /// recognizable package).
    pub fn package_config_text(&mut self) -> Result<Option<String>, WprimeError> {
        let mut offset = self.base;
        loop {
            let block = match self.read_block_at(offset) {
                Ok(Some(b)) => b,
                Ok(None) => return Ok(None),
                Err(WprimeError::Corrupted(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let header = match EntryHeader::decode(&block) {
                Ok(Some(h)) => h,
                Ok(None) => return Ok(None),
                Err(WprimeError::Corrupted(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let payload_offset = offset + BLOCK_SIZE as u64;
            if header.name == PACKAGE_CONFIG_NAME
                && header.kind == EntryKind::File
                && header.iv.is_none()
            {
                // An untrusted header could claim gigabytes here.
                if header.size > CONFIG_SIZE_CEILING {
                    return Ok(None);
                }
                self.src.seek(SeekFrom::Start(payload_offset))?;
                let mut raw = vec![0u8; header.size as usize];
                if self.src.read_exact(&mut raw).is_err() {
                    return Ok(None);
                }
                return Ok(String::from_utf8(raw).ok());
            }
            offset = payload_offset + padded_len(header.size);
        }
    }

    /// Whether the closure sentinel has been appended. Tolerant of an archive
    /// still being written (reports `false`, never an error, for truncation).
    pub fn is_closed(&mut self) -> Result<bool, WprimeError> {
        let mut offset = self.base;
        loop {
            let block = match self.read_block_at(offset) {
                Ok(Some(b)) => b,
                Ok(None) => return Ok(false),
                Err(WprimeError::Corrupted(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            let header = match EntryHeader::decode(&block) {
                Ok(Some(h)) => h,
                Ok(None) => return Ok(false),
                Err(WprimeError::Corrupted(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            if header.name == CLOSED_SENTINEL_NAME
                || header.name.ends_with(&format!("/{}", CLOSED_SENTINEL_NAME))
            {
                return Ok(true);
            }
            offset += BLOCK_SIZE as u64 + padded_len(header.size);
        }
    }

    /// Stream entries out to `dest`, in archive order, honoring the budget.
    ///
    /// `state.list_position` is the archive offset of the entry to continue
    /// from; `state.file_position` resumes inside that entry's payload. The
    /// writes are offset-addressed, so re-running a partial extraction never
    /// duplicates bytes in the output files.
    pub fn extract_entries(
        &mut self,
        dest: &Path,
        key: Option<&[u8; KEY_SIZE]>,
        state: &ResumeState,
        budget: &TimeBudget,
    ) -> Result<StepOutcome, WprimeError> {
        let (list_position, file_position, _bytes_written, files_archived, _iv) = state.unpack();
        let mut offset = if list_position > 0 { list_position } else { self.base };
        let mut files_done = files_archived;
        let mut resume_inside = file_position > 0;

        loop {
            let block = match self.read_block_at(offset)? {
                None => break,
                Some(b) => b,
            };
            let header = match EntryHeader::decode(&block)? {
                None => break,
                Some(h) => h,
            };
            let payload_offset = offset + BLOCK_SIZE as u64;
            let next_offset = payload_offset + padded_len(header.size);

            match header.kind {
                EntryKind::Directory => {
                    let target = entry_target(dest, &header.name)?;
                    fs::create_dir_all(&target).map_err(|e| WprimeError::io(e, &target))?;
                    if header.mode != 0 {
                        fsx::set_unix_permissions(&target, header.mode)
                            .map_err(|e| WprimeError::io(e, &target))?;
                    }
                }
                EntryKind::File => {
                    let start = if resume_inside { file_position } else { 0 };
                    if let Some(yield_pos) =
                        self.extract_payload(&header, payload_offset, dest, key, start, budget)?
                    {
                        return Ok(StepOutcome::Partial(ResumeState {
                            list_position: offset,
                            file_position: yield_pos,
                            bytes_written: yield_pos,
                            files_archived: files_done,
                            initialization_vector: header
                                .iv
                                .map(|iv| iv.to_vec())
                                .unwrap_or_default(),
                        }));
                    }
                }
            }
            resume_inside = false;
            files_done += 1;
            offset = next_offset;

            if budget.exhausted() {
                debug!(offset, files = files_done, "yielding between entries");
                return Ok(StepOutcome::Partial(ResumeState {
                    list_position: offset,
                    file_position: 0,
                    bytes_written: 0,
                    files_archived: files_done,
                    initialization_vector: Vec::new(),
                }));
            }
        }

        Ok(StepOutcome::Complete { offset })
    }

    /// Stream one file payload to disk. Returns `Some(position)` when the
    /// budget forced a yield mid-payload, `None` when the file completed.
    fn extract_payload(
        &mut self,
        header: &EntryHeader,
        payload_offset: u64,
        dest: &Path,
        key: Option<&[u8; KEY_SIZE]>,
        start: u64,
        budget: &TimeBudget,
    ) -> Result<Option<u64>, WprimeError> {
        let out_path = entry_target(dest, &header.name)?;
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| WprimeError::io(e, parent))?;
        }

        let mut cipher = match (&header.iv, key) {
            (None, _) => None,
            (Some(iv), Some(k)) if start > 0 => Some(FileCipher::resume_at(k, iv, start)?),
            (Some(iv), Some(k)) => Some(FileCipher::new(k, iv)?),
            (Some(_), None) => {
                return Err(WprimeError::Crypto(format!(
                    "entry '{}' is encrypted but no key was supplied",
                    header.name
                )))
            }
        };

        let mut out = if start > 0 {
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&out_path)
                .map_err(|e| WprimeError::io(e, &out_path))?;
            f.seek(SeekFrom::Start(start))
                .map_err(|e| WprimeError::io(e, &out_path))?;
            f
        } else {
            File::create(&out_path).map_err(|e| WprimeError::io(e, &out_path))?
        };

        self.src.seek(SeekFrom::Start(payload_offset + start))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut pos = start;
        while pos < header.size {
            let want = (header.size - pos).min(CHUNK_SIZE as u64) as usize;
            self.src.read_exact(&mut buf[..want]).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    WprimeError::Corrupted(format!("payload of entry '{}' is truncated", header.name))
                } else {
                    e.into()
                }
            })?;
            if let Some(c) = cipher.as_mut() {
                c.apply(&mut buf[..want]);
            }
            out.write_all(&buf[..want])
                .map_err(|e| WprimeError::io(e, &out_path))?;
            pos += want as u64;

            if pos < header.size && budget.exhausted() {
                out.flush().map_err(|e| WprimeError::io(e, &out_path))?;
                debug!(entry = header.name.as_str(), position = pos, "yielding mid-file");
                return Ok(Some(pos));
            }
        }

        if header.mode != 0 {
            fsx::set_unix_permissions(&out_path, header.mode)
                .map_err(|e| WprimeError::io(e, &out_path))?;
        }
        Ok(None)
    }
}
