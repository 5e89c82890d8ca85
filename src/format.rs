//! # The WPRIME Container Format
//!
//! Binary layout of the resumable archive container. The format is a tar
//! derivative: every entry starts on a 512-byte boundary with a 512-byte
//! header block, followed by the payload zero-padded to the next boundary.
//!
//! ## Header block layout
//!
//! | offset | len | field |
//! |--------|-----|-------|
//! | 0      | 100 | entry name, NUL-padded UTF-8 |
//! | 100    | 8   | mode, octal ASCII |
//! | 108    | 8   | owner (exporting site id), octal ASCII |
//! | 116    | 12  | payload size, octal ASCII |
//! | 128    | 12  | mtime, octal ASCII |
//! | 140    | 8   | checksum, tar rule (field counted as spaces) |
//! | 148    | 1   | typeflag: `'0'` file, `'5'` directory |
//! | 149    | 1   | encryption flag: `'0'` or `'1'` |
//! | 150    | 32  | IV as lowercase hex when encrypted, else NUL |
//! | 182    | 8   | magic `WPRIME1\0` |
//!
//! A *closed* archive ends with two all-zero blocks, appended together with
//! the closure sentinel entry. An archive still being written ends at an
//! entry boundary with no terminator; readers treat a clean EOF there as
//! "more entries may follow".

use crate::crypto::{from_hex, to_hex, IV_SIZE};
use crate::WprimeError;

/// Size of one header or padding block.
pub const BLOCK_SIZE: usize = 512;

/// Magic signature embedded in every header block.
pub const WPRIME_MAGIC: &[u8; 8] = b"WPRIME1\0";

/// File extension identifying the format. Nested files carrying this
/// extension are never recursively included in a parent archive.
pub const WPRIME_EXTENSION: &str = "wprime";

/// Fixed name of the JSON package-configuration entry.
pub const PACKAGE_CONFIG_NAME: &str = "wprime-package.json";

/// Fixed name of the closure sentinel, nested under the archive root folder.
pub const CLOSED_SENTINEL_NAME: &str = "wprime.closed";

/// Body written into the sentinel placeholder file.
pub const CLOSED_SENTINEL_TEXT: &str =
    "This package was written to completion and is safe to restore.\n";

const NAME_LEN: usize = 100;
const MODE_OFF: usize = 100;
const OWNER_OFF: usize = 108;
const SIZE_OFF: usize = 116;
const MTIME_OFF: usize = 128;
const CHKSUM_OFF: usize = 140;
const TYPE_OFF: usize = 148;
const ENC_OFF: usize = 149;
const IV_OFF: usize = 150;
const MAGIC_OFF: usize = 182;

/// Whether an entry is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Decoded form of one 512-byte header block.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryHeader {
    /// Archive-local name, after alias/exclusion/localization remapping.
    pub name: String,
    /// Unix permission bits.
    pub mode: u32,
    /// Site/blog identifier of the exporting site, stored per entry.
    pub owner: u64,
    /// Payload size in bytes. With CTR encryption, ciphertext length equals
    /// plaintext length, so this is always the original file size.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
    pub kind: EntryKind,
    /// Per-file initialization vector; `Some` iff the payload is encrypted.
    pub iv: Option<[u8; IV_SIZE]>,
}

/// Payload length rounded up to the next block boundary.
pub fn padded_len(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

fn put_octal(block: &mut [u8], off: usize, width: usize, value: u64) -> Result<(), WprimeError> {
    // width includes the trailing NUL, tar style
    let s = format!("{:0>1$o}", value, width - 1);
    if s.len() > width - 1 {
        return Err(WprimeError::Corrupted(format!(
            "value {} does not fit a {}-digit octal header field",
            value,
            width - 1
        )));
    }
    block[off..off + width - 1].copy_from_slice(s.as_bytes());
    block[off + width - 1] = 0;
    Ok(())
}

fn read_octal(block: &[u8], off: usize, width: usize) -> Result<u64, WprimeError> {
    let raw = &block[off..off + width];
    let end = raw.iter().position(|&b| b == 0 || b == b' ').unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|_| WprimeError::Corrupted("non-ASCII octal field in header".into()))?;
    u64::from_str_radix(text.trim(), 8)
        .map_err(|_| WprimeError::Corrupted(format!("invalid octal field '{}' in header", text)))
}

/// Tar checksum rule: sum of all header bytes with the checksum field
/// counted as eight spaces.
fn checksum_of(block: &[u8; BLOCK_SIZE]) -> u64 {
    let mut sum: u64 = 0;
    for (i, b) in block.iter().enumerate() {
        if (CHKSUM_OFF..CHKSUM_OFF + 8).contains(&i) {
            sum += b' ' as u64;
        } else {
            sum += *b as u64;
        }
    }
    sum
}

impl EntryHeader {
    /// Encode into one header block. Fails when the entry name does not fit
    /// the 100-byte name field or a numeric field overflows its octal width.
    pub fn encode(&self) -> Result<[u8; BLOCK_SIZE], WprimeError> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > NAME_LEN {
            return Err(WprimeError::Corrupted(format!(
                "entry name '{}' exceeds {} bytes",
                self.name, NAME_LEN
            )));
        }

        let mut block = [0u8; BLOCK_SIZE];
        block[..name_bytes.len()].copy_from_slice(name_bytes);
        put_octal(&mut block, MODE_OFF, 8, self.mode as u64 & 0o7777)?;
        put_octal(&mut block, OWNER_OFF, 8, self.owner)?;
        put_octal(&mut block, SIZE_OFF, 12, self.size)?;
        put_octal(&mut block, MTIME_OFF, 12, self.mtime)?;
        block[TYPE_OFF] = match self.kind {
            EntryKind::File => b'0',
            EntryKind::Directory => b'5',
        };
        block[ENC_OFF] = if self.iv.is_some() { b'1' } else { b'0' };
        if let Some(iv) = &self.iv {
            block[IV_OFF..IV_OFF + IV_SIZE * 2].copy_from_slice(to_hex(iv).as_bytes());
        }
        block[MAGIC_OFF..MAGIC_OFF + 8].copy_from_slice(WPRIME_MAGIC);

        let sum = checksum_of(&block);
        let chk = format!("{:06o}", sum);
        block[CHKSUM_OFF..CHKSUM_OFF + 6].copy_from_slice(chk.as_bytes());
        block[CHKSUM_OFF + 6] = 0;
        block[CHKSUM_OFF + 7] = b' ';

        Ok(block)
    }

    /// Decode one block. Returns `Ok(None)` for an all-zero block (part of
    /// the end-of-archive terminator), `Err(Corrupted)` for anything that is
    /// neither a valid header nor zero.
    pub fn decode(block: &[u8; BLOCK_SIZE]) -> Result<Option<EntryHeader>, WprimeError> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if &block[MAGIC_OFF..MAGIC_OFF + 8] != WPRIME_MAGIC {
            return Err(WprimeError::Corrupted("header magic mismatch".into()));
        }
        let stored = read_octal(block, CHKSUM_OFF, 8)?;
        let actual = checksum_of(block);
        if stored != actual {
            return Err(WprimeError::Corrupted(format!(
                "header checksum mismatch (stored {:o}, computed {:o})",
                stored, actual
            )));
        }

        let name_end = block[..NAME_LEN].iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&block[..name_end])
            .map_err(|_| WprimeError::Corrupted("entry name is not valid UTF-8".into()))?
            .to_string();

        let kind = match block[TYPE_OFF] {
            b'0' => EntryKind::File,
            b'5' => EntryKind::Directory,
            other => {
                return Err(WprimeError::Corrupted(format!(
                    "unknown typeflag {:#x} for entry '{}'",
                    other, name
                )))
            }
        };

        let iv = match block[ENC_OFF] {
            b'0' => None,
            b'1' => {
                let hex = std::str::from_utf8(&block[IV_OFF..IV_OFF + IV_SIZE * 2])
                    .map_err(|_| WprimeError::Corrupted("IV field is not valid hex".into()))?;
                let bytes = from_hex(hex).ok_or_else(|| {
                    WprimeError::Corrupted(format!("IV field is not valid hex for entry '{}'", name))
                })?;
                let arr: [u8; IV_SIZE] = bytes
                    .try_into()
                    .map_err(|_| WprimeError::Corrupted("IV field has the wrong length".into()))?;
                Some(arr)
            }
            other => {
                return Err(WprimeError::Corrupted(format!(
                    "invalid encryption flag {:#x} for entry '{}'",
                    other, name
                )))
            }
        };

        Ok(Some(EntryHeader {
            name,
            mode: read_octal(block, MODE_OFF, 8)? as u32,
            owner: read_octal(block, OWNER_OFF, 8)?,
            size: read_octal(block, SIZE_OFF, 12)?,
            mtime: read_octal(block, MTIME_OFF, 12)?,
            kind,
            iv,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> EntryHeader {
        EntryHeader {
            name: "export/wp-content/uploads/2024/photo.jpg".into(),
            mode: 0o644,
            owner: 3,
            size: 123_456,
            mtime: 1_700_000_000,
            kind: EntryKind::File,
            iv: Some([0xAB; 16]),
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let block = header.encode().unwrap();
        let decoded = EntryHeader::decode(&block).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn zero_block_decodes_as_terminator() {
        let block = [0u8; BLOCK_SIZE];
        assert!(EntryHeader::decode(&block).unwrap().is_none());
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut block = sample_header().encode().unwrap();
        block[20] ^= 0xFF;
        assert!(matches!(
            EntryHeader::decode(&block),
            Err(WprimeError::Corrupted(_))
        ));
    }

    #[test]
    fn wrong_magic_detected() {
        let mut block = sample_header().encode().unwrap();
        block[182..190].copy_from_slice(b"ustar\0\0\0");
        assert!(matches!(
            EntryHeader::decode(&block),
            Err(WprimeError::Corrupted(_))
        ));
    }

    #[test]
    fn name_too_long_rejected() {
        let mut header = sample_header();
        header.name = "x".repeat(101);
        assert!(header.encode().is_err());
    }

    #[test]
    fn oversize_octal_fields_are_rejected() {
        // The 12-byte size field holds 11 octal digits, so 8^11 is the first
        // value that no longer fits.
        let mut header = sample_header();
        header.size = 1 << 33;
        assert!(matches!(header.encode(), Err(WprimeError::Corrupted(_))));
        header.size = (1 << 33) - 1;
        assert!(header.encode().is_ok());

        let mut header = sample_header();
        header.owner = 0o10000000;
        assert!(header.encode().is_err());
    }

    #[test]
    fn padding_rounds_to_block_boundary() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 512);
        assert_eq!(padded_len(512), 512);
        assert_eq!(padded_len(513), 1024);
    }
}
