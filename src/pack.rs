//! Top-level assembly of a packing or extraction run.
//!
//! One `*_step` call corresponds to one bounded host invocation: components
//! are constructed fresh, wired together explicitly, driven until the time
//! budget runs out, and all progress leaves through the returned
//! [`StepOutcome`]. There is no hidden global state; resuming is a pure
//! function of state-in plus bytes-available.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{debug, info};

use crate::codec::{WprimeReader, WprimeWriter};
use crate::config::{Authorizer, ConfigManager, ExportMetadata};
use crate::crypto::KEY_SIZE;
use crate::format::PACKAGE_CONFIG_NAME;
use crate::resume::{ResumeState, StepOutcome, TimeBudget};
use crate::walker::{ExclusionPolicy, ExportMode, FileListWalker, LanguageRemap};
use crate::WprimeError;

/// Everything one packing run needs; assembled once by the caller and passed
/// to every step of the resume cycle.
pub struct PackRequest<'a> {
    /// Newline-delimited list of absolute paths to archive.
    pub list_path: &'a Path,
    /// Filesystem prefix replaced by `alias` in archive-local names.
    pub root: &'a Path,
    pub alias: &'a str,
    pub output: &'a Path,
    /// Exporting site id, embedded per entry as the owner tag.
    pub blog_id: u64,
    pub mode: ExportMode,
    /// Per-file encryption key; `None` produces a plaintext archive.
    pub key: Option<[u8; KEY_SIZE]>,
    pub remap: Option<LanguageRemap>,
    pub metadata: ExportMetadata,
    /// Where `finalize` places the sidecar and sentinel before they are
    /// appended into the archive.
    pub temp_folder: Option<&'a Path>,
}

/// Run one bounded packing invocation.
///
/// A fresh state creates the archive; any recorded progress re-opens it in
/// append mode. Entries are appended in file-list order; after the last one
/// the configuration entry and the closure sentinel go in and the archive is
/// terminated. Finalization is never split across invocations — once the
/// walker is exhausted the remaining work is two small entries.
pub fn pack_step<A: Authorizer>(
    request: &PackRequest<'_>,
    policy: &dyn ExclusionPolicy,
    config: &mut ConfigManager<A>,
    state: &ResumeState,
    budget: &TimeBudget,
) -> Result<StepOutcome, WprimeError> {
    let mut writer = if state.is_fresh() {
        WprimeWriter::create(request.output)?
    } else if state.bytes_written > 0 {
        // Truncate to the acknowledged offset so a replayed invocation
        // overwrites instead of appending the same range twice.
        WprimeWriter::resume_at(request.output, state.bytes_written)?
    } else {
        WprimeWriter::append(request.output)?
    };

    let list = BufReader::new(
        File::open(request.list_path).map_err(|e| WprimeError::io(e, request.list_path))?,
    );
    let mut walker = FileListWalker::new(
        list,
        request.root,
        request.alias,
        request.mode,
        policy,
        request.remap.clone(),
        state.list_position,
    )?;

    let mut files_archived = state.files_archived;
    // Mid-file cursor applies only to the first entry of this invocation.
    let mut pending = if state.mid_file() {
        Some((state.file_position, state.initialization_vector.clone()))
    } else {
        None
    };

    while let Some(entry) = walker.next_entry()? {
        // The mid-file cursor belongs to the exact list line it was saved at.
        // If that file vanished between invocations the walker skips it, and
        // continuing would graft the cursor onto the wrong entry.
        let (file_position, iv) = match pending.take() {
            None => (0, Vec::new()),
            Some(cursor) if entry.line_start == state.list_position => cursor,
            Some(_) => return Err(vanished_mid_file(state.list_position)),
        };
        let outcome = writer.append_file(
            &entry.source,
            &entry.local_name,
            request.blog_id,
            request.key.as_ref(),
            file_position,
            &iv,
            budget,
        )?;

        match outcome {
            StepOutcome::Complete { offset } => {
                files_archived += 1;
                debug!(entry = entry.local_name.as_str(), offset, "entry archived");
                if budget.exhausted() {
                    return Ok(StepOutcome::Partial(ResumeState {
                        list_position: entry.next_position,
                        file_position: 0,
                        bytes_written: offset,
                        files_archived,
                        initialization_vector: Vec::new(),
                    }));
                }
            }
            StepOutcome::Partial(mut partial) => {
                partial.list_position = entry.line_start;
                partial.files_archived = files_archived;
                return Ok(StepOutcome::Partial(partial));
            }
        }
    }

    if pending.is_some() {
        return Err(vanished_mid_file(state.list_position));
    }

    // All list entries are in; finalize the sidecar and close the archive.
    let finalized = config.finalize(request.temp_folder, &request.metadata, request.blog_id)?;
    let config_bytes = std::fs::read(&finalized.config_path)
        .map_err(|e| WprimeError::io(e, &finalized.config_path))?;
    writer.append_bytes(&config_bytes, PACKAGE_CONFIG_NAME, request.blog_id)?;
    drop(writer);

    if !config.close(request.output, &finalized, request.blog_id)? {
        return Err(WprimeError::Other(
            format!("could not close archive '{}'", request.output.display()).into(),
        ));
    }

    let offset = std::fs::metadata(request.output)
        .map_err(|e| WprimeError::io(e, request.output))?
        .len();
    info!(
        archive = %request.output.display(),
        files = files_archived,
        bytes = offset,
        "archive closed"
    );
    Ok(StepOutcome::Complete { offset })
}

fn vanished_mid_file(list_position: u64) -> WprimeError {
    WprimeError::Corrupted(format!(
        "the file interrupted mid-entry at list offset {} no longer exists; \
         the archive holds a partial payload that cannot be completed",
        list_position
    ))
}

/// Drive [`pack_step`] to completion with a fresh budget per cycle; for hosts
/// without a request time limit.
pub fn pack_to_completion<A: Authorizer>(
    request: &PackRequest<'_>,
    policy: &dyn ExclusionPolicy,
    config: &mut ConfigManager<A>,
    budget_for_cycle: impl Fn() -> TimeBudget,
) -> Result<u64, WprimeError> {
    let mut state = ResumeState::default();
    loop {
        match pack_step(request, policy, config, &state, &budget_for_cycle())? {
            StepOutcome::Complete { offset } => return Ok(offset),
            StepOutcome::Partial(next) => {
                debug!(?next, "pack cycle yielded");
                state = next;
            }
        }
    }
}

/// Run one bounded extraction invocation against `archive`.
pub fn extract_step(
    archive: &Path,
    dest: &Path,
    key: Option<&[u8; KEY_SIZE]>,
    base_read_offset: u64,
    state: &ResumeState,
    budget: &TimeBudget,
) -> Result<StepOutcome, WprimeError> {
    let mut reader = WprimeReader::open(archive, base_read_offset)?;
    reader.extract_entries(dest, key, state, budget)
}

/// Drive [`extract_step`] to completion with a fresh budget per cycle.
pub fn extract_to_completion(
    archive: &Path,
    dest: &Path,
    key: Option<&[u8; KEY_SIZE]>,
    budget_for_cycle: impl Fn() -> TimeBudget,
) -> Result<u64, WprimeError> {
    let mut state = ResumeState::default();
    loop {
        match extract_step(archive, dest, key, 0, &state, &budget_for_cycle())? {
            StepOutcome::Complete { offset } => return Ok(offset),
            StepOutcome::Partial(next) => {
                debug!(?next, "extract cycle yielded");
                state = next;
            }
        }
    }
}
