//! # WPRIME Core Library
//!
//! This crate provides the reader/writer for the `.wprime` archive format: a
//! streaming, optionally-encrypted, tar-like container built for hosts that
//! limit wall-clock time per invocation. Instead of assuming a multi-gigabyte
//! site can be archived in one go, every operation is offset-addressable and
//! yields cooperatively, handing the caller an explicit resume state to pass
//! back on the next invocation.
//!
//! ## Key Modules
//!
//! - [`codec`]: Streaming read/write of the container, corruption detection.
//! - [`format`]: Binary header layout and the format's fixed names.
//! - [`resume`]: Resume state, the tagged step outcome, and the time budget.
//! - [`crypto`]: Per-file AES-256-CTR encryption and package signatures.
//! - [`walker`]: File-list walking, exclusion policy, language-folder remap.
//! - [`config`]: The JSON package sidecar and the closure sentinel.
//! - [`pack`]: Composition root wiring the components into full runs.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod format;
pub mod pack;
pub mod resume;
pub mod walker;

pub mod cli;
pub mod error;
pub use error::WprimeError;

// Cross-platform filesystem wrapper
pub mod fsx;
