//! Directory walker and exclusion policy.
//!
//! Converts a newline-delimited file-list plus a root path into a filtered,
//! remapped stream of `(source, local_name)` pairs. The walker reads the list
//! lazily and reports byte positions, so a resumed run re-opens the list and
//! seeks straight to the line it was interrupted on.
//!
//! Filter ordering is deliberate: structural skips (blank lines, vanished
//! paths, VCS metadata, nested archives) come before the media policy, and
//! all exclusion checks come before localization remapping — excluded paths
//! never need remapping.

use std::io::{BufRead, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::format::WPRIME_EXTENSION;
use crate::WprimeError;

/// Distinguishes a dedicated media export from a general export; the two
/// modes carry different media-exclusion rule sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    ExportingMedia,
    General,
}

/// Decides which filesystem entries stay out of the archive.
///
/// Injected into the walker as a strategy object; implementations hold
/// whatever opaque predicate data the caller configured.
pub trait ExclusionPolicy {
    fn excludes(&self, source: &Path, mode: ExportMode) -> bool;
}

/// Policy that lets everything through.
pub struct NoExclusions;

impl ExclusionPolicy for NoExclusions {
    fn excludes(&self, _source: &Path, _mode: ExportMode) -> bool {
        false
    }
}

/// Substring-based media exclusion rules, with one rule set per export mode.
#[derive(Debug, Clone, Default)]
pub struct MediaExclusions {
    /// Rules active during a general export.
    pub general: Vec<String>,
    /// Rules active while specifically exporting media.
    pub media_export: Vec<String>,
}

impl ExclusionPolicy for MediaExclusions {
    fn excludes(&self, source: &Path, mode: ExportMode) -> bool {
        let rules = match mode {
            ExportMode::ExportingMedia => &self.media_export,
            ExportMode::General => &self.general,
        };
        let haystack = unix_path(source);
        rules.iter().any(|r| !r.is_empty() && haystack.contains(r.as_str()))
    }
}

/// Rewrites per-site-scoped translation paths so a multi-tenant export can be
/// re-targeted at import time without re-walking the filesystem.
///
/// Language folders are namespaced `alias/<folder>` for a primary site and
/// `alias/<folder>/<site_id>` for secondary sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageRemap {
    pub folder: String,
    pub source_site: u64,
    pub target_site: u64,
}

impl LanguageRemap {
    /// The conventional localized-translations folder.
    pub fn wpml(source_site: u64, target_site: u64) -> Self {
        LanguageRemap { folder: "wpml".into(), source_site, target_site }
    }

    /// Rewrite `local` from the source-site scope to the target-site scope.
    /// Paths outside the language folder, and remaps with an unknown or
    /// identical site pair, pass through untouched.
    pub fn apply(&self, alias: &str, local: &str) -> String {
        if self.source_site == 0 || self.target_site == 0 || self.source_site == self.target_site {
            return local.to_string();
        }
        let prefix = format!("{}/{}", alias, self.folder);
        let source_scope = if self.source_site == 1 {
            format!("{}/", prefix)
        } else {
            format!("{}/{}/", prefix, self.source_site)
        };
        let Some(rest) = local.strip_prefix(&source_scope) else {
            return local.to_string();
        };
        if self.target_site == 1 {
            format!("{}/{}", prefix, rest)
        } else {
            format!("{}/{}/{}", prefix, self.target_site, rest)
        }
    }
}

/// One surviving file-list line.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkEntry {
    pub source: PathBuf,
    pub local_name: String,
    /// Byte offset of this entry's line; a mid-file yield resumes here.
    pub line_start: u64,
    /// Byte offset just past this line; committed once the entry completes.
    pub next_position: u64,
}

/// Streaming iterator over a newline-delimited file list.
pub struct FileListWalker<'a, R> {
    list: R,
    position: u64,
    root: PathBuf,
    alias: String,
    mode: ExportMode,
    policy: &'a dyn ExclusionPolicy,
    remap: Option<LanguageRemap>,
}

impl<'a, R: BufRead + Seek> FileListWalker<'a, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut list: R,
        root: &Path,
        alias: &str,
        mode: ExportMode,
        policy: &'a dyn ExclusionPolicy,
        remap: Option<LanguageRemap>,
        list_position: u64,
    ) -> Result<Self, WprimeError> {
        list.seek(SeekFrom::Start(list_position))?;
        Ok(FileListWalker {
            list,
            position: list_position,
            root: root.to_path_buf(),
            alias: alias.trim_end_matches('/').to_string(),
            mode,
            policy,
            remap,
        })
    }

    /// Byte offset of the next unread line.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next surviving entry, or `None` when the list is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<WalkEntry>, WprimeError> {
        loop {
            let line_start = self.position;
            let mut line = String::new();
            let read = self.list.read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            self.position += read as u64;

            let trimmed = line.trim_end_matches(['\r', '\n']).trim();
            if trimmed.is_empty() {
                continue;
            }
            let source = PathBuf::from(trimmed);

            // Tolerate files deleted between listing and archiving.
            if !source.exists() {
                debug!(path = trimmed, "listed path no longer exists, skipping");
                continue;
            }
            if is_vcs_metadata(&source) {
                continue;
            }
            if source.extension().is_some_and(|e| e == WPRIME_EXTENSION) {
                // Never swallow another archive of this format.
                continue;
            }
            if self.policy.excludes(&source, self.mode) {
                debug!(path = trimmed, "excluded by media policy");
                continue;
            }

            let Ok(rel) = source.strip_prefix(&self.root) else {
                debug!(path = trimmed, "outside the export root, skipping");
                continue;
            };
            let rel = unix_path(rel);
            if rel.is_empty() {
                continue;
            }
            let mut local_name = format!("{}/{}", self.alias, rel);
            if let Some(remap) = &self.remap {
                local_name = remap.apply(&self.alias, &local_name);
            }

            return Ok(Some(WalkEntry {
                source,
                local_name,
                line_start,
                next_position: self.position,
            }));
        }
    }
}

fn is_vcs_metadata(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(seg) => seg == ".git" || seg == ".svn",
        _ => false,
    })
}

fn unix_path(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    s.strip_prefix("./").unwrap_or(&s).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn walk_all(list: &str, root: &str, alias: &str, remap: Option<LanguageRemap>) -> Vec<String> {
        let policy = NoExclusions;
        let mut walker = FileListWalker::new(
            Cursor::new(list.to_string()),
            Path::new(root),
            alias,
            ExportMode::General,
            &policy,
            remap,
            0,
        )
        .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = walker.next_entry().unwrap() {
            names.push(entry.local_name);
        }
        names
    }

    #[test]
    fn secondary_to_secondary_language_remap() {
        let remap = LanguageRemap::wpml(3, 7);
        assert_eq!(remap.apply("export", "export/wpml/3/file.mo"), "export/wpml/7/file.mo");
    }

    #[test]
    fn secondary_to_primary_language_remap() {
        let remap = LanguageRemap::wpml(3, 1);
        assert_eq!(remap.apply("export", "export/wpml/3/file.mo"), "export/wpml/file.mo");
    }

    #[test]
    fn primary_to_secondary_language_remap() {
        let remap = LanguageRemap::wpml(1, 5);
        assert_eq!(remap.apply("export", "export/wpml/de_DE.mo"), "export/wpml/5/de_DE.mo");
    }

    #[test]
    fn remap_leaves_unrelated_paths_alone() {
        let remap = LanguageRemap::wpml(3, 7);
        assert_eq!(remap.apply("export", "export/uploads/file.mo"), "export/uploads/file.mo");
        assert_eq!(
            LanguageRemap::wpml(3, 3).apply("export", "export/wpml/3/x.mo"),
            "export/wpml/3/x.mo"
        );
        assert_eq!(
            LanguageRemap::wpml(0, 7).apply("export", "export/wpml/x.mo"),
            "export/wpml/x.mo"
        );
    }

    #[test]
    fn blank_and_missing_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.txt");
        std::fs::write(&keep, b"data").unwrap();
        let gone = dir.path().join("gone.txt");

        let list = format!("\n{}\r\n\n{}\n", keep.display(), gone.display());
        let names = walk_all(&list, &dir.path().to_string_lossy(), "export", None);
        assert_eq!(names, vec!["export/keep.txt"]);
    }

    #[test]
    fn vcs_and_nested_archives_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();
        std::fs::write(dir.path().join("site.wprime"), b"nested").unwrap();
        std::fs::write(dir.path().join("page.html"), b"<html>").unwrap();

        let list = format!(
            "{}\n{}\n{}\n",
            dir.path().join(".git/HEAD").display(),
            dir.path().join("site.wprime").display(),
            dir.path().join("page.html").display(),
        );
        let names = walk_all(&list, &dir.path().to_string_lossy(), "export", None);
        assert_eq!(names, vec!["export/page.html"]);
    }

    #[test]
    fn media_policy_depends_on_export_mode() {
        let policy = MediaExclusions {
            general: vec!["/uploads/".into()],
            media_export: vec!["/plugins/".into()],
        };
        let uploads = Path::new("/site/wp-content/uploads/a.jpg");
        let plugins = Path::new("/site/wp-content/plugins/a.php");

        assert!(policy.excludes(uploads, ExportMode::General));
        assert!(!policy.excludes(uploads, ExportMode::ExportingMedia));
        assert!(policy.excludes(plugins, ExportMode::ExportingMedia));
        assert!(!policy.excludes(plugins, ExportMode::General));
    }

    #[test]
    fn walker_resumes_from_saved_position() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let list = format!(
            "{}\n{}\n{}\n",
            dir.path().join("a.txt").display(),
            dir.path().join("b.txt").display(),
            dir.path().join("c.txt").display(),
        );

        let policy = NoExclusions;
        let mut walker = FileListWalker::new(
            Cursor::new(list.clone()),
            dir.path(),
            "export",
            ExportMode::General,
            &policy,
            None,
            0,
        )
        .unwrap();
        let first = walker.next_entry().unwrap().unwrap();
        assert_eq!(first.local_name, "export/a.txt");
        assert_eq!(first.line_start, 0);

        // Re-open at the committed position: the stream continues with b.txt.
        let mut resumed = FileListWalker::new(
            Cursor::new(list),
            dir.path(),
            "export",
            ExportMode::General,
            &policy,
            None,
            first.next_position,
        )
        .unwrap();
        let second = resumed.next_entry().unwrap().unwrap();
        assert_eq!(second.local_name, "export/b.txt");
    }
}
