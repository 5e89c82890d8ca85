//! Package configuration manager.
//!
//! Every archive carries a JSON sidecar describing its contents, appended as
//! the second-to-last entry, followed by the closure sentinel that marks the
//! archive structurally complete. The sidecar must carry at least the seven
//! required keys or the package is considered unrestorable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codec::{WprimeReader, WprimeWriter};
use crate::crypto::{self, encryption_signature, KEY_SIZE};
use crate::format::{CLOSED_SENTINEL_NAME, CLOSED_SENTINEL_TEXT, PACKAGE_CONFIG_NAME};
use crate::WprimeError;

/// Keys every restorable package configuration must carry.
pub const REQUIRED_CONFIG_KEYS: [&str; 7] = [
    "export_options",
    "encrypted",
    "site_title",
    "include_users",
    "prime_mover_export_targetid",
    "tar_root_folder",
    "prime_mover_encrypted_signature",
];

/// The sidecar record describing one archive. Never mutated after the
/// archive is marked closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default)]
    pub export_options: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub site_title: String,
    #[serde(default)]
    pub include_users: bool,
    #[serde(default)]
    pub tar_root_folder: String,
    #[serde(default)]
    pub prime_mover_export_targetid: u64,
    #[serde(default)]
    pub prime_mover_export_type: String,
    /// HMAC signature binding encryption parameters to the exporting site;
    /// empty when the archive is not encrypted.
    #[serde(default)]
    pub prime_mover_encrypted_signature: String,
    /// Anything a collaborator added beyond the fixed schema, e.g. the key
    /// derivation salt.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PackageConfig {
    /// True for the `{}`-equivalent value `load` returns on any failure.
    pub fn is_empty(&self) -> bool {
        *self == PackageConfig::default()
    }

    /// Hex KDF salt, when the exporter recorded one.
    pub fn kdf_salt(&self) -> Option<Vec<u8>> {
        self.extra
            .get("wprime_kdf_salt")
            .and_then(Value::as_str)
            .and_then(crypto::from_hex)
    }
}

/// Delegated entitlement check; the original host decided this through its
/// capability system, here it is an injected strategy.
pub trait Authorizer {
    fn can_manage_packages(&self, blog_id: u64) -> bool;
}

/// Authorizer for trusted contexts (CLI, tests).
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_manage_packages(&self, _blog_id: u64) -> bool {
        true
    }
}

/// Export metadata supplied by the collaborator driving the export. Optional
/// fields left unset cause the seven-key gate to fail, which is the defense
/// against a collaborator handing over incomplete metadata.
#[derive(Debug, Clone, Default)]
pub struct ExportMetadata {
    pub export_options: Option<String>,
    pub site_title: Option<String>,
    pub include_users: Option<bool>,
    pub export_type: Option<String>,
    pub target_id: Option<u64>,
    pub root_folder: Option<String>,
    pub encrypted: bool,
    /// Required when `encrypted`; used only for the finalization signature.
    pub key: Option<[u8; KEY_SIZE]>,
    pub extra: Map<String, Value>,
}

/// Paths produced by [`ConfigManager::finalize`], consumed by `close` and by
/// the caller appending the configuration entry into the archive.
#[derive(Debug, Clone)]
pub struct FinalizedPackage {
    pub config_path: PathBuf,
    pub sentinel_path: PathBuf,
    pub root_folder: String,
}

/// Finalizes, loads and closes package configurations. Holds the in-process
/// read cache; all other state is passed explicitly per call.
pub struct ConfigManager<A: Authorizer = AllowAll> {
    authorizer: A,
    cache: HashMap<String, PackageConfig>,
}

impl ConfigManager<AllowAll> {
    pub fn new() -> Self {
        ConfigManager::with_authorizer(AllowAll)
    }
}

impl Default for ConfigManager<AllowAll> {
    fn default() -> Self {
        ConfigManager::new()
    }
}

impl<A: Authorizer> ConfigManager<A> {
    pub fn with_authorizer(authorizer: A) -> Self {
        ConfigManager { authorizer, cache: HashMap::new() }
    }

    /// Build and persist the sidecar JSON plus the sentinel placeholder into
    /// `temp_folder`. Runs entirely before any archive I/O: configuration and
    /// authorization failures surface here with no partial state produced.
    pub fn finalize(
        &self,
        temp_folder: Option<&Path>,
        metadata: &ExportMetadata,
        blog_id: u64,
    ) -> Result<FinalizedPackage, WprimeError> {
        let temp_folder = temp_folder.ok_or(WprimeError::MissingTempFolder)?;
        if !temp_folder.is_dir() {
            return Err(WprimeError::MissingTempFolder);
        }
        if !self.authorizer.can_manage_packages(blog_id) {
            return Err(WprimeError::Unauthorized { blog_id });
        }

        let mut map = Map::new();
        if let Some(v) = &metadata.export_options {
            map.insert("export_options".into(), Value::String(v.clone()));
        }
        map.insert("encrypted".into(), Value::Bool(metadata.encrypted));
        if let Some(v) = &metadata.site_title {
            map.insert("site_title".into(), Value::String(v.clone()));
        }
        if let Some(v) = metadata.include_users {
            map.insert("include_users".into(), Value::Bool(v));
        }
        if let Some(v) = &metadata.export_type {
            map.insert("prime_mover_export_type".into(), Value::String(v.clone()));
        }
        if let Some(v) = metadata.target_id {
            map.insert("prime_mover_export_targetid".into(), Value::from(v));
        }
        if let Some(v) = &metadata.root_folder {
            map.insert("tar_root_folder".into(), Value::String(v.clone()));
        }

        // The signature is computed once here, not per file. Without the key
        // an encrypted export cannot be signed, the key stays out of the map
        // and the gate below rejects the configuration.
        if metadata.encrypted {
            if let (Some(key), Some(options)) = (&metadata.key, &metadata.export_options) {
                map.insert(
                    "prime_mover_encrypted_signature".into(),
                    Value::String(encryption_signature(key, blog_id, options)),
                );
            }
        } else {
            map.insert("prime_mover_encrypted_signature".into(), Value::String(String::new()));
        }

        map.insert(
            "wprime_created_utc".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        for (k, v) in &metadata.extra {
            map.insert(k.clone(), v.clone());
        }

        let missing = REQUIRED_CONFIG_KEYS.iter().any(|k| !map.contains_key(*k));
        if missing || map.len() < REQUIRED_CONFIG_KEYS.len() {
            return Err(WprimeError::CorruptedConfiguration { found: map.len() });
        }

        let root_folder = map["tar_root_folder"].as_str().unwrap_or_default().to_string();
        let config_path = temp_folder.join(PACKAGE_CONFIG_NAME);
        let sentinel_path = temp_folder.join(CLOSED_SENTINEL_NAME);
        fs::write(&config_path, serde_json::to_vec(&Value::Object(map))?)
            .map_err(|e| WprimeError::io(e, &config_path))?;
        fs::write(&sentinel_path, CLOSED_SENTINEL_TEXT)
            .map_err(|e| WprimeError::io(e, &sentinel_path))?;

        Ok(FinalizedPackage { config_path, sentinel_path, root_folder })
    }

    /// Read back the configuration embedded in `archive_path`.
    ///
    /// Returns the empty value when the archive lacks a valid configuration
    /// footer, when required keys are missing, or when the caller is not
    /// authorized — never an error for an unrecognizable package. Results are
    /// cached by a content hash of the path; `encoding_safe` strips the
    /// free-text `site_title` from the returned copy.
    pub fn load(
        &mut self,
        archive_path: &Path,
        blog_id: u64,
        encoding_safe: bool,
    ) -> Result<PackageConfig, WprimeError> {
        if !self.authorizer.can_manage_packages(blog_id) {
            return Ok(PackageConfig::default());
        }

        let cache_key = path_hash(archive_path);
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(strip_for_encoding(hit.clone(), encoding_safe));
        }

        let mut reader = match WprimeReader::open(archive_path, 0) {
            Ok(r) => r,
            Err(_) => return Ok(PackageConfig::default()),
        };
        let Some(text) = reader.package_config_text()? else {
            return Ok(PackageConfig::default());
        };
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) else {
            return Ok(PackageConfig::default());
        };
        if REQUIRED_CONFIG_KEYS.iter().any(|k| !map.contains_key(*k))
            || map.len() < REQUIRED_CONFIG_KEYS.len()
        {
            debug!(path = %archive_path.display(), "embedded configuration fails the key gate");
            return Ok(PackageConfig::default());
        }
        let Ok(config) = serde_json::from_value::<PackageConfig>(Value::Object(map)) else {
            return Ok(PackageConfig::default());
        };

        self.cache.insert(cache_key, config.clone());
        Ok(strip_for_encoding(config, encoding_safe))
    }

    /// Append the closure sentinel as the final archive member.
    ///
    /// Idempotent: an archive that already carries the sentinel reports
    /// success without writing. Returns `Ok(false)` when the sentinel file,
    /// its temp folder, or the archive itself is missing.
    pub fn close(
        &mut self,
        archive_path: &Path,
        finalized: &FinalizedPackage,
        blog_id: u64,
    ) -> Result<bool, WprimeError> {
        if !finalized.sentinel_path.is_file() {
            return Ok(false);
        }
        if !finalized.sentinel_path.parent().is_some_and(Path::is_dir) {
            return Ok(false);
        }
        if !archive_path.is_file() {
            return Ok(false);
        }

        let mut reader = WprimeReader::open(archive_path, 0)?;
        if reader.is_closed()? {
            debug!(path = %archive_path.display(), "archive already closed");
            return Ok(true);
        }
        drop(reader);

        let sentinel = fs::read(&finalized.sentinel_path)
            .map_err(|e| WprimeError::io(e, &finalized.sentinel_path))?;
        let local_name = if finalized.root_folder.is_empty() {
            CLOSED_SENTINEL_NAME.to_string()
        } else {
            format!("{}/{}", finalized.root_folder, CLOSED_SENTINEL_NAME)
        };

        let mut writer = WprimeWriter::append(archive_path)?;
        writer.append_bytes(&sentinel, &local_name, blog_id)?;
        writer.finish()?;
        // The sidecar must never change after closing; drop any stale cache.
        self.cache.remove(&path_hash(archive_path));
        Ok(true)
    }
}

fn strip_for_encoding(mut config: PackageConfig, encoding_safe: bool) -> PackageConfig {
    if encoding_safe {
        config.site_title = String::new();
    }
    config
}

fn path_hash(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    crypto::to_hex(&hasher.finalize())
}
