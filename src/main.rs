//! Main entry point for the wprime CLI app

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wprime::cli::{self, Commands};
use wprime::codec::{ArchiveIntegrity, WprimeReader};
use wprime::config::{ConfigManager, ExportMetadata};
use wprime::crypto;
use wprime::pack::{self, PackRequest};
use wprime::resume::{ResumeState, StepOutcome, TimeBudget};
use wprime::walker::{ExportMode, LanguageRemap, MediaExclusions};

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        if e.downcast_ref::<clap::Error>().is_none() {
            eprintln!("Error: {}", e);
        }
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;

    match &command {
        Commands::Pack {
            root,
            output,
            list,
            alias,
            blog_id,
            target_site,
            password,
            site_title,
            export_type,
            include_users,
            exporting_media,
            exclude,
            state,
            budget_secs,
        } => {
            let pass = cli::get_password_from_opt_or_env(password.clone())?;
            let mode = if *exporting_media { ExportMode::ExportingMedia } else { ExportMode::General };
            let export_options =
                if *exporting_media { "exporting_media" } else { "complete_export" };

            let mut metadata = ExportMetadata {
                export_options: Some(export_options.to_string()),
                site_title: Some(site_title.clone()),
                include_users: Some(*include_users),
                export_type: Some(export_type.clone()),
                target_id: Some(target_site.unwrap_or(*blog_id)),
                root_folder: Some(alias.clone()),
                encrypted: false,
                key: None,
                extra: Default::default(),
            };
            let key = if let Some(pass) = &pass {
                let salt = crypto::generate_salt();
                let key = crypto::derive_key(pass, &salt);
                metadata.encrypted = true;
                metadata.key = Some(key);
                metadata
                    .extra
                    .insert("wprime_kdf_salt".into(), crypto::to_hex(&salt).into());
                Some(key)
            } else {
                None
            };

            // An explicit list drives the export; otherwise walk the root.
            let mut list_guard = None;
            let list_path = match list {
                Some(p) => p.clone(),
                None => {
                    let file = write_file_list(root)?;
                    let path = file.path().to_path_buf();
                    list_guard = Some(file);
                    path
                }
            };

            let temp = tempfile::tempdir()?;
            let request = PackRequest {
                list_path: &list_path,
                root,
                alias,
                output,
                blog_id: *blog_id,
                mode,
                key,
                remap: target_site.map(|t| LanguageRemap::wpml(*blog_id, t)),
                metadata,
                temp_folder: Some(temp.path()),
            };
            let policy = MediaExclusions {
                general: exclude.clone(),
                media_export: exclude.clone(),
            };
            let mut config = ConfigManager::new();

            let mut run_bounded = |state_path: &Path| -> Result<(), Box<dyn std::error::Error>> {
                let saved = load_state(state_path)?;
                let outcome =
                    pack::pack_step(&request, &policy, &mut config, &saved, &budget(*budget_secs))?;
                report_step(state_path, outcome, "pack")
            };

            match state {
                Some(state_path) => run_bounded(state_path)?,
                None => {
                    let bytes = pack::pack_to_completion(&request, &policy, &mut config, || {
                        budget(*budget_secs)
                    })?;
                    println!("[wprime] Archive written: {} ({} bytes)", output.display(), bytes);
                }
            }
            drop(list_guard);
        }

        Commands::Extract { archive, output, password, state, budget_secs, base_offset } => {
            let key = extraction_key(archive, password.clone())?;
            fs::create_dir_all(output)?;

            match state {
                Some(state_path) => {
                    let saved = load_state(state_path)?;
                    let outcome = pack::extract_step(
                        archive,
                        output,
                        key.as_ref(),
                        *base_offset,
                        &saved,
                        &budget(*budget_secs),
                    )?;
                    report_step(state_path, outcome, "extract")?;
                }
                None => {
                    pack::extract_to_completion(archive, output, key.as_ref(), || {
                        budget(*budget_secs)
                    })?;
                    println!("[wprime] Extract complete -> {}", output.display());
                }
            }
        }

        Commands::List { archive } => {
            let mut reader = WprimeReader::open(archive, 0)?;
            let entries = reader.list_entries()?;
            println!("Archive Index ({} entries):", entries.len());
            for entry in entries {
                let marker = if entry.encrypted { " [encrypted]" } else { "" };
                println!("- {} ({} bytes, site {}){}", entry.name, entry.size, entry.owner, marker);
            }
        }

        Commands::Verify { archive } => {
            let mut reader = WprimeReader::open(archive, 0)?;
            match reader.integrity()? {
                ArchiveIntegrity::Sound => println!("[wprime] Structure: sound"),
                ArchiveIntegrity::Corrupted(diag) => {
                    println!("[wprime] Structure: CORRUPTED ({})", diag);
                    return Err("archive is corrupted".into());
                }
            }
            let closed = reader.is_closed()?;
            println!("[wprime] Closed: {}", if closed { "yes" } else { "no" });

            let mut config = ConfigManager::new();
            let package = config.load(archive, 0, false)?;
            if package.is_empty() {
                println!("[wprime] Package configuration: missing or invalid");
                return Err("archive carries no valid package configuration".into());
            }
            println!(
                "[wprime] Package: type '{}', target site {}, encrypted: {}",
                package.prime_mover_export_type,
                package.prime_mover_export_targetid,
                package.encrypted
            );
        }
    }

    Ok(())
}

fn budget(secs: u64) -> TimeBudget {
    if secs == 0 {
        TimeBudget::unlimited()
    } else {
        TimeBudget::starting_now(Duration::from_secs(secs))
    }
}

/// Walk `root` and write one absolute path per line.
fn write_file_list(root: &Path) -> Result<tempfile::NamedTempFile, Box<dyn std::error::Error>> {
    let mut file = tempfile::NamedTempFile::new()?;
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            writeln!(file, "{}", entry.path().display())?;
        }
    }
    file.flush()?;
    Ok(file)
}

fn load_state(path: &Path) -> Result<ResumeState, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    } else {
        Ok(ResumeState::default())
    }
}

fn report_step(
    state_path: &Path,
    outcome: StepOutcome,
    verb: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match outcome {
        StepOutcome::Complete { offset } => {
            if state_path.exists() {
                fs::remove_file(state_path)?;
            }
            println!("[wprime] {} complete ({} bytes)", verb, offset);
        }
        StepOutcome::Partial(state) => {
            fs::write(state_path, serde_json::to_vec(&state)?)?;
            println!(
                "[wprime] {} yielded at entry {} (file offset {}); run again to continue",
                verb, state.files_archived, state.file_position
            );
        }
    }
    Ok(())
}

/// Resolve the decryption key for `archive` from its embedded configuration:
/// unencrypted packages need none, encrypted ones derive it from the password
/// and the recorded KDF salt.
fn extraction_key(
    archive: &PathBuf,
    password: Option<String>,
) -> Result<Option<[u8; crypto::KEY_SIZE]>, Box<dyn std::error::Error>> {
    let mut config = ConfigManager::new();
    let package = config.load(archive, 0, false)?;
    if !package.encrypted {
        return Ok(None);
    }
    let pass = match cli::get_password_from_opt_or_env(password)? {
        Some(p) => p,
        None => cli::prompt_password()?,
    };
    let salt = package
        .kdf_salt()
        .ok_or("encrypted archive carries no key derivation salt")?;
    Ok(Some(crypto::derive_key(&pass, &salt)))
}
