use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a .wprime archive from a directory or an explicit file list.
    #[command(alias = "p")]
    Pack {
        /// Root directory of the export; archive-local names substitute this
        /// prefix with the alias.
        #[arg(required = true)]
        root: PathBuf,

        /// The path for the output archive file (e.g. site.wprime).
        #[arg(short, long)]
        output: PathBuf,

        /// Newline-delimited file list to archive. When omitted, the root
        /// directory is walked and every file below it is listed.
        #[arg(long)]
        list: Option<PathBuf>,

        /// Archive-local prefix replacing the root path. [default: export]
        #[arg(long, default_value = "export")]
        alias: String,

        /// Exporting site/blog id, embedded per entry.
        #[arg(long, default_value_t = 1)]
        blog_id: u64,

        /// Target site id for the localized-language folder remap.
        #[arg(long)]
        target_site: Option<u64>,

        /// Set a password to encrypt the archive. If not provided, the archive will be unencrypted.
        #[arg(long)]
        password: Option<String>,

        /// Site title recorded in the package configuration.
        #[arg(long, default_value = "")]
        site_title: String,

        /// Export type tag recorded in the package configuration.
        #[arg(long, default_value = "single-site-export")]
        export_type: String,

        /// Record that user tables are part of this export.
        #[arg(long)]
        include_users: bool,

        /// Archive in media-export mode, which applies its own exclusion rule set.
        #[arg(long)]
        exporting_media: bool,

        /// Exclude paths containing this substring. Repeatable.
        #[arg(long)]
        exclude: Vec<String>,

        /// Persist resume state to this JSON file and run exactly one bounded
        /// invocation; re-run with the same flag to continue.
        #[arg(long)]
        state: Option<PathBuf>,

        /// Wall-clock ceiling per invocation, in seconds. [0 = unlimited]
        #[arg(long, default_value_t = 0)]
        budget_secs: u64,
    },

    /// Extract a .wprime archive into a directory.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory to extract into.
        #[arg(short, long)]
        output: PathBuf,

        /// Password for encrypted archives.
        #[arg(long)]
        password: Option<String>,

        /// Persist resume state to this JSON file and run exactly one bounded
        /// invocation; re-run with the same flag to continue.
        #[arg(long)]
        state: Option<PathBuf>,

        /// Wall-clock ceiling per invocation, in seconds. [0 = unlimited]
        #[arg(long, default_value_t = 0)]
        budget_secs: u64,

        /// Byte offset to start scanning the archive from.
        #[arg(long, default_value_t = 0)]
        base_offset: u64,
    },

    /// List the entries of a .wprime archive.
    List {
        /// The archive file to list contents of.
        #[arg(required = true)]
        archive: PathBuf,
    },

    /// Check an archive's structure, closure sentinel and package configuration.
    Verify {
        /// The archive file to verify.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

/// Gets the password from the command-line option or the `WPRIME_PASSWORD`
/// environment variable.
///
/// Priority:
/// 1. `--password` command-line argument.
/// 2. `WPRIME_PASSWORD` environment variable.
/// 3. Returns `Ok(None)` if neither is present, allowing the caller to prompt interactively.
pub fn get_password_from_opt_or_env(password_opt: Option<String>) -> Result<Option<String>, std::io::Error> {
    if let Some(pass) = password_opt {
        return Ok(Some(pass));
    }
    if let Ok(pass) = std::env::var("WPRIME_PASSWORD") {
        return Ok(Some(pass));
    }
    Ok(None)
}

/// Prompt for a password on the controlling terminal.
pub fn prompt_password() -> Result<String, std::io::Error> {
    rpassword::prompt_password("Archive password: ")
}

/// Parses command-line arguments using `clap` and returns the command to execute.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}
