//! cipherstore CLI
//!
//! Offline tools for the keys and files of an encrypted storage.
//!
//! # Commands
//!
//! - `keygen` - Create (or load) the key named by the config and show it
//! - `protect` - Encrypt a file in blob format
//! - `unprotect` - Decrypt a blob-format file
//! - `inspect` - Show the frame state of files

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// cipherstore key and file tools.
#[derive(Parser)]
#[command(name = "cipherstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the encryption config file
    #[arg(global = true, short, long, default_value = "cipherstore.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the key-encrypting key if missing and show its fingerprint
    Keygen,

    /// Encrypt a file (in place when no destination is given)
    Protect {
        /// File to encrypt
        src: PathBuf,

        /// Where to write the encrypted file
        dst: Option<PathBuf>,
    },

    /// Decrypt a file
    Unprotect {
        /// File to decrypt
        src: PathBuf,

        /// Where to write the plaintext
        dst: PathBuf,
    },

    /// Show whether files are encrypted, compressed or plain
    Inspect {
        /// Files to inspect
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Keygen => {
            let report = commands::keygen::run(&cli.config)?;
            println!("kek:         {}", report.kek_path.display());
            println!("fingerprint: {}", report.fingerprint);
        }
        Commands::Protect { src, dst } => {
            commands::protect::protect(&cli.config, &src, dst.as_deref())?;
        }
        Commands::Unprotect { src, dst } => {
            commands::protect::unprotect(&cli.config, &src, &dst)?;
        }
        Commands::Inspect { files, format } => {
            commands::inspect::run(&files, &format)?;
        }
        Commands::Version => {
            println!("cipherstore CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
