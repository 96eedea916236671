//! Keygen command implementation.

use cipherstore_transform::EncryptionConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// The key a config resolves to.
#[derive(Debug)]
pub struct KeyReport {
    /// Path of the key-encrypting key.
    pub kek_path: PathBuf,
    /// Short hex fingerprint of the key.
    pub fingerprint: String,
}

/// Runs the keygen command.
///
/// The key is created on first use and loaded afterwards; the fingerprint
/// identifies it without revealing it.
pub fn run(config: &Path) -> Result<KeyReport, Box<dyn std::error::Error>> {
    let config = EncryptionConfig::load(config)?;
    if !config.enabled {
        return Err("encryption is disabled in the config".into());
    }
    let utility = config.keyed_utility()?;
    info!(kek = %utility.kek_path().display(), "key ready");
    Ok(KeyReport {
        kek_path: utility.kek_path().to_path_buf(),
        fingerprint: utility.fingerprint(),
    })
}
