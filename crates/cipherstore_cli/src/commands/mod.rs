//! CLI command implementations.

pub mod inspect;
pub mod keygen;
pub mod protect;

use cipherstore_transform::{EncryptionConfig, RecordTransform};
use std::path::Path;

/// Loads the config at `path` and builds its record transform.
pub fn load_transform(path: &Path) -> Result<RecordTransform, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No config found at {:?}", path).into());
    }
    Ok(EncryptionConfig::load(path)?.build()?)
}
