//! Inspect command implementation.

use cipherstore_transform::FrameState;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Frame state of one file.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// File path.
    pub path: String,
    /// `encrypted`, `compressed` or `plain`.
    pub state: &'static str,
    /// File size in bytes.
    pub size: u64,
}

/// Runs the inspect command.
pub fn run(files: &[PathBuf], format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let results = files
        .iter()
        .map(|path| inspect_file(path))
        .collect::<io::Result<Vec<_>>>()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        _ => {
            for result in &results {
                println!("{:<10} {:>12}  {}", result.state, result.size, result.path);
            }
        }
    }

    Ok(())
}

/// Reads the marker of `path` and classifies it.
pub fn inspect_file(path: &Path) -> io::Result<InspectResult> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut prefix = Vec::with_capacity(2);
    file.take(2).read_to_end(&mut prefix)?;

    Ok(InspectResult {
        path: path.display().to_string(),
        state: FrameState::of(&prefix).as_str(),
        size,
    })
}
