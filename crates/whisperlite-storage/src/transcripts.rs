use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};

/// Writes `text` to `<dir>/<stem>.txt` as UTF-8, surrounding whitespace
/// trimmed. An existing file with the same name is overwritten.
pub fn save_text(dir: &Path, stem: &str, text: &str) -> Result<PathBuf> {
    let text = text.trim();
    if text.is_empty() {
        return Err(anyhow!("no text to save"));
    }
    fs::create_dir_all(dir).context("create transcript dir failed")?;
    let path = dir.join(format!("{}.txt", sanitize_stem(stem)));
    fs::write(&path, text).with_context(|| format!("write {} failed", path.display()))?;
    Ok(path)
}

/// The transcript name for an audio file: its file stem, or `transcript`.
pub fn stem_for(audio_file: &Path) -> String {
    audio_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "transcript".to_string())
}

fn sanitize_stem(stem: &str) -> String {
    let s: String = stem
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if s.is_empty() || s.chars().all(|c| c == '.') {
        "transcript".to_string()
    } else {
        s
    }
}
