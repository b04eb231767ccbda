use std::path::{Path, PathBuf};

use serde::Serialize;

/// A downloadable speech model and what it needs to run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelSpec {
    pub name: &'static str,
    pub ram: &'static str,
    pub notes: &'static str,
    pub size: &'static str,
    /// Accelerator memory needed to load the model, in GiB.
    pub min_vram_gb: f64,
}

const fn spec(
    name: &'static str,
    ram: &'static str,
    notes: &'static str,
    size: &'static str,
    min_vram_gb: f64,
) -> ModelSpec {
    ModelSpec {
        name,
        ram,
        notes,
        size,
        min_vram_gb,
    }
}

pub const MODELS: &[ModelSpec] = &[
    spec("tiny", "2GB+", "Fast, lower accuracy", "152MB", 1.0),
    spec("tiny.en", "2GB+", "English-only version", "152MB", 1.0),
    spec("base", "4GB+", "Base model", "292MB", 1.0),
    spec("base.en", "4GB+", "English-only version", "292MB", 1.0),
    spec("small", "5GB+", "Smaller, higher accuracy", "1GB", 2.0),
    spec("small.en", "6GB+", "English-only version", "1GB", 2.0),
    spec("medium", "8GB+", "Medium model", "2.9GB", 5.0),
    spec("medium.en", "8GB+", "English-only version", "2.9GB", 5.0),
    spec("large", "12GB+", "Large model", "5.8GB", 10.0),
    spec("large-v2", "15GB+", "Latest large model", "5.8GB", 10.0),
    spec("large-v3", "16GB+", "Newest large model", "6.2GB", 10.0),
];

pub const DEFAULT_MODEL: &str = "base";

pub fn lookup(name: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.name == name)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    MODELS.iter().map(|m| m.name)
}

/// Checkpoints are stored either as `<name>.pt` or `<name>.bin`.
pub fn cached_file(model_dir: &Path, name: &str) -> Option<PathBuf> {
    ["pt", "bin"]
        .iter()
        .map(|ext| model_dir.join(format!("{name}.{ext}")))
        .find(|p| p.is_file())
}

pub fn is_cached(model_dir: &Path, name: &str) -> bool {
    cached_file(model_dir, name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique_and_include_default() {
        let mut all: Vec<_> = names().collect();
        let n = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), n);
        assert!(lookup(DEFAULT_MODEL).is_some());
    }

    #[test]
    fn lookup_is_exact() {
        assert_eq!(lookup("large-v3").map(|m| m.size), Some("6.2GB"));
        assert!(lookup("Large-V3").is_none());
        assert!(lookup("whisper-turbo").is_none());
    }

    #[test]
    fn cached_file_accepts_pt_or_bin() {
        let td = tempfile::tempdir().expect("tempdir");
        assert!(cached_file(td.path(), "tiny").is_none());

        std::fs::write(td.path().join("tiny.bin"), b"x").expect("write");
        assert_eq!(
            cached_file(td.path(), "tiny"),
            Some(td.path().join("tiny.bin"))
        );

        std::fs::write(td.path().join("tiny.pt"), b"x").expect("write");
        assert_eq!(cached_file(td.path(), "tiny"), Some(td.path().join("tiny.pt")));

        assert!(is_cached(td.path(), "tiny"));
        assert!(!is_cached(td.path(), "tiny.en"));
    }
}
