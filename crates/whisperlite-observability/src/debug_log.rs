use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{env_flag, env_parse, metrics, now_ms};

const DEFAULT_MAX_PAYLOAD_BYTES: usize = 2_000_000;
const DEFAULT_MAX_JOBS: usize = 50;
const TRUNCATED_SUFFIX: &[u8] = b"\n...(truncated)\n";

/// Payload dumps are off unless `WHISPERLITE_DEBUG_VERBOSE` is set; transcripts
/// are user content.
pub fn verbose_enabled() -> bool {
    env_flag("WHISPERLITE_DEBUG_VERBOSE", false)
}

pub fn max_payload_bytes() -> usize {
    env_parse("WHISPERLITE_DEBUG_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD_BYTES)
}

pub fn max_jobs() -> usize {
    env_parse("WHISPERLITE_DEBUG_MAX_JOBS", DEFAULT_MAX_JOBS)
}

pub fn debug_root(data_dir: &Path) -> PathBuf {
    data_dir.join("debug")
}

pub fn debug_job_dir(data_dir: &Path, job_id: &str) -> PathBuf {
    debug_root(data_dir).join(job_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct PayloadInfo {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub truncated: bool,
    pub sha256: String,
}

fn sha256_hex(b: &[u8]) -> String {
    hex::encode(Sha256::digest(b))
}

fn truncate_with_suffix(mut b: Vec<u8>, max_bytes: usize) -> (Vec<u8>, bool) {
    if b.len() <= max_bytes {
        return (b, false);
    }
    b.truncate(max_bytes.saturating_sub(TRUNCATED_SUFFIX.len()));
    b.extend_from_slice(TRUNCATED_SUFFIX);
    (b, true)
}

/// Writes `bytes` to `debug/<job_id>/<filename>` and records a `type` line in
/// metrics. Returns `None` when verbose dumps are disabled or the write fails.
pub fn dump_payload_best_effort(
    data_dir: &Path,
    job_id: &str,
    filename: &str,
    event_type: &str,
    bytes: Vec<u8>,
) -> Option<PayloadInfo> {
    if !verbose_enabled() {
        return None;
    }
    let info = write_payload(data_dir, job_id, filename, bytes, max_payload_bytes())?;
    let line = serde_json::json!({
        "type": event_type,
        "ts_ms": now_ms(),
        "job_id": job_id,
        "payload_path": info.path.to_string_lossy(),
        "payload_bytes": info.bytes_written,
        "truncated": info.truncated,
        "sha256": info.sha256,
    });
    if let Err(e) = metrics::append_jsonl(data_dir, &line) {
        crate::safe_eprintln!("debug_log: metrics append failed: {e:#}");
    }
    prune_best_effort(data_dir, max_jobs());
    Some(info)
}

fn write_payload(
    data_dir: &Path,
    job_id: &str,
    filename: &str,
    bytes: Vec<u8>,
    max_bytes: usize,
) -> Option<PayloadInfo> {
    let (out, truncated) = truncate_with_suffix(bytes, max_bytes);
    let dir = debug_job_dir(data_dir, job_id);
    if let Err(e) = fs::create_dir_all(&dir) {
        crate::safe_eprintln!("debug_log: create_dir_all failed: {}: {e}", dir.display());
        return None;
    }
    let path = dir.join(filename);
    if let Err(e) = fs::write(&path, &out) {
        crate::safe_eprintln!("debug_log: write failed: {}: {e}", path.display());
        return None;
    }
    Some(PayloadInfo {
        path,
        bytes_written: out.len(),
        truncated,
        sha256: sha256_hex(&out),
    })
}

/// Keeps the `max_keep` most recently modified job directories.
fn prune_best_effort(data_dir: &Path, max_keep: usize) {
    let Ok(entries) = fs::read_dir(debug_root(data_dir)) else {
        return;
    };
    let mut dirs: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();
    if dirs.len() <= max_keep {
        return;
    }
    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, p) in dirs.into_iter().skip(max_keep) {
        if let Err(e) = fs::remove_dir_all(&p) {
            crate::safe_eprintln!("debug_log: remove_dir_all failed: {}: {e}", p.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_payload_is_truncated_with_marker() {
        let td = tempfile::tempdir().expect("tempdir");
        let info = write_payload(td.path(), "job-1", "transcript.txt", vec![b'a'; 200], 64)
            .expect("written");
        assert!(info.truncated);
        assert_eq!(info.bytes_written, 64);
        let on_disk = fs::read(&info.path).expect("read");
        assert!(on_disk.ends_with(TRUNCATED_SUFFIX));
        assert_eq!(info.sha256, sha256_hex(&on_disk));
        assert_eq!(info.sha256.len(), 64);
    }

    #[test]
    fn small_payload_is_kept_verbatim() {
        let td = tempfile::tempdir().expect("tempdir");
        let info = write_payload(td.path(), "job-2", "t.txt", b"hello".to_vec(), 64)
            .expect("written");
        assert!(!info.truncated);
        assert_eq!(fs::read(&info.path).expect("read"), b"hello");
    }

    #[test]
    fn prune_keeps_newest_job_dirs() {
        let td = tempfile::tempdir().expect("tempdir");
        for i in 0..4 {
            write_payload(td.path(), &format!("job-{i}"), "t.txt", b"x".to_vec(), 64)
                .expect("written");
        }
        prune_best_effort(td.path(), 2);
        let left = fs::read_dir(debug_root(td.path())).expect("read_dir").count();
        assert_eq!(left, 2);
    }
}
