use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::Instant,
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{env_flag, env_parse, now_ms};

const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000;
const DEFAULT_TRACE_MAX_FILES: usize = 5;
const BACKTRACE_MAX_CHARS: usize = 12_000;

/// `WHISPERLITE_TRACE_ENABLED=0` turns tracing off entirely.
pub fn enabled() -> bool {
    env_flag("WHISPERLITE_TRACE_ENABLED", true)
}

fn backtrace_enabled() -> bool {
    env_flag("WHISPERLITE_TRACE_BACKTRACE", true)
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

fn rotated_path(data_dir: &Path, n: usize) -> PathBuf {
    data_dir.join(format!("trace.jsonl.{n}"))
}

/// Shifts `trace.jsonl` to `trace.jsonl.1` (and older files up by one) once it
/// grows past `max_bytes`, keeping at most `max_files` rotated files.
fn rotate_if_needed(data_dir: &Path, max_bytes: u64, max_files: usize) {
    if max_files == 0 {
        return;
    }
    let current = trace_path(data_dir);
    match std::fs::metadata(&current) {
        Ok(m) if m.len() > max_bytes => {}
        _ => return,
    }

    // Drop the oldest first; rename onto an existing file fails on Windows.
    let _ = std::fs::remove_file(rotated_path(data_dir, max_files));
    for i in (1..max_files).rev() {
        let src = rotated_path(data_dir, i);
        if src.exists() {
            let _ = std::fs::rename(&src, rotated_path(data_dir, i + 1));
        }
    }
    let _ = std::fs::rename(&current, rotated_path(data_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    if !enabled() {
        return;
    }
    let mut line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };
    line.push('\n');

    let _guard = write_lock().lock().unwrap_or_else(|p| p.into_inner());
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed(
        data_dir,
        env_parse("WHISPERLITE_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES),
        env_parse("WHISPERLITE_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES),
    );

    let p = trace_path(data_dir);
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = written {
        crate::safe_eprintln!("trace: write failed: {}: {e}", p.display());
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

/// Scrubs the user name out of home-directory paths (`/home/<user>/...`).
fn redact_user_paths(s: &str) -> String {
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let after = &rest[pos + marker.len()..];
            let end = after.find(sep).unwrap_or(after.len());
            rest = &after[end..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub_after(s, "\\Users\\", '\\');
    let t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn backtrace_string() -> Option<String> {
    if !backtrace_enabled() {
        return None;
    }
    let bt = std::backtrace::Backtrace::force_capture();
    Some(clamp_chars(
        &redact_user_paths(&format!("{bt:?}")),
        BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(mut base: Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => {}
        Some(Value::Object(m)) => base.extend(m),
        Some(v) => {
            base.insert("extra".to_string(), v);
        }
    }
    Value::Object(base)
}

fn error_ctx(err: Option<&AnyhowError>, extra: Option<Value>) -> Option<Value> {
    let mut m = Map::new();
    if let Some(err) = err {
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        m.insert("err_chain".to_string(), json!(chain));
    }
    if let Some(bt) = backtrace_string() {
        m.insert("backtrace".to_string(), json!(bt));
    }
    if m.is_empty() {
        return extra;
    }
    Some(merge_ctx(m, extra))
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String, // io|logic|engine|db|panic
    pub code: String, // E_*
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub job_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn event(
    data_dir: &Path,
    job_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            job_id: job_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// A timed step. Ending it with `ok`/`err`/`skipped` writes the `end` record;
/// dropping it unfinished records the step as `aborted`.
pub struct Span {
    data_dir: PathBuf,
    job_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        job_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            data_dir: data_dir.to_path_buf(),
            job_id: job_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit("start", "ok", None, None, ctx);
        span
    }

    fn emit(
        &self,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        emit_best_effort(
            &self.data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                job_id: self.job_id.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op: op.to_string(),
                status: status.to_string(),
                duration_ms,
                error,
                ctx,
            },
        );
    }

    fn end(mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        let elapsed = self.t0.elapsed().as_millis();
        self.emit("end", status, Some(elapsed), error, ctx);
    }

    pub fn ok(self, ctx: Option<Value>) {
        self.end("ok", None, ctx);
    }

    pub fn skipped(self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.end("skipped", Some(error), ctx);
    }

    pub fn err(self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.end("err", Some(error), error_ctx(None, ctx));
    }

    pub fn err_anyhow(self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.end("err", Some(error), error_ctx(Some(err), ctx));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        let elapsed = self.t0.elapsed().as_millis();
        self.emit("end", "aborted", Some(elapsed), Some(error), error_ctx(None, None));
    }
}
