use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use whisperlite_observability::trace::Span;

/// One finished transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub job_id: String,
    pub created_at_ms: i64,
    pub model: String,
    pub audio_file: String,
    pub text: String,
    pub language: String,
    pub elapsed_ms: i64,
    pub transcript_path: Option<String>,
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("history.sqlite3")
}

fn conn(db_path: &Path) -> Result<Connection> {
    let c = Connection::open(db_path).context("open sqlite failed")?;
    c.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS history (
          job_id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          model TEXT NOT NULL,
          audio_file TEXT NOT NULL,
          text TEXT NOT NULL,
          language TEXT NOT NULL,
          elapsed_ms INTEGER NOT NULL,
          transcript_path TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_created_at ON history(created_at_ms DESC);
        "#,
    )
    .context("init sqlite schema failed")?;
    Ok(c)
}

fn trace_dir(db_path: &Path) -> &Path {
    db_path.parent().unwrap_or_else(|| Path::new("."))
}

fn conn_traced(db_path: &Path, span: Span) -> Result<(Connection, Span)> {
    match conn(db_path) {
        Ok(c) => Ok((c, span)),
        Err(e) => {
            span.err_anyhow("db", "E_HISTORY_CONN", &e, None);
            Err(e)
        }
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryItem> {
    Ok(HistoryItem {
        job_id: row.get(0)?,
        created_at_ms: row.get(1)?,
        model: row.get(2)?,
        audio_file: row.get(3)?,
        text: row.get(4)?,
        language: row.get(5)?,
        elapsed_ms: row.get(6)?,
        transcript_path: row.get(7)?,
    })
}

pub fn append(db_path: &Path, item: &HistoryItem) -> Result<()> {
    let span = Span::start(
        trace_dir(db_path),
        Some(item.job_id.as_str()),
        "History",
        "HISTORY.append",
        Some(serde_json::json!({
            "model": item.model,
            "text_chars": item.text.chars().count(),
            "elapsed_ms": item.elapsed_ms,
        })),
    );
    let (c, span) = conn_traced(db_path, span)?;
    let r = c.execute(
        r#"
        INSERT OR REPLACE INTO history
        (job_id, created_at_ms, model, audio_file, text, language, elapsed_ms, transcript_path)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            item.job_id,
            item.created_at_ms,
            item.model,
            item.audio_file,
            item.text,
            item.language,
            item.elapsed_ms,
            item.transcript_path,
        ],
    );
    match r {
        Ok(_) => {
            span.ok(None);
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_HISTORY_INSERT", &e.to_string(), None);
            Err(anyhow::anyhow!(e).context("insert history failed"))
        }
    }
}

/// Newest first. `before_ms` pages backwards from an earlier result.
pub fn list(db_path: &Path, limit: i64, before_ms: Option<i64>) -> Result<Vec<HistoryItem>> {
    let span = Span::start(
        trace_dir(db_path),
        None,
        "History",
        "HISTORY.list",
        Some(serde_json::json!({"limit": limit, "before_ms": before_ms})),
    );
    let (c, span) = conn_traced(db_path, span)?;
    let queried = (|| -> Result<Vec<HistoryItem>> {
        let mut stmt = c
            .prepare(
                r#"
                SELECT job_id, created_at_ms, model, audio_file, text, language, elapsed_ms, transcript_path
                FROM history
                WHERE ?1 IS NULL OR created_at_ms < ?1
                ORDER BY created_at_ms DESC
                LIMIT ?2
                "#,
            )
            .context("prepare history list failed")?;
        let rows = stmt
            .query_map(params![before_ms, limit], item_from_row)
            .context("query history list failed")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read history row failed")
    })();
    match queried {
        Ok(out) => {
            span.ok(Some(serde_json::json!({"items": out.len()})));
            Ok(out)
        }
        Err(e) => {
            span.err_anyhow("db", "E_HISTORY_LIST", &e, None);
            Err(e)
        }
    }
}

pub fn clear(db_path: &Path) -> Result<()> {
    let span = Span::start(trace_dir(db_path), None, "History", "HISTORY.clear", None);
    let (c, span) = conn_traced(db_path, span)?;
    match c.execute("DELETE FROM history", []) {
        Ok(n) => {
            span.ok(Some(serde_json::json!({"deleted": n})));
            Ok(())
        }
        Err(e) => {
            span.err("db", "E_HISTORY_CLEAR", &e.to_string(), None);
            Err(anyhow::anyhow!(e).context("clear history failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(job_id: &str, created_at_ms: i64) -> HistoryItem {
        HistoryItem {
            job_id: job_id.to_string(),
            created_at_ms,
            model: "base".to_string(),
            audio_file: "/tmp/clip.wav".to_string(),
            text: format!("text {job_id}"),
            language: "en".to_string(),
            elapsed_ms: 1200,
            transcript_path: None,
        }
    }

    #[test]
    fn list_is_newest_first_and_pages_backwards() {
        let td = tempfile::tempdir().expect("tempdir");
        let db = db_path(td.path());
        for (id, ts) in [("a", 100), ("b", 300), ("c", 200)] {
            append(&db, &item(id, ts)).expect("append");
        }

        let all = list(&db, 10, None).expect("list");
        let ids: Vec<_> = all.iter().map(|i| i.job_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let first = list(&db, 1, None).expect("list");
        assert_eq!(first[0].job_id, "b");
        let next = list(&db, 10, Some(first[0].created_at_ms)).expect("list");
        let ids: Vec<_> = next.iter().map(|i| i.job_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn append_replaces_same_job_and_clear_empties() {
        let td = tempfile::tempdir().expect("tempdir");
        let db = db_path(td.path());
        append(&db, &item("a", 100)).expect("append");
        let mut updated = item("a", 100);
        updated.transcript_path = Some("/tmp/clip.txt".to_string());
        append(&db, &updated).expect("append");

        let all = list(&db, 10, None).expect("list");
        assert_eq!(all, vec![updated]);

        clear(&db).expect("clear");
        assert!(list(&db, 10, None).expect("list").is_empty());
    }

    #[test]
    fn calls_are_traced_next_to_the_database() {
        let td = tempfile::tempdir().expect("tempdir");
        let db = db_path(td.path());
        append(&db, &item("a", 1)).expect("append");
        list(&db, 5, None).expect("list");

        let raw = std::fs::read_to_string(whisperlite_observability::trace::trace_path(td.path()))
            .expect("trace");
        assert!(raw.contains("HISTORY.append"));
        assert!(raw.contains("HISTORY.list"));
    }
}
