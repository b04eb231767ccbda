use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use whisperlite_core::{languages, settings::Resolved};
use whisperlite_engine::{
    transcribe::{DecodeOptions, TranscribeOp, TranscribeRequest, Transcript},
    translate::{TranslateOp, TranslateRequest, Translation},
    CancelOutcome, JobHandle, JobRunner, JobState, Message,
};
use whisperlite_observability::{now_ms, safe_eprintln};
use whisperlite_storage::{history, transcripts};

use crate::scripted::{ScriptedEngine, ScriptedTranslator};

pub struct SimulateArgs {
    pub audio: PathBuf,
    pub model: String,
    pub options: DecodeOptions,
    pub engine: ScriptedEngine,
    pub cancel_after: Option<Duration>,
    /// Translate the finished transcript into this language.
    pub translate_to: Option<String>,
    pub translator: ScriptedTranslator,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub job_id: String,
    pub state: JobState,
    pub messages: usize,
    pub elapsed_ms: Option<u128>,
    pub language: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub error: Option<String>,
    pub translation: Option<TranslationSummary>,
}

#[derive(Debug, Serialize)]
pub struct TranslationSummary {
    pub job_id: String,
    pub state: JobState,
    pub target_code: Option<String>,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

struct Drained<T> {
    state: JobState,
    messages: usize,
    result: Option<(T, Duration)>,
    error: Option<String>,
}

/// Runs the transcription, then the optional translation, one job at a time
/// on the same runner. Every job is drained on the poll interval until its
/// terminal message.
pub async fn run(data_dir: &Path, cfg: &Resolved, args: SimulateArgs) -> Result<Summary> {
    let req = TranscribeRequest::new(args.model, args.audio).with_options(args.options);
    req.validate()?;

    let runner = JobRunner::with_data_dir(data_dir);
    let op = TranscribeOp::new(args.engine, &cfg.model_dir, cfg.require_accelerator)
        .with_debug_dump(data_dir, format!("simulate-{}", now_ms()));
    let handle = runner
        .start(op, req.clone())
        .context("failed to start transcription")?;
    let job_id = handle.id().to_string();
    println!("job {job_id} started");

    let done = drain(&runner, handle, cfg.poll_interval, args.cancel_after, |t: &Transcript| {
        format!("({}): {}", languages::display_name(&t.language), t.text)
    })
    .await;

    let mut summary = Summary {
        job_id,
        state: done.state,
        messages: done.messages,
        elapsed_ms: None,
        language: None,
        transcript_path: None,
        error: done.error,
        translation: None,
    };
    let Some((transcript, elapsed)) = done.result else {
        return Ok(summary);
    };
    summary.elapsed_ms = Some(elapsed.as_millis());
    summary.language = Some(transcript.language.clone());
    summary.transcript_path = persist(data_dir, cfg, &req, &summary.job_id, &transcript, elapsed);

    if let Some(target) = args.translate_to {
        let tr = TranslateRequest::new(transcript.text.clone(), target);
        summary.translation = Some(
            translate(&runner, cfg, &req, tr, args.translator)
                .await
                .context("failed to start translation")?,
        );
    }
    Ok(summary)
}

async fn translate(
    runner: &JobRunner,
    cfg: &Resolved,
    source: &TranscribeRequest,
    req: TranslateRequest,
    translator: ScriptedTranslator,
) -> Result<TranslationSummary> {
    let handle = runner.start(TranslateOp::new(translator), req)?;
    let job_id = handle.id().to_string();
    println!("job {job_id} started (translation)");

    let done = drain(runner, handle, cfg.poll_interval, None, |t: &Translation| {
        format!("({}): {}", t.target_name, t.text)
    })
    .await;

    let mut summary = TranslationSummary {
        job_id,
        state: done.state,
        target_code: None,
        path: None,
        error: done.error,
    };
    if let Some((t, _)) = done.result {
        let stem = format!("{}.{}", transcripts::stem_for(&source.audio_file), t.target_code);
        summary.path = match transcripts::save_text(&cfg.transcript_dir, &stem, &t.text) {
            Ok(p) => {
                println!("saved {}", p.display());
                Some(p)
            }
            Err(e) => {
                safe_eprintln!("translation not saved: {e:#}");
                None
            }
        };
        summary.target_code = Some(t.target_code);
    }
    Ok(summary)
}

async fn drain<T>(
    runner: &JobRunner,
    mut handle: JobHandle<T>,
    poll_interval: Duration,
    cancel_after: Option<Duration>,
    describe: impl Fn(&T) -> String,
) -> Drained<T> {
    let cancel_at = cancel_after.map(|d| Instant::now() + d);
    let mut tick = time::interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut out = Drained {
        state: JobState::Running,
        messages: 0,
        result: None,
        error: None,
    };
    let mut cancel_sent = false;
    while !handle.is_exhausted() {
        tick.tick().await;
        if !cancel_sent && cancel_at.is_some_and(|at| Instant::now() >= at) {
            cancel_sent = true;
            let outcome = runner.request_cancel(&handle);
            println!("cancel: {}", outcome.advisory_note());
            if outcome == CancelOutcome::AlreadyFinished {
                continue;
            }
        }
        for msg in runner.poll(&mut handle) {
            out.messages += 1;
            match msg {
                Message::Progress(text) => println!("[{}] {text}", handle.id()),
                Message::Result { payload, elapsed } => {
                    println!(
                        "[{}] done in {:.2}s {}",
                        handle.id(),
                        elapsed.as_secs_f64(),
                        describe(&payload)
                    );
                    out.result = Some((payload, elapsed));
                }
                Message::Error(e) => {
                    println!("[{}] error: {e}", handle.id());
                    out.error = Some(e);
                }
                Message::CancelledBeforeWork => {
                    println!("[{}] cancelled before work started", handle.id())
                }
                Message::CancelledAfterWork => {
                    println!("[{}] cancelled; output discarded", handle.id())
                }
            }
        }
    }
    out.state = handle.state();
    out
}

/// Saves the transcript and records it in history. Failures are reported but
/// do not fail the job, which has already completed.
fn persist(
    data_dir: &Path,
    cfg: &Resolved,
    req: &TranscribeRequest,
    job_id: &str,
    t: &Transcript,
    elapsed: Duration,
) -> Option<PathBuf> {
    let saved = match transcripts::save_text(
        &cfg.transcript_dir,
        &transcripts::stem_for(&req.audio_file),
        &t.text,
    ) {
        Ok(p) => {
            println!("saved {}", p.display());
            Some(p)
        }
        Err(e) => {
            safe_eprintln!("transcript not saved: {e:#}");
            None
        }
    };
    let item = history::HistoryItem {
        job_id: job_id.to_string(),
        created_at_ms: now_ms(),
        model: req.model.clone(),
        audio_file: req.audio_file.display().to_string(),
        text: t.text.clone(),
        language: t.language.clone(),
        elapsed_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        transcript_path: saved.as_ref().map(|p| p.display().to_string()),
    };
    if let Err(e) = history::append(&history::db_path(data_dir), &item) {
        safe_eprintln!("history append failed: {e:#}");
    }
    saved
}
