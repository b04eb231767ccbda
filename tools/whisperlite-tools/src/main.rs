mod scripted;
mod simulate;

use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use whisperlite_core::{
    catalog, data_dir, languages,
    settings::{self, SettingsPatch},
};
use whisperlite_engine::transcribe::{DecodeOptions, DecodeTask};
use whisperlite_observability::panic_log;
use whisperlite_storage::history;

use crate::{
    scripted::{ScriptedEngine, ScriptedTranslator},
    simulate::SimulateArgs,
};

#[derive(Parser, Debug)]
#[command(name = "whisperlite", version, about = "Background transcription job runner")]
struct Cli {
    /// Overrides WHISPERLITE_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List known models and whether they are cached.
    Models,
    #[command(subcommand)]
    Settings(SettingsCmd),
    /// Run one transcription job with a scripted engine.
    Simulate(SimulateCli),
    /// Show past transcripts, newest first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        before_ms: Option<i64>,
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    Show,
    Set {
        #[arg(long)]
        model_dir: Option<PathBuf>,
        #[arg(long)]
        transcript_dir: Option<PathBuf>,
        #[arg(long)]
        default_model: Option<String>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        #[arg(long)]
        require_accelerator: Option<bool>,
    },
}

#[derive(Args, Debug)]
struct SimulateCli {
    #[arg(long)]
    audio: PathBuf,
    /// Defaults to the configured default model.
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = 300)]
    setup_ms: u64,
    #[arg(long, default_value_t = 1500)]
    work_ms: u64,
    #[arg(long)]
    cancel_after_ms: Option<u64>,
    #[arg(long)]
    fail: bool,
    /// Accelerator memory the scripted engine reports, in GB.
    #[arg(long, default_value_t = 8.0)]
    accelerator_gb: f64,
    #[arg(long, conflicts_with = "accelerator_gb")]
    no_accelerator: bool,
    #[arg(long)]
    text: Option<String>,
    /// Spoken language code; detected by the model when omitted.
    #[arg(long)]
    language: Option<String>,
    #[arg(long, value_enum, default_value_t = TaskArg::Transcribe)]
    task: TaskArg,
    #[arg(long, default_value_t = 5)]
    beam_size: u32,
    #[arg(long, default_value_t = 5)]
    best_of: u32,
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,
    /// Translate the transcript into this language (code or name) afterwards.
    #[arg(long)]
    translate_to: Option<String>,
    #[arg(long, requires = "translate_to")]
    translate_fail: bool,
    /// Print the final summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TaskArg {
    Transcribe,
    Translate,
}

impl From<TaskArg> for DecodeTask {
    fn from(t: TaskArg) -> Self {
        match t {
            TaskArg::Transcribe => DecodeTask::Transcribe,
            TaskArg::Translate => DecodeTask::Translate,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = match cli.data_dir {
        Some(d) => d,
        None => data_dir::data_dir()?,
    };
    std::fs::create_dir_all(&dir)?;
    panic_log::install_best_effort(dir.clone());

    let mut stored = settings::load_settings(&dir)?;
    match cli.cmd {
        Cmd::Models => {
            let cfg = stored.resolve(&dir);
            println!("{:<10} {:>7} {:>7} {:>8}  notes", "model", "size", "ram", "vram");
            for m in catalog::MODELS {
                let mark = if catalog::is_cached(&cfg.model_dir, m.name) {
                    " [cached]"
                } else {
                    ""
                };
                let default = if m.name == cfg.default_model { " *" } else { "" };
                println!(
                    "{:<10} {:>7} {:>7} {:>6.1}GB  {}{mark}{default}",
                    m.name, m.size, m.ram, m.min_vram_gb, m.notes
                );
            }
        }
        Cmd::Settings(SettingsCmd::Show) => {
            println!("{}", serde_json::to_string_pretty(&stored.resolve(&dir))?);
        }
        Cmd::Settings(SettingsCmd::Set {
            model_dir,
            transcript_dir,
            default_model,
            poll_interval_ms,
            require_accelerator,
        }) => {
            stored.apply(SettingsPatch {
                model_dir,
                transcript_dir,
                default_model,
                poll_interval_ms,
                require_accelerator,
            })?;
            settings::save_settings(&dir, &stored)?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Cmd::Simulate(s) => {
            let cfg = stored.resolve(&dir);
            let mut engine = ScriptedEngine::new(
                Duration::from_millis(s.setup_ms),
                Duration::from_millis(s.work_ms),
            );
            engine.fail = s.fail;
            engine.accelerator_gb = (!s.no_accelerator).then_some(s.accelerator_gb);
            engine.text = s.text;
            let args = SimulateArgs {
                audio: s.audio,
                model: s.model.unwrap_or_else(|| cfg.default_model.clone()),
                options: DecodeOptions {
                    task: s.task.into(),
                    language: s.language,
                    beam_size: s.beam_size,
                    best_of: s.best_of,
                    temperature: s.temperature,
                },
                engine,
                cancel_after: s.cancel_after_ms.map(Duration::from_millis),
                translate_to: s.translate_to,
                translator: ScriptedTranslator {
                    fail: s.translate_fail,
                    ..ScriptedTranslator::default()
                },
            };
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            let summary = rt.block_on(simulate::run(&dir, &cfg, args))?;
            if s.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("job {} ended: {}", summary.job_id, summary.state.as_str());
                if let Some(code) = summary.language.as_deref() {
                    println!("language: {}", languages::display_name(code));
                }
                if let Some(t) = &summary.translation {
                    println!("translation job {} ended: {}", t.job_id, t.state.as_str());
                }
            }
        }
        Cmd::History {
            limit,
            before_ms,
            clear,
        } => {
            let db = history::db_path(&dir);
            if clear {
                history::clear(&db)?;
                println!("history cleared");
                return Ok(());
            }
            if limit <= 0 {
                return Err(anyhow!("--limit must be > 0"));
            }
            for item in history::list(&db, limit, before_ms)? {
                println!(
                    "{}  {:<9} {:>6}ms  {}  ({})",
                    format_ms(item.created_at_ms),
                    item.model,
                    item.elapsed_ms,
                    item.audio_file,
                    item.language
                );
                println!("    {}", item.text);
                if let Some(p) = item.transcript_path {
                    println!("    -> {p}");
                }
            }
        }
    }
    Ok(())
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_simulate_flags() {
        let cli = Cli::parse_from([
            "whisperlite",
            "simulate",
            "--audio",
            "a.wav",
            "--model",
            "tiny",
            "--cancel-after-ms",
            "50",
            "--fail",
            "--language",
            "de",
            "--task",
            "translate",
            "--translate-to",
            "French",
        ]);
        match cli.cmd {
            Cmd::Simulate(s) => {
                assert_eq!(s.audio, PathBuf::from("a.wav"));
                assert_eq!(s.model.as_deref(), Some("tiny"));
                assert_eq!(s.cancel_after_ms, Some(50));
                assert!(s.fail);
                assert_eq!(s.setup_ms, 300);
                assert_eq!(s.language.as_deref(), Some("de"));
                assert_eq!(DecodeTask::from(s.task), DecodeTask::Translate);
                assert_eq!((s.beam_size, s.best_of), (5, 5));
                assert_eq!(s.translate_to.as_deref(), Some("French"));
                assert!(!s.translate_fail);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn formats_epoch_millis() {
        assert_eq!(format_ms(i64::MAX), i64::MAX.to_string());
        assert_eq!(format_ms(0).len(), "1970-01-01 00:00:00".len());
    }
}
