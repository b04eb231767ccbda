use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use whisperlite_core::{
    catalog::{self, ModelSpec},
    languages,
};
use whisperlite_observability::debug_log;

use crate::{job::CancelFlag, operation::Operation};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceleratorInfo {
    pub name: String,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub segments: Vec<Segment>,
}

/// A speech-to-text backend. Every call may block for a long time and none of
/// them can be interrupted.
pub trait SpeechEngine: Send + 'static {
    /// The accelerator the engine would run on, or an error if there is none.
    fn accelerator(&self) -> Result<AcceleratorInfo>;

    /// Loads `model`, downloading it into `model_dir` first if needed.
    fn load_model(&mut self, model: &ModelSpec, model_dir: &Path) -> Result<()>;

    fn transcribe(&mut self, audio_file: &Path, options: &DecodeOptions) -> Result<Transcript>;

    /// Drops the loaded model and frees accelerator memory.
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeTask {
    /// Text in the spoken language.
    Transcribe,
    /// English text, translated by the speech model itself.
    Translate,
}

/// Decoder settings handed to the engine with every transcription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeOptions {
    pub task: DecodeTask,
    /// Spoken language code; `None` lets the model detect it.
    pub language: Option<String>,
    pub beam_size: u32,
    pub best_of: u32,
    pub temperature: f32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            task: DecodeTask::Transcribe,
            language: None,
            beam_size: 5,
            best_of: 5,
            temperature: 0.0,
        }
    }
}

impl DecodeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 || self.best_of == 0 {
            return Err(anyhow!("beam_size and best_of must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(anyhow!(
                "temperature must be within 0.0..=1.0, got {}",
                self.temperature
            ));
        }
        if let Some(code) = self.language.as_deref() {
            if languages::by_code(code).is_none() {
                return Err(anyhow!("unknown spoken language: {code}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscribeRequest {
    pub model: String,
    pub audio_file: PathBuf,
    pub options: DecodeOptions,
}

impl TranscribeRequest {
    pub fn new(model: impl Into<String>, audio_file: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            audio_file: audio_file.into(),
            options: DecodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Checks a caller can make before starting a job.
    pub fn validate(&self) -> Result<&'static ModelSpec> {
        if self.audio_file.as_os_str().is_empty() {
            return Err(anyhow!("no audio file selected"));
        }
        if !self.audio_file.is_file() {
            return Err(anyhow!(
                "audio file not found: {}",
                self.audio_file.display()
            ));
        }
        self.options.validate()?;
        catalog::lookup(&self.model).ok_or_else(|| anyhow!("unknown model: {}", self.model))
    }
}

pub const NOTE_MODEL_DOWNLOAD: &str = "model not cached, will be downloaded";

pub struct TranscribeOp<E> {
    engine: E,
    model_dir: PathBuf,
    require_accelerator: bool,
    debug_dump: Option<(PathBuf, String)>,
}

impl<E: SpeechEngine> TranscribeOp<E> {
    pub fn new(engine: E, model_dir: impl Into<PathBuf>, require_accelerator: bool) -> Self {
        Self {
            engine,
            model_dir: model_dir.into(),
            require_accelerator,
            debug_dump: None,
        }
    }

    /// Dumps the transcript under `debug/<dump_id>/` when verbose debug logging
    /// is on.
    pub fn with_debug_dump(
        mut self,
        data_dir: impl Into<PathBuf>,
        dump_id: impl Into<String>,
    ) -> Self {
        self.debug_dump = Some((data_dir.into(), dump_id.into()));
        self
    }

    fn check_accelerator(&self, model: &ModelSpec) -> Result<AcceleratorInfo> {
        let acc = self
            .engine
            .accelerator()
            .context("no accelerator available; this engine does not run on CPU")?;
        if acc.memory_gb < model.min_vram_gb {
            return Err(anyhow!(
                "model {} needs {:.1} GB of accelerator memory, {} has {:.1} GB",
                model.name,
                model.min_vram_gb,
                acc.name,
                acc.memory_gb
            ));
        }
        Ok(acc)
    }
}

impl<E: SpeechEngine> Operation<TranscribeRequest> for TranscribeOp<E> {
    type Output = Transcript;

    fn setup(&mut self, req: &TranscribeRequest, report: &mut dyn FnMut(String)) -> Result<()> {
        let model = req.validate()?;
        if self.require_accelerator {
            let acc = self.check_accelerator(model)?;
            report(format!("using {} ({:.1} GB)", acc.name, acc.memory_gb));
        }
        if !catalog::is_cached(&self.model_dir, model.name) {
            report(format!("{NOTE_MODEL_DOWNLOAD} ({})", model.size));
        }
        if req.options.language.is_none() {
            report("spoken language: auto-detect".to_string());
        }
        report(format!("loading model {}", model.name));
        self.engine
            .load_model(model, &self.model_dir)
            .with_context(|| format!("failed to load model {}", model.name))
    }

    fn run(&mut self, req: &TranscribeRequest, _cancel: &CancelFlag) -> Result<Transcript> {
        let transcript = self
            .engine
            .transcribe(&req.audio_file, &req.options)
            .with_context(|| format!("transcription failed: {}", req.audio_file.display()))?;
        if let Some((data_dir, dump_id)) = &self.debug_dump {
            debug_log::dump_payload_best_effort(
                data_dir,
                dump_id,
                "transcript.txt",
                "debug_transcript",
                transcript.text.as_bytes().to_vec(),
            );
        }
        Ok(transcript)
    }

    fn release(&mut self) {
        self.engine.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::JobRunner;
    use crate::Message;
    use std::{
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    };

    #[derive(Default)]
    struct Calls {
        loaded: Vec<String>,
        options: Vec<DecodeOptions>,
        transcribed: usize,
        released: usize,
    }

    struct FakeEngine {
        accelerator: Option<AcceleratorInfo>,
        calls: Arc<Mutex<Calls>>,
    }

    fn fake(memory_gb: Option<f64>) -> (FakeEngine, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let engine = FakeEngine {
            accelerator: memory_gb.map(|memory_gb| AcceleratorInfo {
                name: "Test GPU".to_string(),
                memory_gb,
            }),
            calls: calls.clone(),
        };
        (engine, calls)
    }

    impl SpeechEngine for FakeEngine {
        fn accelerator(&self) -> Result<AcceleratorInfo> {
            self.accelerator
                .clone()
                .ok_or_else(|| anyhow!("no CUDA device"))
        }

        fn load_model(&mut self, model: &ModelSpec, _model_dir: &Path) -> Result<()> {
            self.calls.lock().unwrap().loaded.push(model.name.to_string());
            Ok(())
        }

        fn transcribe(&mut self, audio_file: &Path, options: &DecodeOptions) -> Result<Transcript> {
            let mut c = self.calls.lock().unwrap();
            c.transcribed += 1;
            c.options.push(options.clone());
            Ok(Transcript {
                text: format!(" words from {} ", audio_file.display()),
                language: options.language.clone().unwrap_or_else(|| "en".to_string()),
                segments: vec![Segment {
                    start_sec: 0.0,
                    end_sec: 1.5,
                    text: "words".to_string(),
                }],
            })
        }

        fn release(&mut self) {
            self.calls.lock().unwrap().released += 1;
        }
    }

    fn audio(dir: &Path) -> PathBuf {
        let p = dir.join("clip.wav");
        std::fs::write(&p, b"RIFF").expect("write audio");
        p
    }

    fn run_to_end(
        runner: &JobRunner,
        op: TranscribeOp<FakeEngine>,
        req: TranscribeRequest,
    ) -> Vec<Message<Transcript>> {
        let mut h = runner.start(op, req).expect("start");
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut out = Vec::new();
        while !h.is_exhausted() {
            assert!(Instant::now() < deadline);
            out.extend(runner.poll(&mut h));
            thread::sleep(Duration::from_millis(2));
        }
        out
    }

    #[test]
    fn validate_rejects_missing_file_and_unknown_model() {
        let td = tempfile::tempdir().expect("tempdir");
        let err = TranscribeRequest::new("base", "").validate().unwrap_err();
        assert!(err.to_string().contains("no audio file selected"));

        let err = TranscribeRequest::new("base", td.path().join("missing.wav"))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("audio file not found"));

        let err = TranscribeRequest::new("huge", audio(td.path()))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("unknown model: huge"));

        let model = TranscribeRequest::new("small", audio(td.path()))
            .validate()
            .expect("valid");
        assert_eq!(model.name, "small");
    }

    #[test]
    fn decode_options_default_to_auto_detect_and_are_checked() {
        let d = DecodeOptions::default();
        assert_eq!(d.task, DecodeTask::Transcribe);
        assert!(d.language.is_none());
        assert_eq!((d.beam_size, d.best_of, d.temperature), (5, 5, 0.0));
        assert!(d.validate().is_ok());

        let td = tempfile::tempdir().expect("tempdir");
        let bad = |options: DecodeOptions| {
            TranscribeRequest::new("base", audio(td.path()))
                .with_options(options)
                .validate()
                .unwrap_err()
                .to_string()
        };
        assert!(bad(DecodeOptions {
            beam_size: 0,
            ..DecodeOptions::default()
        })
        .contains("beam_size"));
        assert!(bad(DecodeOptions {
            temperature: 1.5,
            ..DecodeOptions::default()
        })
        .contains("temperature"));
        assert!(bad(DecodeOptions {
            language: Some("xx".to_string()),
            ..DecodeOptions::default()
        })
        .contains("unknown spoken language: xx"));
    }

    #[test]
    fn decode_options_reach_the_engine() {
        let td = tempfile::tempdir().expect("tempdir");
        let (engine, calls) = fake(Some(8.0));
        let options = DecodeOptions {
            task: DecodeTask::Translate,
            language: Some("de".to_string()),
            beam_size: 3,
            best_of: 2,
            temperature: 0.2,
        };
        let msgs = run_to_end(
            &JobRunner::new(),
            TranscribeOp::new(engine, td.path(), true),
            TranscribeRequest::new("base", audio(td.path())).with_options(options.clone()),
        );
        assert!(!msgs
            .iter()
            .any(|m| matches!(m, Message::Progress(t) if t.contains("auto-detect"))));
        match msgs.last() {
            Some(Message::Result { payload, .. }) => assert_eq!(payload.language, "de"),
            other => panic!("expected result, got {other:?}"),
        }
        assert_eq!(calls.lock().unwrap().options, vec![options]);
    }

    #[test]
    fn uncached_model_is_reported_before_loading() {
        let td = tempfile::tempdir().expect("tempdir");
        let (engine, calls) = fake(Some(8.0));
        let op = TranscribeOp::new(engine, td.path().join("models"), true);
        let msgs = run_to_end(
            &JobRunner::new(),
            op,
            TranscribeRequest::new("base", audio(td.path())),
        );

        let progress: Vec<&str> = msgs
            .iter()
            .filter_map(|m| match m {
                Message::Progress(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(progress[0], "loading");
        assert!(progress.iter().any(|t| t.starts_with(NOTE_MODEL_DOWNLOAD)));
        assert!(progress.contains(&"loading model base"));
        assert!(progress.contains(&"spoken language: auto-detect"));
        assert_eq!(progress.last(), Some(&"running"));

        match msgs.last() {
            Some(Message::Result { payload, .. }) => {
                assert_eq!(payload.language, "en");
                assert!(payload.text.contains("clip.wav"));
                assert_eq!(payload.segments.len(), 1);
            }
            other => panic!("expected result, got {other:?}"),
        }
        let c = calls.lock().unwrap();
        assert_eq!(c.loaded, vec!["base".to_string()]);
        assert_eq!((c.transcribed, c.released), (1, 1));
    }

    #[test]
    fn cached_model_skips_download_note() {
        let td = tempfile::tempdir().expect("tempdir");
        let models = td.path().join("models");
        std::fs::create_dir_all(&models).expect("mkdir");
        std::fs::write(models.join("tiny.pt"), b"weights").expect("write");

        let (engine, _calls) = fake(Some(2.0));
        let msgs = run_to_end(
            &JobRunner::new(),
            TranscribeOp::new(engine, &models, true),
            TranscribeRequest::new("tiny", audio(td.path())),
        );
        assert!(!msgs
            .iter()
            .any(|m| matches!(m, Message::Progress(t) if t.starts_with(NOTE_MODEL_DOWNLOAD))));
        assert!(matches!(msgs.last(), Some(Message::Result { .. })));
    }

    #[test]
    fn missing_accelerator_fails_setup_and_still_releases() {
        let td = tempfile::tempdir().expect("tempdir");
        let (engine, calls) = fake(None);
        let msgs = run_to_end(
            &JobRunner::new(),
            TranscribeOp::new(engine, td.path(), true),
            TranscribeRequest::new("base", audio(td.path())),
        );
        assert_eq!(msgs.len(), 2);
        match &msgs[1] {
            Message::Error(e) => {
                assert!(e.contains("no accelerator available"), "{e}");
                assert!(e.contains("no CUDA device"), "{e}");
            }
            other => panic!("expected error, got {other:?}"),
        }
        let c = calls.lock().unwrap();
        assert!(c.loaded.is_empty());
        assert_eq!((c.transcribed, c.released), (0, 1));
    }

    #[test]
    fn small_accelerator_is_rejected_for_large_models() {
        let td = tempfile::tempdir().expect("tempdir");
        let (engine, _calls) = fake(Some(4.0));
        let msgs = run_to_end(
            &JobRunner::new(),
            TranscribeOp::new(engine, td.path(), true),
            TranscribeRequest::new("large-v3", audio(td.path())),
        );
        match msgs.last() {
            Some(Message::Error(e)) => {
                assert!(e.contains("model large-v3 needs 10.0 GB"), "{e}");
                assert!(e.contains("Test GPU has 4.0 GB"), "{e}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn accelerator_check_can_be_turned_off() {
        let td = tempfile::tempdir().expect("tempdir");
        let (engine, calls) = fake(None);
        let msgs = run_to_end(
            &JobRunner::new(),
            TranscribeOp::new(engine, td.path(), false),
            TranscribeRequest::new("medium", audio(td.path())),
        );
        assert!(matches!(msgs.last(), Some(Message::Result { .. })));
        assert_eq!(calls.lock().unwrap().loaded, vec!["medium".to_string()]);
    }
}
