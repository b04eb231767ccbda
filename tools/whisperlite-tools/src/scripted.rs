use std::{path::Path, thread, time::Duration};

use anyhow::{anyhow, Result};
use whisperlite_core::catalog::ModelSpec;
use whisperlite_engine::{
    transcribe::{AcceleratorInfo, DecodeOptions, Segment, SpeechEngine, Transcript},
    translate::TranslationEngine,
};

/// A stand-in engine that sleeps instead of running a model.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    pub setup: Duration,
    pub work: Duration,
    pub fail: bool,
    pub accelerator_gb: Option<f64>,
    pub text: Option<String>,
    pub language: String,
    loaded: Option<&'static str>,
}

impl ScriptedEngine {
    pub fn new(setup: Duration, work: Duration) -> Self {
        Self {
            setup,
            work,
            fail: false,
            accelerator_gb: Some(8.0),
            text: None,
            language: "en".to_string(),
            loaded: None,
        }
    }
}

impl SpeechEngine for ScriptedEngine {
    fn accelerator(&self) -> Result<AcceleratorInfo> {
        let memory_gb = self
            .accelerator_gb
            .ok_or_else(|| anyhow!("no CUDA-capable device detected"))?;
        Ok(AcceleratorInfo {
            name: "Scripted GPU".to_string(),
            memory_gb,
        })
    }

    fn load_model(&mut self, model: &ModelSpec, _model_dir: &Path) -> Result<()> {
        thread::sleep(self.setup);
        self.loaded = Some(model.name);
        Ok(())
    }

    fn transcribe(&mut self, audio_file: &Path, options: &DecodeOptions) -> Result<Transcript> {
        let model = self.loaded.ok_or_else(|| anyhow!("model not loaded"))?;
        thread::sleep(self.work);
        if self.fail {
            return Err(anyhow!("scripted failure while decoding"));
        }
        let text = self.text.clone().unwrap_or_else(|| {
            format!(
                "simulated {model} transcript of {}",
                audio_file.file_name().unwrap_or_default().to_string_lossy()
            )
        });
        Ok(Transcript {
            segments: vec![Segment {
                start_sec: 0.0,
                end_sec: self.work.as_secs_f64(),
                text: text.clone(),
            }],
            text,
            language: options
                .language
                .clone()
                .unwrap_or_else(|| self.language.clone()),
        })
    }

    fn release(&mut self) {
        self.loaded = None;
    }
}

/// Tags the text with the target code instead of translating it.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTranslator {
    pub work: Duration,
    pub fail: bool,
}

impl TranslationEngine for ScriptedTranslator {
    fn translate(&mut self, text: &str, target_code: &str) -> Result<String> {
        thread::sleep(self.work);
        if self.fail {
            return Err(anyhow!("scripted translation service unavailable"));
        }
        Ok(format!("[{target_code}] {text}"))
    }
}
