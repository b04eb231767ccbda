use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use whisperlite_core::languages::{self, Language};

use crate::{job::CancelFlag, operation::Operation};

/// A text translation backend. `translate` blocks until the whole text is
/// done and cannot be interrupted.
pub trait TranslationEngine: Send + 'static {
    fn translate(&mut self, text: &str, target_code: &str) -> Result<String>;

    fn release(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslateRequest {
    pub text: String,
    /// Language code or name; anything unknown falls back to English.
    pub target_language: String,
}

impl TranslateRequest {
    pub fn new(text: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target_language: target_language.into(),
        }
    }

    /// Returns the resolved target and whether it was the English fallback.
    pub fn validate(&self) -> Result<(&'static Language, bool)> {
        if self.text.trim().is_empty() {
            return Err(anyhow!("no text to translate"));
        }
        Ok(match languages::find(&self.target_language) {
            Some(l) => (l, false),
            None => (&languages::ENGLISH, true),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Translation {
    pub text: String,
    pub target_code: String,
    pub target_name: String,
}

pub struct TranslateOp<E> {
    engine: E,
    target: Option<&'static Language>,
}

impl<E: TranslationEngine> TranslateOp<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            target: None,
        }
    }
}

impl<E: TranslationEngine> Operation<TranslateRequest> for TranslateOp<E> {
    type Output = Translation;

    fn setup(&mut self, req: &TranslateRequest, report: &mut dyn FnMut(String)) -> Result<()> {
        let (target, fell_back) = req.validate()?;
        if fell_back {
            report(format!(
                "unknown target language {:?}, using {}",
                req.target_language, target.name
            ));
        }
        report(format!("translating to {}", target.name));
        self.target = Some(target);
        Ok(())
    }

    fn run(&mut self, req: &TranslateRequest, _cancel: &CancelFlag) -> Result<Translation> {
        let target = self
            .target
            .ok_or_else(|| anyhow!("translation target not resolved"))?;
        let text = self
            .engine
            .translate(req.text.trim(), target.code)
            .with_context(|| format!("translation to {} failed", target.name))?;
        Ok(Translation {
            text,
            target_code: target.code.to_string(),
            target_name: target.name.to_string(),
        })
    }

    fn release(&mut self) {
        self.engine.release();
    }
}
