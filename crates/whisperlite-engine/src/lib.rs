//! Single-slot background job runner.
//!
//! A [`JobRunner`] runs at most one [`Operation`] at a time on its own worker
//! thread. The caller drains [`Message`]s with [`JobRunner::poll`] from its own
//! loop and may ask for cancellation, which is checked only before and after
//! the operation's uninterruptible unit of work.

pub mod job;
pub mod operation;
pub mod runner;
pub mod transcribe;
pub mod translate;

pub use job::{CancelFlag, JobId, JobState, Message};
pub use operation::{from_fn, Operation};
pub use runner::{CancelOutcome, JobHandle, JobRunner, StartError};
pub use transcribe::{DecodeOptions, SpeechEngine, TranscribeOp, TranscribeRequest, Transcript};
pub use translate::{TranslateOp, TranslateRequest, Translation, TranslationEngine};
