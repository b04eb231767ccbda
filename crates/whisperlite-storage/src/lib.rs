pub mod history;
pub mod transcripts;
