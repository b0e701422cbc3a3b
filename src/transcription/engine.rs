//! # Transcription Engine
//!
//! The speech-to-text capability consumed by the ingestion session. The
//! server ships no model of its own; a backend is plugged in through the
//! [`Transcriber`] trait.
//!
//! ## Backends:
//! - **NullTranscriber**: always unavailable, sessions answer with the
//!   placeholder transcript
//! - **CommandTranscriber**: runs an external program with the WAV path as its
//!   last argument and takes its trimmed stdout as the transcript
//!
//! Calls are blocking and may take seconds; they run on the blocking pool via
//! [`TranscriptionPool`](crate::transcription::worker::TranscriptionPool).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::TranscriptionError;

pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe a complete, closed WAV file.
    fn transcribe(&self, audio_path: &Path) -> Result<String, TranscriptionError>;
}

/// Transcription backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// External program to run; no program means transcription is unavailable
    pub command: Option<String>,

    /// Arguments placed before the audio path
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NullTranscriber;

impl Transcriber for NullTranscriber {
    fn name(&self) -> &str {
        "none"
    }

    fn transcribe(&self, _audio_path: &Path) -> Result<String, TranscriptionError> {
        Err(TranscriptionError::Unavailable("no transcription backend configured".into()))
    }
}

#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Transcriber for CommandTranscriber {
    fn name(&self) -> &str {
        &self.program
    }

    fn transcribe(&self, audio_path: &Path) -> Result<String, TranscriptionError> {
        debug!(program = %self.program, path = %audio_path.display(), "running transcription command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(audio_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TranscriptionError::Unavailable(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscriptionError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Build the configured backend.
pub fn build_transcriber(config: &TranscriptionConfig) -> Arc<dyn Transcriber> {
    match config.command.as_deref().map(str::trim) {
        Some(program) if !program.is_empty() => {
            info!(program, "using command transcription backend");
            Arc::new(CommandTranscriber::new(program, config.args.clone()))
        }
        _ => {
            info!("no transcription backend configured, replies will use the placeholder");
            Arc::new(NullTranscriber)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_transcriber_is_unavailable() {
        let err = NullTranscriber.transcribe(Path::new("x.wav")).unwrap_err();
        assert!(matches!(err, TranscriptionError::Unavailable(_)));
    }

    #[test]
    fn test_build_transcriber_selection() {
        assert_eq!(build_transcriber(&TranscriptionConfig::default()).name(), "none");

        let blank = TranscriptionConfig {
            command: Some("  ".into()),
            args: vec![],
        };
        assert_eq!(build_transcriber(&blank).name(), "none");

        let echo = TranscriptionConfig {
            command: Some("echo".into()),
            args: vec![],
        };
        assert_eq!(build_transcriber(&echo).name(), "echo");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_transcriber_reads_stdout() {
        let t = CommandTranscriber::new("echo", vec!["heard:".into()]);
        let text = t.transcribe(Path::new("/tmp/turn.wav")).unwrap();
        assert_eq!(text, "heard: /tmp/turn.wav");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failures() {
        let t = CommandTranscriber::new("false", vec![]);
        assert!(matches!(
            t.transcribe(Path::new("a.wav")).unwrap_err(),
            TranscriptionError::Failed(_)
        ));

        let t = CommandTranscriber::new("/definitely/not/a/program", vec![]);
        assert!(matches!(
            t.transcribe(Path::new("a.wav")).unwrap_err(),
            TranscriptionError::Unavailable(_)
        ));
    }
}
