//! Speech-to-text with word timestamps

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::external::{remove_scratch, run_model_command};

use super::{AudioClip, AudioError, TranscriptWord};

pub trait Transcriber: Send + Sync {
    /// Words with start/end times in seconds from the start of `clip`
    fn transcribe(&self, clip: &AudioClip) -> Result<Vec<TranscriptWord>, AudioError>;
}

/// Runs an external speech model on a temporary WAV file
///
/// The command receives the WAV path as its last argument and prints a JSON
/// array of `{"text", "start", "end"}` words, or an object with that array
/// under `"words"`.
pub struct ProcessTranscriber {
    command: Vec<String>,
    scratch: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriberOutput {
    List(Vec<TranscriptWord>),
    Wrapped { words: Vec<TranscriptWord> },
}

impl ProcessTranscriber {
    pub fn new(
        command: Vec<String>,
        scratch: PathBuf,
        timeout: Duration,
    ) -> Result<Self, AudioError> {
        if command.is_empty() {
            return Err(AudioError::Transcriber("empty transcriber command".to_string()));
        }
        std::fs::create_dir_all(&scratch)?;
        Ok(Self {
            command,
            scratch,
            timeout,
        })
    }
}

impl Transcriber for ProcessTranscriber {
    fn transcribe(&self, clip: &AudioClip) -> Result<Vec<TranscriptWord>, AudioError> {
        let wav = self
            .scratch
            .join(format!("transcribe_{}.wav", uuid::Uuid::new_v4()));
        clip.write(&wav)?;

        let stdout = run_model_command(&self.command, &wav, self.timeout);
        remove_scratch(&wav);
        let stdout = stdout.map_err(|e| AudioError::Transcriber(e.to_string()))?;

        let parsed: TranscriberOutput = serde_json::from_slice(&stdout)
            .map_err(|e| AudioError::Transcriber(format!("unparseable transcript: {}", e)))?;
        let words = match parsed {
            TranscriberOutput::List(w) | TranscriberOutput::Wrapped { words: w } => w,
        };
        debug!(words = words.len(), duration = clip.duration(), "Transcribed clip");
        Ok(words)
    }
}

/// Placeholder when no transcriber command is configured
pub struct UnconfiguredTranscriber;

impl Transcriber for UnconfiguredTranscriber {
    fn transcribe(&self, _clip: &AudioClip) -> Result<Vec<TranscriptWord>, AudioError> {
        Err(AudioError::Transcriber(
            "no transcriber configured; set audio.transcriber_command".to_string(),
        ))
    }
}

/// Recognizes a fixed word list against a reference recording
///
/// A word is heard only while at least half of its samples still match the
/// reference, so a beeped or silenced span stops being recognized and an
/// untouched one keeps being recognized.
pub struct ScriptedTranscriber {
    reference: AudioClip,
    words: Vec<TranscriptWord>,
}

const MATCH_TOLERANCE: f32 = 2e-3;

impl ScriptedTranscriber {
    pub fn new(reference: AudioClip, words: Vec<TranscriptWord>) -> Self {
        Self { reference, words }
    }

    fn still_audible(&self, clip: &AudioClip, word: &TranscriptWord) -> bool {
        let ch = clip.channels();
        let start = clip.frame_at(word.start) * ch;
        let end = (clip.frame_at(word.end) * ch)
            .min(clip.samples.len())
            .min(self.reference.samples.len());
        if end <= start {
            return false;
        }
        let matching = clip.samples[start..end]
            .iter()
            .zip(&self.reference.samples[start..end])
            .filter(|(a, b)| (*a - *b).abs() <= MATCH_TOLERANCE)
            .count();
        matching * 2 >= end - start
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&self, clip: &AudioClip) -> Result<Vec<TranscriptWord>, AudioError> {
        Ok(self
            .words
            .iter()
            .filter(|w| self.still_audible(clip, w))
            .cloned()
            .collect())
    }
}
