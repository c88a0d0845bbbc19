//! Audio Transcription & Phrase Localization Engine
//!
//! Offline: transcribe with word timestamps, ask the language model which
//! phrases are sensitive, localize them in the word sequence, then overwrite
//! the matching spans with silence or a tone. Live: a bounded delay queue
//! redacts chunks before release.

use hound::{SampleFormat, WavSpec};
use serde::{Deserialize, Serialize};
use shield_sdk::errors::ShieldError;
use std::path::Path;
use thiserror::Error;

pub mod extract;
pub mod live;
pub mod localize;
pub mod redact;
pub mod transcribe;

pub use extract::extract_phrases;
pub use live::{ChunkedTranscriber, LiveRedactor, ScriptedStream, StreamingTranscriber};
pub use localize::localize;
pub use transcribe::{ProcessTranscriber, ScriptedTranscriber, Transcriber, UnconfiguredTranscriber};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Transcriber failed: {0}")]
    Transcriber(String),

    #[error("Invalid segments: {0}")]
    InvalidSegments(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<AudioError> for ShieldError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::Io(io) => ShieldError::Io(io),
            AudioError::Cancelled => ShieldError::Cancelled,
            AudioError::InvalidSegments(msg) => ShieldError::TemporalIntegrityError(msg),
            other => ShieldError::ToolExecution(other.to_string()),
        }
    }
}

/// How a redaction segment is realized on the samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionMode {
    Silence,
    #[default]
    Beep,
    /// Leaves samples untouched; only useful to exercise failing compliance
    None,
}

impl std::str::FromStr for RedactionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silence" | "mute" => Ok(Self::Silence),
            "beep" => Ok(Self::Beep),
            "none" => Ok(Self::None),
            other => Err(format!("unknown redaction mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub text: String,
    #[serde(alias = "start_time")]
    pub start: f64,
    #[serde(alias = "end_time")]
    pub end: f64,
}

impl TranscriptWord {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }
}

/// Plain transcript text from timed words
pub fn transcript_text(words: &[TranscriptWord]) -> String {
    words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedactionSegment {
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub mode: RedactionMode,
}

impl RedactionSegment {
    pub fn new(start_time: f64, end_time: f64, mode: RedactionMode) -> Self {
        Self {
            start_time,
            end_time,
            mode,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn overlaps(&self, other: &RedactionSegment) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SegmentFile {
    segments: Vec<RedactionSegment>,
}

pub fn save_segments(path: &Path, segments: &[RedactionSegment]) -> Result<(), AudioError> {
    let text = serde_json::to_string_pretty(&SegmentFile {
        segments: segments.to_vec(),
    })
    .map_err(|e| AudioError::InvalidSegments(e.to_string()))?;
    std::fs::write(path, text)?;
    Ok(())
}

pub fn load_segments(path: &Path) -> Result<Vec<RedactionSegment>, AudioError> {
    let text = std::fs::read_to_string(path)?;
    let file: SegmentFile = serde_json::from_str(&text)
        .map_err(|e| AudioError::InvalidSegments(format!("{:?}: {}", path, e)))?;
    Ok(file.segments)
}

/// Result of the offline detection phase
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeechDetection {
    pub words: Vec<TranscriptWord>,
    pub phrases: Vec<String>,
    pub segments: Vec<RedactionSegment>,
    /// Clip duration in seconds
    pub duration: f64,
}

/// Decoded PCM audio, samples interleaved and scaled to [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub spec: WavSpec,
    pub samples: Vec<f32>,
}

impl AudioClip {
    /// 16-bit mono clip
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            spec: WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            },
            samples,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.spec.channels.max(1) as usize
    }

    /// Number of sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels()
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate().max(1) as f64
    }

    /// Frame index nearest to `secs`, clamped to the clip
    pub fn frame_at(&self, secs: f64) -> usize {
        let f = (secs.max(0.0) * self.sample_rate() as f64).round() as usize;
        f.min(self.frames())
    }

    pub fn read(path: &Path) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let samples = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let scale = int_scale(spec.bits_per_sample);
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(Self { spec, samples })
    }

    /// Write with the clip's original sample format and rate
    pub fn write(&self, path: &Path) -> Result<(), AudioError> {
        let mut writer = hound::WavWriter::create(path, self.spec)?;
        match self.spec.sample_format {
            SampleFormat::Float => {
                for s in &self.samples {
                    writer.write_sample(*s)?;
                }
            }
            SampleFormat::Int => {
                let scale = int_scale(self.spec.bits_per_sample);
                let max = scale - 1.0;
                for s in &self.samples {
                    let v = (s.clamp(-1.0, 1.0) * scale).round().clamp(-scale, max);
                    writer.write_sample(v as i32)?;
                }
            }
        }
        writer.finalize()?;
        Ok(())
    }
}

fn int_scale(bits: u16) -> f32 {
    (1u64 << (bits.clamp(1, 32) - 1)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_roundtrip_preserves_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        let clip = AudioClip::mono(8000, vec![0.0, 0.5, -0.5, 0.25]);
        clip.write(&path).unwrap();

        let back = AudioClip::read(&path).unwrap();
        assert_eq!(back.spec, clip.spec);
        for (a, b) in back.samples.iter().zip(&clip.samples) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_duration_and_frame_index() {
        let mut clip = AudioClip::mono(100, vec![0.0; 250]);
        assert_eq!(clip.duration(), 2.5);
        assert_eq!(clip.frame_at(1.0), 100);
        assert_eq!(clip.frame_at(9.0), 250);
        clip.spec.channels = 2;
        assert_eq!(clip.frames(), 125);
    }

    #[test]
    fn test_segments_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segments.json");
        let segs = vec![RedactionSegment::new(1.0, 2.0, RedactionMode::Silence)];
        save_segments(&path, &segs).unwrap();
        assert_eq!(load_segments(&path).unwrap(), segs);
    }

    #[test]
    fn test_segment_mode_defaults_to_beep() {
        let seg: RedactionSegment =
            serde_json::from_str(r#"{"start_time": 0.5, "end_time": 1.0}"#).unwrap();
        assert_eq!(seg.mode, RedactionMode::Beep);
    }

    #[test]
    fn test_word_accepts_long_field_names() {
        let w: TranscriptWord =
            serde_json::from_str(r#"{"text": "hi", "start_time": 0.1, "end_time": 0.2}"#).unwrap();
        assert_eq!(w, TranscriptWord::new("hi", 0.1, 0.2));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("BEEP".parse::<RedactionMode>().unwrap(), RedactionMode::Beep);
        assert_eq!("mute".parse::<RedactionMode>().unwrap(), RedactionMode::Silence);
        assert!("loud".parse::<RedactionMode>().is_err());
    }
}
