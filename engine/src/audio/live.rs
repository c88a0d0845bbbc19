//! Live audio redaction through a bounded delay queue
//!
//! Incoming chunks are fed to a streaming transcriber and held for a fixed
//! number of chunks before release. At release time every flagged interval
//! overlapping the chunk is overwritten. When the transcript has not yet
//! reached the end of a chunk whose time is up, the chunk is released as
//! silence: the queue never emits audio the transcriber has not seen. A chunk
//! the transcriber failed on is never confirmed and is released as silence too.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::localize::localize;
use super::redact::{fill_segment, Tone};
use super::{AudioClip, AudioError, RedactionMode, RedactionSegment, Transcriber, TranscriptWord};
use crate::config::AudioConfig;

/// A contiguous slice of the stream
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Stream time of the first sample frame, seconds
    pub start: f64,
    /// Interleaved samples
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn end(&self, channels: usize, sample_rate: u32) -> f64 {
        self.start + (self.samples.len() / channels.max(1)) as f64 / sample_rate.max(1) as f64
    }
}

/// Incremental transcription
pub trait StreamingTranscriber: Send {
    /// Consume the next chunk, returning newly committed words
    fn push(&mut self, chunk: &AudioChunk) -> Result<Vec<TranscriptWord>, AudioError>;

    /// Stream time up to which the transcript is final
    fn committed_until(&self) -> f64;

    /// Commit whatever is pending at end of stream
    fn flush(&mut self) -> Result<Vec<TranscriptWord>, AudioError> {
        Ok(Vec::new())
    }
}

/// Adapts a batch transcriber by transcribing each chunk on its own
pub struct ChunkedTranscriber {
    inner: Arc<dyn Transcriber>,
    channels: u16,
    sample_rate: u32,
    committed: f64,
}

impl ChunkedTranscriber {
    pub fn new(inner: Arc<dyn Transcriber>, channels: u16, sample_rate: u32) -> Self {
        Self {
            inner,
            channels,
            sample_rate,
            committed: 0.0,
        }
    }
}

impl StreamingTranscriber for ChunkedTranscriber {
    fn push(&mut self, chunk: &AudioChunk) -> Result<Vec<TranscriptWord>, AudioError> {
        let mut clip = AudioClip::mono(self.sample_rate, chunk.samples.clone());
        clip.spec.channels = self.channels;
        let words = self
            .inner
            .transcribe(&clip)?
            .into_iter()
            .map(|w| TranscriptWord::new(w.text, w.start + chunk.start, w.end + chunk.start))
            .collect();
        self.committed = chunk.end(self.channels as usize, self.sample_rate);
        Ok(words)
    }

    fn committed_until(&self) -> f64 {
        self.committed
    }
}

/// Commits a fixed word list with a constant recognition lag
pub struct ScriptedStream {
    pending: VecDeque<TranscriptWord>,
    lag: f64,
    channels: usize,
    sample_rate: u32,
    committed: f64,
}

impl ScriptedStream {
    pub fn new(words: Vec<TranscriptWord>, lag_secs: f64, channels: usize, sample_rate: u32) -> Self {
        Self {
            pending: words.into(),
            lag: lag_secs,
            channels,
            sample_rate,
            committed: 0.0,
        }
    }
}

impl StreamingTranscriber for ScriptedStream {
    fn push(&mut self, chunk: &AudioChunk) -> Result<Vec<TranscriptWord>, AudioError> {
        let heard = chunk.end(self.channels, self.sample_rate);
        self.committed = (heard - self.lag).max(self.committed);
        let mut out = Vec::new();
        while self.pending.front().is_some_and(|w| w.end <= self.committed) {
            if let Some(w) = self.pending.pop_front() {
                out.push(w);
            }
        }
        Ok(out)
    }

    fn committed_until(&self) -> f64 {
        self.committed
    }

    fn flush(&mut self) -> Result<Vec<TranscriptWord>, AudioError> {
        self.committed = f64::INFINITY;
        Ok(self.pending.drain(..).collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveAudioStats {
    pub chunks: usize,
    pub redacted_chunks: usize,
    /// Chunks released as silence because the transcript lagged or failed
    pub failed_closed: usize,
    /// Transcriber calls that returned an error
    pub transcriber_errors: usize,
}

pub struct LiveRedactor<T: StreamingTranscriber> {
    transcriber: T,
    phrases: Vec<String>,
    fuzzy_threshold: f64,
    mode: RedactionMode,
    tone: Tone,
    pad_secs: f64,
    delay_chunks: usize,
    channels: usize,
    sample_rate: u32,
    /// Queued chunks, each with whether the transcriber accepted it
    buffer: VecDeque<(AudioChunk, bool)>,
    words: Vec<TranscriptWord>,
    flagged: Vec<RedactionSegment>,
    stats: LiveAudioStats,
}

impl<T: StreamingTranscriber> LiveRedactor<T> {
    pub fn new(
        transcriber: T,
        phrases: Vec<String>,
        config: &AudioConfig,
        channels: usize,
        sample_rate: u32,
    ) -> Self {
        let delay_chunks = config.live_delay_ms.div_ceil(config.chunk_ms.max(1)) as usize;
        Self {
            transcriber,
            phrases,
            fuzzy_threshold: config.fuzzy_threshold,
            mode: config.mode,
            tone: Tone::live(config.beep_hz),
            pad_secs: config.pad_ms as f64 / 1000.0,
            delay_chunks: delay_chunks.max(1),
            channels: channels.max(1),
            sample_rate,
            buffer: VecDeque::new(),
            words: Vec::new(),
            flagged: Vec::new(),
            stats: LiveAudioStats::default(),
        }
    }

    pub fn delay_chunks(&self) -> usize {
        self.delay_chunks
    }

    pub fn stats(&self) -> LiveAudioStats {
        self.stats
    }

    /// Intervals flagged so far
    pub fn flagged(&self) -> &[RedactionSegment] {
        &self.flagged
    }

    /// Queue a chunk; returns chunks whose delay has elapsed
    ///
    /// A transcriber error does not stop the stream; the chunk stays
    /// unconfirmed and is released as silence.
    pub fn push(&mut self, chunk: AudioChunk) -> Result<Vec<AudioChunk>, AudioError> {
        let heard = match self.transcriber.push(&chunk) {
            Ok(words) => {
                self.absorb(words);
                true
            }
            Err(e) => {
                self.stats.transcriber_errors += 1;
                warn!(
                    chunk_start = chunk.start,
                    committed = self.transcriber.committed_until(),
                    error = %e,
                    "Transcriber failed on chunk; it will be released as silence"
                );
                false
            }
        };
        self.buffer.push_back((chunk, heard));

        let mut released = Vec::new();
        while self.buffer.len() > self.delay_chunks {
            if let Some((c, heard)) = self.buffer.pop_front() {
                released.push(self.release(c, heard, false));
            }
        }
        Ok(released)
    }

    /// End of stream: drain the queue
    pub fn finish(&mut self) -> Result<Vec<AudioChunk>, AudioError> {
        let flushed = match self.transcriber.flush() {
            Ok(words) => {
                self.absorb(words);
                true
            }
            Err(e) => {
                self.stats.transcriber_errors += 1;
                warn!(error = %e, "Transcriber flush failed; unconfirmed chunks released as silence");
                false
            }
        };
        let mut released = Vec::new();
        while let Some((c, heard)) = self.buffer.pop_front() {
            released.push(self.release(c, heard, flushed));
        }
        Ok(released)
    }

    fn absorb(&mut self, words: Vec<TranscriptWord>) {
        if words.is_empty() {
            return;
        }
        self.words.extend(words);
        self.flagged = localize(&self.words, &self.phrases, self.fuzzy_threshold, self.mode)
            .into_iter()
            .map(|s| RedactionSegment {
                end_time: s.end_time + self.pad_secs,
                ..s
            })
            .collect();
    }

    fn release(&mut self, mut chunk: AudioChunk, heard: bool, flushed: bool) -> AudioChunk {
        self.stats.chunks += 1;
        let end = chunk.end(self.channels, self.sample_rate);

        if !heard {
            chunk.samples.iter_mut().for_each(|s| *s = 0.0);
            self.stats.failed_closed += 1;
            return chunk;
        }
        if !flushed && self.transcriber.committed_until() < end {
            warn!(
                chunk_start = chunk.start,
                committed = self.transcriber.committed_until(),
                "Transcript behind release deadline; releasing silence"
            );
            chunk.samples.iter_mut().for_each(|s| *s = 0.0);
            self.stats.failed_closed += 1;
            return chunk;
        }

        let mut touched = false;
        for seg in &self.flagged {
            if seg.start_time < end && seg.end_time > chunk.start {
                fill_segment(
                    &mut chunk.samples,
                    self.channels,
                    self.sample_rate,
                    chunk.start,
                    seg,
                    self.tone,
                );
                touched = true;
            }
        }
        if touched {
            self.stats.redacted_chunks += 1;
            debug!(chunk_start = chunk.start, "Redacted live chunk");
        }
        chunk
    }
}

/// Split a clip into fixed-length chunks
pub fn chunk_clip(clip: &AudioClip, chunk_ms: u64) -> Vec<AudioChunk> {
    let channels = clip.channels();
    let frames_per_chunk = ((clip.sample_rate() as u64 * chunk_ms) / 1000).max(1) as usize;
    clip.samples
        .chunks(frames_per_chunk * channels)
        .enumerate()
        .map(|(i, samples)| AudioChunk {
            start: (i * frames_per_chunk) as f64 / clip.sample_rate().max(1) as f64,
            samples: samples.to_vec(),
        })
        .collect()
}

/// Stream `clip` through a redactor with a bounded producer queue
///
/// The producer paces chunks into a channel of `queue_depth`; the consumer
/// runs the redactor on the blocking pool and reassembles the output clip.
pub async fn run_live<T>(
    clip: AudioClip,
    mut redactor: LiveRedactor<T>,
    chunk_ms: u64,
    queue_depth: usize,
    cancel: CancellationToken,
) -> Result<(AudioClip, LiveAudioStats), AudioError>
where
    T: StreamingTranscriber + 'static,
{
    let spec = clip.spec;
    let chunks = chunk_clip(&clip, chunk_ms);
    let (tx, mut rx) = mpsc::channel::<AudioChunk>(queue_depth.max(1));

    let producer_cancel = cancel.clone();
    let producer = tokio::spawn(async move {
        for chunk in chunks {
            tokio::select! {
                _ = producer_cancel.cancelled() => break,
                sent = tx.send(chunk) => if sent.is_err() { break },
            }
        }
    });

    let consumer_cancel = cancel.clone();
    let consumer = tokio::task::spawn_blocking(move || -> Result<_, AudioError> {
        let mut out = Vec::with_capacity(clip.samples.len());
        while let Some(chunk) = rx.blocking_recv() {
            if consumer_cancel.is_cancelled() {
                return Err(AudioError::Cancelled);
            }
            for released in redactor.push(chunk)? {
                out.extend(released.samples);
            }
        }
        if consumer_cancel.is_cancelled() {
            return Err(AudioError::Cancelled);
        }
        for released in redactor.finish()? {
            out.extend(released.samples);
        }
        Ok((out, redactor.stats()))
    });

    let _ = producer.await;
    let (samples, stats) = consumer
        .await
        .map_err(|e| AudioError::Transcriber(format!("live consumer panicked: {}", e)))??;
    info!(
        chunks = stats.chunks,
        redacted = stats.redacted_chunks,
        failed_closed = stats.failed_closed,
        "Live audio pass complete"
    );
    Ok((AudioClip { spec, samples }, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(delay_ms: u64, chunk_ms: u64, mode: RedactionMode) -> AudioConfig {
        AudioConfig {
            mode,
            live_delay_ms: delay_ms,
            chunk_ms,
            pad_ms: 0,
            ..AudioConfig::default()
        }
    }

    fn words() -> Vec<TranscriptWord> {
        vec![
            TranscriptWord::new("my", 0.0, 0.4),
            TranscriptWord::new("pin", 0.5, 0.9),
            TranscriptWord::new("is", 1.0, 1.4),
            TranscriptWord::new("4321", 2.1, 2.8),
        ]
    }

    fn clip() -> AudioClip {
        AudioClip::mono(100, vec![0.5; 400])
    }

    #[test]
    fn test_flagged_interval_silenced_before_release() {
        let cfg = config(2000, 1000, RedactionMode::Silence);
        let stream = ScriptedStream::new(words(), 0.5, 1, 100);
        let mut redactor = LiveRedactor::new(stream, vec!["4321".to_string()], &cfg, 1, 100);
        assert_eq!(redactor.delay_chunks(), 2);

        let mut out = Vec::new();
        for chunk in chunk_clip(&clip(), 1000) {
            out.extend(redactor.push(chunk).unwrap());
        }
        out.extend(redactor.finish().unwrap());

        let samples: Vec<f32> = out.into_iter().flat_map(|c| c.samples).collect();
        assert_eq!(samples.len(), 400);
        assert_eq!(samples[200], 0.5);
        assert!(samples[210..280].iter().all(|s| *s == 0.0));
        assert_eq!(samples[290], 0.5);
        assert_eq!(redactor.stats().failed_closed, 0);
    }

    #[test]
    fn test_lagging_transcript_fails_closed() {
        // Lag of 3s against a 1s delay: nothing is confirmed in time
        let cfg = config(1000, 1000, RedactionMode::Beep);
        let stream = ScriptedStream::new(words(), 3.0, 1, 100);
        let mut redactor = LiveRedactor::new(stream, vec!["4321".to_string()], &cfg, 1, 100);

        let mut released = Vec::new();
        for chunk in chunk_clip(&clip(), 1000) {
            released.extend(redactor.push(chunk).unwrap());
        }
        assert_eq!(released.len(), 3);
        assert!(released.iter().all(|c| c.samples.iter().all(|s| *s == 0.0)));
        assert_eq!(redactor.stats().failed_closed, 3);
    }

    /// Commits each chunk as heard, except the chunk starting at `fail_at`
    struct FlakyStream {
        fail_at: f64,
        fail_flush: bool,
        committed: f64,
    }

    impl FlakyStream {
        fn failing_at(fail_at: f64) -> Self {
            Self {
                fail_at,
                fail_flush: false,
                committed: 0.0,
            }
        }
    }

    impl StreamingTranscriber for FlakyStream {
        fn push(&mut self, chunk: &AudioChunk) -> Result<Vec<TranscriptWord>, AudioError> {
            if chunk.start == self.fail_at {
                return Err(AudioError::Transcriber("model crashed".to_string()));
            }
            self.committed = chunk.end(1, 100);
            Ok(Vec::new())
        }

        fn committed_until(&self) -> f64 {
            self.committed
        }

        fn flush(&mut self) -> Result<Vec<TranscriptWord>, AudioError> {
            if self.fail_flush {
                return Err(AudioError::Transcriber("flush crashed".to_string()));
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_transcriber_error_releases_chunk_as_silence() {
        let cfg = config(1000, 1000, RedactionMode::Silence);
        let mut redactor =
            LiveRedactor::new(FlakyStream::failing_at(1.0), vec!["pin".to_string()], &cfg, 1, 100);

        let mut out = Vec::new();
        for chunk in chunk_clip(&clip(), 1000) {
            out.extend(redactor.push(chunk).unwrap());
        }
        out.extend(redactor.finish().unwrap());

        assert_eq!(out.len(), 4);
        // Later chunks advance the commit point past the failed one; it stays silent
        assert!(out[0].samples.iter().all(|s| *s == 0.5));
        assert!(out[1].samples.iter().all(|s| *s == 0.0));
        assert!(out[2].samples.iter().all(|s| *s == 0.5));
        assert!(out[3].samples.iter().all(|s| *s == 0.5));
        let stats = redactor.stats();
        assert_eq!(stats.failed_closed, 1);
        assert_eq!(stats.transcriber_errors, 1);
        assert_eq!(stats.chunks, 4);
    }

    #[test]
    fn test_failed_flush_leaves_tail_unconfirmed() {
        let cfg = config(2000, 1000, RedactionMode::Silence);
        let stream = FlakyStream {
            fail_at: 3.0,
            fail_flush: true,
            committed: 0.0,
        };
        let mut redactor = LiveRedactor::new(stream, vec![], &cfg, 1, 100);

        for chunk in chunk_clip(&clip(), 1000) {
            redactor.push(chunk).unwrap();
        }
        let tail = redactor.finish().unwrap();

        // Chunk 2 was heard and committed; chunk 3 never was
        assert_eq!(tail.len(), 2);
        assert!(tail[0].samples.iter().all(|s| *s == 0.5));
        assert!(tail[1].samples.iter().all(|s| *s == 0.0));
        assert_eq!(redactor.stats().transcriber_errors, 2);
    }

    #[tokio::test]
    async fn test_run_live_survives_transcriber_error() {
        let cfg = config(1000, 1000, RedactionMode::Beep);
        let redactor =
            LiveRedactor::new(FlakyStream::failing_at(2.0), vec!["pin".to_string()], &cfg, 1, 100);

        let (out, stats) = run_live(clip(), redactor, 1000, 2, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.samples.len(), 400);
        assert_eq!(stats.failed_closed, 1);
        assert!(out.samples[200..300].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_chunk_clip_covers_all_samples() {
        let chunks = chunk_clip(&AudioClip::mono(100, vec![0.0; 250]), 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].start, 2.0);
        assert_eq!(chunks[2].samples.len(), 50);
    }

    #[tokio::test]
    async fn test_run_live_preserves_length_and_beeps() {
        let cfg = config(2000, 1000, RedactionMode::Beep);
        let stream = ScriptedStream::new(words(), 0.2, 1, 100);
        let redactor = LiveRedactor::new(stream, vec!["pin".to_string()], &cfg, 1, 100);

        let (out, stats) = run_live(clip(), redactor, 1000, 2, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.samples.len(), 400);
        assert_eq!(stats.chunks, 4);
        assert_eq!(stats.redacted_chunks, 1);
        assert!(out.samples[50..90].iter().all(|s| s.abs() <= 0.6 + 1e-6));
        assert_eq!(out.samples[0], 0.5);
    }
}
