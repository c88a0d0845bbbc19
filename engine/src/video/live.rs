//! Live detect-then-blur pipeline
//!
//! The producer runs detection and blurring per frame on the blocking pool and
//! pushes finished frames into a bounded channel; the consumer renders them in
//! order. The channel depth is the playback delay. No verification happens
//! before release.

use image::RgbImage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::blur::{blur_frame, BlurParams};
use super::engine::TrackingEngine;
use super::{FrameSequence, FrameWriter, VideoError};

/// Receives released frames in order
pub trait FrameSink: Send {
    fn render(&mut self, frame: &RgbImage) -> Result<(), VideoError>;
}

impl FrameSink for FrameWriter {
    fn render(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        self.write(frame)
    }
}

/// Collects frames in memory
#[derive(Default)]
pub struct MemorySink {
    pub frames: Vec<RgbImage>,
}

impl FrameSink for MemorySink {
    fn render(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveStats {
    pub frames: usize,
    pub regions: usize,
}

struct Rendered {
    frame: RgbImage,
    regions: usize,
}

pub async fn run_live<S: FrameSink>(
    clip: FrameSequence,
    mut engine: TrackingEngine,
    params: BlurParams,
    depth: usize,
    sink: &mut S,
    cancel: CancellationToken,
) -> Result<LiveStats, VideoError> {
    let (tx, mut rx) = mpsc::channel::<Rendered>(depth.max(1));
    let producer_cancel = cancel.clone();

    let producer = tokio::task::spawn_blocking(move || -> Result<(), VideoError> {
        for i in 0..clip.len() {
            if producer_cancel.is_cancelled() {
                return Err(VideoError::Cancelled);
            }
            let mut frame = clip.frame(i)?;
            let record = engine.process_frame(&frame)?;
            let regions = blur_frame(&mut frame, record.tracks.iter().map(|t| &t.bbox), params);
            if tx
                .blocking_send(Rendered {
                    frame,
                    regions: regions.len(),
                })
                .is_err()
            {
                debug!(frame = i, "Consumer gone, stopping producer");
                break;
            }
        }
        Ok(())
    });

    let mut stats = LiveStats::default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                rx.close();
                break;
            }
            next = rx.recv() => {
                let Some(rendered) = next else { break };
                sink.render(&rendered.frame)?;
                stats.frames += 1;
                stats.regions += rendered.regions;
            }
        }
    }

    producer
        .await
        .map_err(|e| VideoError::Detector(format!("live producer panicked: {}", e)))??;
    if cancel.is_cancelled() {
        return Err(VideoError::Cancelled);
    }
    info!(frames = stats.frames, regions = stats.regions, "Live video pass complete");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConfig;
    use crate::video::engine::EngineParams;
    use crate::video::{BBox, ScriptedDetector};
    use std::sync::Arc;

    fn clip(dir: &std::path::Path, n: usize) -> FrameSequence {
        let mut writer = FrameWriter::create(dir, 25.0).unwrap();
        for i in 0..n {
            let frame = RgbImage::from_fn(48, 48, |x, y| {
                let v = if (x + y + i as u32) % 2 == 0 { 10 } else { 240 };
                image::Rgb([v, v, v])
            });
            writer.write(&frame).unwrap();
        }
        FrameSequence::open(dir).unwrap()
    }

    #[tokio::test]
    async fn test_live_releases_every_frame_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let clip = clip(dir.path(), 6);
        let detector = ScriptedDetector::new().with_span(0..6, BBox::new(16.0, 16.0, 12.0, 12.0));
        let engine = TrackingEngine::new(
            EngineParams::from(&VideoConfig::default()),
            Arc::new(detector),
        );
        let mut sink = MemorySink::default();

        let stats = run_live(
            clip,
            engine,
            BlurParams::new(2.0, 31),
            2,
            &mut sink,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.frames, 6);
        assert!(stats.regions >= 6);
        assert_eq!(sink.frames.len(), 6);
        // Center blurred towards grey, corner untouched
        let center = sink.frames[0].get_pixel(22, 22).0[0];
        assert!(center > 60 && center < 190, "center = {center}");
        assert!(matches!(sink.frames[0].get_pixel(0, 0).0[0], 10 | 240));
    }

    #[tokio::test]
    async fn test_live_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let clip = clip(dir.path(), 4);
        let engine = TrackingEngine::new(
            EngineParams::from(&VideoConfig::default()),
            Arc::new(ScriptedDetector::new()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = MemorySink::default();
        let result = run_live(clip, engine, BlurParams::new(2.0, 31), 2, &mut sink, cancel).await;
        assert!(matches!(result, Err(VideoError::Cancelled)));
    }
}
