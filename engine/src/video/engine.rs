//! Per-frame detect / track / predict cascade

use image::RgbImage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::detector::{filter_detections, FaceDetector};
use super::preprocess::{enhance_for_detection, luma};
use super::tracker::{CorrelationTracker, Track, TrackState};
use super::{FrameRecord, FrameSequence, TrackLog, TrackObservation, VideoError};
use crate::config::VideoConfig;

/// Minimum overlap for a detection to confirm an existing track
const MATCH_IOU: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub detect_every: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub max_predicted_frames: u32,
    pub low_contrast_stddev: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub tracker: CorrelationTracker,
}

impl From<&VideoConfig> for EngineParams {
    fn from(c: &VideoConfig) -> Self {
        Self {
            detect_every: c.detect_every.max(1),
            score_threshold: c.score_threshold,
            nms_threshold: c.nms_threshold,
            max_predicted_frames: c.max_predicted_frames,
            low_contrast_stddev: c.low_contrast_stddev,
            clahe_clip_limit: c.clahe_clip_limit,
            clahe_tiles: c.clahe_tiles,
            tracker: CorrelationTracker::new(c.tracker_search_radius, c.tracker_min_correlation),
        }
    }
}

/// Owns the track set of one job; never shared between jobs
pub struct TrackingEngine {
    params: EngineParams,
    detector: Arc<dyn FaceDetector>,
    tracks: Vec<Track>,
    next_id: u64,
    frame_index: usize,
}

impl TrackingEngine {
    pub fn new(params: EngineParams, detector: Arc<dyn FaceDetector>) -> Self {
        Self {
            params,
            detector,
            tracks: Vec::new(),
            next_id: 1,
            frame_index: 0,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Advance every track through one frame
    pub fn process_frame(&mut self, frame: &RgbImage) -> Result<FrameRecord, VideoError> {
        let index = self.frame_index;
        self.frame_index += 1;

        let enhanced = enhance_for_detection(
            frame,
            self.params.low_contrast_stddev,
            self.params.clahe_clip_limit,
            self.params.clahe_tiles,
        );
        let gray = luma(&enhanced);

        for track in &mut self.tracks {
            track.advance();
        }

        let existing = self.tracks.len();
        let mut confirmed = vec![false; existing];

        if index % self.params.detect_every as usize == 0 {
            let raw = self.detector.detect(index, &enhanced)?;
            let faces = filter_detections(
                raw,
                self.params.score_threshold,
                self.params.nms_threshold,
            );
            trace!(frame = index, faces = faces.len(), "Detector pass");

            // Greedy assignment by descending overlap
            let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
            for (ti, track) in self.tracks.iter().enumerate() {
                let predicted = track.bbox();
                for (di, face) in faces.iter().enumerate() {
                    let iou = predicted.iou(&face.bbox);
                    if iou >= MATCH_IOU {
                        pairs.push((ti, di, iou));
                    }
                }
            }
            pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

            let mut used = vec![false; faces.len()];
            for (ti, di, _) in pairs {
                if confirmed[ti] || used[di] {
                    continue;
                }
                confirmed[ti] = true;
                used[di] = true;
                self.tracks[ti].observe(faces[di].bbox, TrackState::Detected, &gray);
            }

            for (di, face) in faces.iter().enumerate() {
                if !used[di] {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!(track = id, frame = index, "New track");
                    self.tracks.push(Track::new(id, face.bbox, &gray));
                }
            }
        }

        for (ti, done) in confirmed.iter().enumerate() {
            if *done {
                continue;
            }
            let track = &mut self.tracks[ti];
            let hit = track
                .template()
                .and_then(|t| self.params.tracker.locate(&gray, t, &track.bbox()));
            match hit {
                Some((bbox, _score)) => track.observe(bbox, TrackState::Tracked, &gray),
                None => track.coast(),
            }
        }

        let limit = self.params.max_predicted_frames;
        self.tracks.retain(|t| {
            let keep = t.predicted_run <= limit;
            if !keep {
                debug!(track = t.id, frame = index, "Dropping track after prediction limit");
            }
            keep
        });

        Ok(FrameRecord {
            index,
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackObservation {
                    id: t.id,
                    bbox: t.bbox(),
                    state: t.state,
                })
                .collect(),
        })
    }

    /// Full offline pass over a clip
    pub fn run(
        &mut self,
        clip: &FrameSequence,
        cancel: &CancellationToken,
    ) -> Result<TrackLog, VideoError> {
        let (width, height) = clip.dimensions()?;
        let mut frames = Vec::with_capacity(clip.len());
        for i in 0..clip.len() {
            if cancel.is_cancelled() {
                return Err(VideoError::Cancelled);
            }
            let frame = clip.frame(i)?;
            frames.push(self.process_frame(&frame)?);
        }
        let log = TrackLog {
            fps: clip.fps,
            width,
            height,
            frames,
        };
        debug!(
            frames = log.frames.len(),
            tracks = log.track_count(),
            "Tracking pass complete"
        );
        Ok(log)
    }
}
