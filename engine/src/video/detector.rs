//! Primary face detectors
//!
//! Detectors are synchronous: they run on the blocking pool alongside the rest
//! of the per-frame work. Raw detector output goes through score filtering
//! and non-maximum suppression before the tracker sees it.

use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, trace};

use crate::external::{remove_scratch, run_model_command};

use super::{BBox, FaceBox, VideoError};

pub trait FaceDetector: Send + Sync {
    /// Raw face boxes for one frame
    fn detect(&self, frame_index: usize, frame: &RgbImage) -> Result<Vec<FaceBox>, VideoError>;
}

/// Drop boxes below `score_threshold`, then greedy NMS at `nms_threshold`
pub fn filter_detections(
    mut boxes: Vec<FaceBox>,
    score_threshold: f32,
    nms_threshold: f32,
) -> Vec<FaceBox> {
    boxes.retain(|b| b.score >= score_threshold && b.bbox.w > 0.0 && b.bbox.h > 0.0);
    boxes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<FaceBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= nms_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Runs an external model command per frame
///
/// The command receives the path of a PNG frame as its last argument and
/// prints a JSON array of `{"x", "y", "w", "h", "score"}` objects, or an object
/// with such an array under `"faces"`. A command still running after
/// `timeout` is killed and the frame fails.
pub struct ProcessDetector {
    command: Vec<String>,
    scratch: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DetectorOutput {
    List(Vec<RawFace>),
    Wrapped { faces: Vec<RawFace> },
}

#[derive(Deserialize)]
struct RawFace {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    #[serde(default = "default_score")]
    score: f32,
}

fn default_score() -> f32 {
    1.0
}

impl ProcessDetector {
    pub fn new(
        command: Vec<String>,
        scratch: PathBuf,
        timeout: Duration,
    ) -> Result<Self, VideoError> {
        if command.is_empty() {
            return Err(VideoError::Detector("empty detector command".to_string()));
        }
        std::fs::create_dir_all(&scratch)?;
        Ok(Self {
            command,
            scratch,
            timeout,
        })
    }
}

impl FaceDetector for ProcessDetector {
    fn detect(&self, frame_index: usize, frame: &RgbImage) -> Result<Vec<FaceBox>, VideoError> {
        let frame_path = self
            .scratch
            .join(format!("detect_{}_{}.png", uuid::Uuid::new_v4(), frame_index));
        frame.save(&frame_path)?;

        let stdout = run_model_command(&self.command, &frame_path, self.timeout);
        remove_scratch(&frame_path);
        let stdout = stdout.map_err(|e| VideoError::Detector(e.to_string()))?;

        let parsed: DetectorOutput = serde_json::from_slice(&stdout)
            .map_err(|e| VideoError::Detector(format!("unparseable detector output: {}", e)))?;
        let faces = match parsed {
            DetectorOutput::List(faces) | DetectorOutput::Wrapped { faces } => faces,
        };
        trace!(frame = frame_index, faces = faces.len(), "Detector output");

        Ok(faces
            .into_iter()
            .map(|f| FaceBox {
                bbox: BBox::new(f.x, f.y, f.w, f.h),
                score: f.score,
            })
            .collect())
    }
}

/// Fixed per-frame detections, for tests and replays
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetector {
    frames: HashMap<usize, Vec<FaceBox>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `boxes` when asked about `frame_index`
    pub fn with_frame(mut self, frame_index: usize, boxes: Vec<FaceBox>) -> Self {
        self.frames.insert(frame_index, boxes);
        self
    }

    /// Report the same box on every frame in `range`
    pub fn with_span(mut self, range: std::ops::Range<usize>, bbox: BBox) -> Self {
        for i in range {
            self.frames
                .entry(i)
                .or_default()
                .push(FaceBox { bbox, score: 0.9 });
        }
        self
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, frame_index: usize, _frame: &RgbImage) -> Result<Vec<FaceBox>, VideoError> {
        Ok(self.frames.get(&frame_index).cloned().unwrap_or_default())
    }
}

/// Placeholder when no detector command is configured
pub struct NoDetector;

impl FaceDetector for NoDetector {
    fn detect(&self, _frame_index: usize, _frame: &RgbImage) -> Result<Vec<FaceBox>, VideoError> {
        debug!("Face detection requested without a configured detector");
        Err(VideoError::Detector(
            "no face detector configured; set video.detector_command".to_string(),
        ))
    }
}
