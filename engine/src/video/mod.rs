//! Face Detection–Tracking–Prediction Engine
//!
//! A video clip is a frame sequence: a directory of numbered images plus a
//! `clip.json` carrying the frame rate. Per frame, the primary detector runs on
//! a fixed cadence, an appearance tracker follows existing tracks on the frames
//! between, and a constant-velocity Kalman filter carries a track through
//! frames where both miss, up to a bounded number of frames.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use shield_sdk::errors::ShieldError;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod blur;
pub mod detector;
pub mod engine;
pub mod kalman;
pub mod live;
pub mod preprocess;
pub mod tracker;

pub use detector::{FaceDetector, NoDetector, ProcessDetector, ScriptedDetector};
pub use engine::TrackingEngine;
pub use tracker::{Track, TrackState};

const CLIP_META: &str = "clip.json";

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid clip: {0}")]
    InvalidClip(String),

    #[error("Detector failed: {0}")]
    Detector(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<VideoError> for ShieldError {
    fn from(e: VideoError) -> Self {
        match e {
            VideoError::Io(io) => ShieldError::Io(io),
            VideoError::Cancelled => ShieldError::Cancelled,
            other => ShieldError::ToolExecution(other.to_string()),
        }
    }
}

/// Axis-aligned box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Intersection over union
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Scale about the center
    pub fn scaled(&self, factor: f32) -> BBox {
        let (cx, cy) = self.center();
        let w = self.w * factor;
        let h = self.h * factor;
        BBox::new(cx - w / 2.0, cy - h / 2.0, w, h)
    }

    /// Integer region clamped to a `width` x `height` image
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        let x0 = self.x.floor().max(0.0) as i64;
        let y0 = self.y.floor().max(0.0) as i64;
        let x1 = ((self.x + self.w).ceil() as i64).min(width as i64);
        let y1 = ((self.y + self.h).ceil() as i64).min(height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Region {
            x: x0 as u32,
            y: y0 as u32,
            w: (x1 - x0) as u32,
            h: (y1 - y0) as u32,
        })
    }
}

/// Pixel region inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Detector output before tracking
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub bbox: BBox,
    pub score: f32,
}

/// One track's position in one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackObservation {
    pub id: u64,
    pub bbox: BBox,
    pub state: TrackState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: usize,
    pub tracks: Vec<TrackObservation>,
}

/// Per-frame track positions for a whole clip
///
/// Serialized as the mask stream that `blur` consumes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackLog {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<FrameRecord>,
}

impl TrackLog {
    pub fn load(path: &Path) -> Result<Self, VideoError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| VideoError::InvalidClip(format!("track log {:?}: {}", path, e)))
    }

    pub fn save(&self, path: &Path) -> Result<(), VideoError> {
        let text = serde_json::to_string(self)
            .map_err(|e| VideoError::InvalidClip(format!("track log: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Total number of (track, frame) observations
    pub fn track_frames(&self) -> usize {
        self.frames.iter().map(|f| f.tracks.len()).sum()
    }

    /// Distinct track ids
    pub fn track_count(&self) -> usize {
        let mut ids: Vec<u64> = self
            .frames
            .iter()
            .flat_map(|f| f.tracks.iter().map(|t| t.id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ClipMeta {
    fps: f64,
}

/// Frame-sequence clip on disk
#[derive(Debug, Clone)]
pub struct FrameSequence {
    pub dir: PathBuf,
    pub fps: f64,
    pub frames: Vec<PathBuf>,
}

impl FrameSequence {
    /// Open a frame directory; frames are taken in file-name order
    pub fn open(dir: &Path) -> Result<Self, VideoError> {
        let meta_path = dir.join(CLIP_META);
        let meta: ClipMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)
            .map_err(|e| VideoError::InvalidClip(format!("{:?}: {}", meta_path, e)))?;
        if !(meta.fps > 0.0) {
            return Err(VideoError::InvalidClip(format!("fps must be positive, got {}", meta.fps)));
        }

        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("png") | Some("jpg") | Some("jpeg")
                )
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(VideoError::InvalidClip(format!("no frames in {:?}", dir)));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            fps: meta.fps,
            frames,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Result<RgbImage, VideoError> {
        let path = self
            .frames
            .get(index)
            .ok_or_else(|| VideoError::InvalidClip(format!("frame {} out of range", index)))?;
        Ok(image::open(path)?.to_rgb8())
    }

    /// Dimensions of the first frame
    pub fn dimensions(&self) -> Result<(u32, u32), VideoError> {
        Ok(self.frame(0)?.dimensions())
    }
}

/// Writes frames into a new frame-sequence directory
pub struct FrameWriter {
    dir: PathBuf,
    written: usize,
}

impl FrameWriter {
    pub fn create(dir: &Path, fps: f64) -> Result<Self, VideoError> {
        std::fs::create_dir_all(dir)?;
        let meta = serde_json::to_string(&ClipMeta { fps })
            .map_err(|e| VideoError::InvalidClip(e.to_string()))?;
        std::fs::write(dir.join(CLIP_META), meta)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }

    pub fn write(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        self.written += 1;
        frame.save(self.dir.join(frame_name(self.written)))?;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

/// File name of the 1-based `n`th frame
pub fn frame_name(n: usize) -> String {
    format!("frame_{:06}.png", n)
}
