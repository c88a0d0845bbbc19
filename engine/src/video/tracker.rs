//! Per-face tracks and the appearance tracker
//!
//! A track is a tagged state machine: `Detected` when the primary detector
//! confirmed it this frame, `Tracked` when the correlation tracker found it,
//! `Predicted` when only the motion model places it.

use image::{imageops, GrayImage};
use serde::{Deserialize, Serialize};

use super::kalman::{self, KalmanState};
use super::{BBox, Region};

/// Longest template side sampled when correlating
const MAX_TEMPLATE_SAMPLES: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Detected,
    Tracked,
    Predicted,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub state: TrackState,
    pub kalman: KalmanState,
    /// Consecutive frames carried by prediction alone
    pub predicted_run: u32,
    template: Option<GrayImage>,
}

impl Track {
    pub fn new(id: u64, bbox: BBox, gray: &GrayImage) -> Self {
        Self {
            id,
            state: TrackState::Detected,
            kalman: KalmanState::from_measurement(to_measurement(&bbox)),
            predicted_run: 0,
            template: crop_template(gray, &bbox),
        }
    }

    pub fn bbox(&self) -> BBox {
        let [x, y, w, h] = self.kalman.position();
        BBox::new(x as f32, y as f32, w.max(1.0) as f32, h.max(1.0) as f32)
    }

    /// Velocity of the box origin in pixels per frame
    pub fn velocity(&self) -> (f32, f32) {
        let v = self.kalman.velocity();
        (v[0] as f32, v[1] as f32)
    }

    /// Advance the motion model by one frame
    pub fn advance(&mut self) {
        self.kalman = kalman::predict(&self.kalman, 1.0);
    }

    /// Fold in direct evidence from the detector or tracker
    pub fn observe(&mut self, bbox: BBox, state: TrackState, gray: &GrayImage) {
        self.kalman = kalman::update(&self.kalman, to_measurement(&bbox));
        self.state = state;
        self.predicted_run = 0;
        if state == TrackState::Detected {
            if let Some(t) = crop_template(gray, &bbox) {
                self.template = Some(t);
            }
        }
    }

    /// No evidence this frame
    pub fn coast(&mut self) {
        self.state = TrackState::Predicted;
        self.predicted_run += 1;
    }

    pub fn template(&self) -> Option<&GrayImage> {
        self.template.as_ref()
    }
}

fn to_measurement(b: &BBox) -> [f64; 4] {
    [b.x as f64, b.y as f64, b.w as f64, b.h as f64]
}

fn crop_template(gray: &GrayImage, bbox: &BBox) -> Option<GrayImage> {
    let Region { x, y, w, h } = bbox.clamp_to(gray.width(), gray.height())?;
    if w < 2 || h < 2 {
        return None;
    }
    Some(imageops::crop_imm(gray, x, y, w, h).to_image())
}

/// Normalized cross-correlation search around a predicted box
#[derive(Debug, Clone, Copy)]
pub struct CorrelationTracker {
    pub search_radius: u32,
    pub min_correlation: f32,
}

impl CorrelationTracker {
    pub fn new(search_radius: u32, min_correlation: f32) -> Self {
        Self {
            search_radius,
            min_correlation,
        }
    }

    /// Best match of `template` near `around`, if it clears the threshold
    pub fn locate(&self, gray: &GrayImage, template: &GrayImage, around: &BBox) -> Option<(BBox, f32)> {
        let (tw, th) = template.dimensions();
        let (iw, ih) = gray.dimensions();
        if tw > iw || th > ih {
            return None;
        }
        let stride = (tw.max(th) / MAX_TEMPLATE_SAMPLES).max(1);
        let prepared = PreparedTemplate::new(template, stride)?;

        let r = self.search_radius as i64;
        let cx = around.x.round() as i64;
        let cy = around.y.round() as i64;
        let max_x = (iw - tw) as i64;
        let max_y = (ih - th) as i64;
        let clamp = |v: i64, hi: i64| v.clamp(0, hi);

        let coarse = (self.search_radius / 6).max(1) as i64;
        let mut best: Option<(i64, i64, f32)> = None;
        let consider = |x: i64, y: i64, best: &mut Option<(i64, i64, f32)>| {
            let score = prepared.ncc(gray, x as u32, y as u32);
            if best.map_or(true, |(_, _, s)| score > s) {
                *best = Some((x, y, score));
            }
        };

        let mut y = clamp(cy - r, max_y);
        while y <= clamp(cy + r, max_y) {
            let mut x = clamp(cx - r, max_x);
            while x <= clamp(cx + r, max_x) {
                consider(x, y, &mut best);
                x += coarse;
            }
            y += coarse;
        }

        let (bx, by, _) = best?;
        if coarse > 1 {
            for y in clamp(by - coarse, max_y)..=clamp(by + coarse, max_y) {
                for x in clamp(bx - coarse, max_x)..=clamp(bx + coarse, max_x) {
                    consider(x, y, &mut best);
                }
            }
        }

        let (bx, by, score) = best?;
        if score < self.min_correlation {
            return None;
        }
        Some((BBox::new(bx as f32, by as f32, tw as f32, th as f32), score))
    }
}

struct PreparedTemplate {
    stride: u32,
    width: u32,
    height: u32,
    /// Zero-mean samples
    values: Vec<f32>,
    norm: f32,
}

impl PreparedTemplate {
    fn new(template: &GrayImage, stride: u32) -> Option<Self> {
        let (width, height) = template.dimensions();
        let mut values = Vec::new();
        for y in (0..height).step_by(stride as usize) {
            for x in (0..width).step_by(stride as usize) {
                values.push(template.get_pixel(x, y).0[0] as f32);
            }
        }
        let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
        values.iter_mut().for_each(|v| *v -= mean);
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        // A flat template matches anything equally
        if norm < 1e-3 {
            return None;
        }
        Some(Self {
            stride,
            width,
            height,
            values,
            norm,
        })
    }

    fn ncc(&self, gray: &GrayImage, ox: u32, oy: u32) -> f32 {
        let mut patch = Vec::with_capacity(self.values.len());
        for y in (0..self.height).step_by(self.stride as usize) {
            for x in (0..self.width).step_by(self.stride as usize) {
                patch.push(gray.get_pixel(ox + x, oy + y).0[0] as f32);
            }
        }
        let mean = patch.iter().sum::<f32>() / patch.len().max(1) as f32;
        let mut dot = 0.0;
        let mut energy = 0.0;
        for (p, t) in patch.iter().zip(&self.values) {
            let d = p - mean;
            dot += d * t;
            energy += d * d;
        }
        let denom = energy.sqrt() * self.norm;
        if denom < 1e-6 {
            0.0
        } else {
            dot / denom
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured(w: u32, h: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let v = (x.wrapping_mul(73) ^ y.wrapping_mul(151) ^ seed.wrapping_mul(0x9E37_79B9))
                .wrapping_mul(2_654_435_761)
                >> 24;
            Luma([v as u8])
        })
    }

    #[test]
    fn test_locate_finds_shifted_patch() {
        let frame = textured(80, 80, 7);
        let template = imageops::crop_imm(&frame, 30, 20, 16, 16).to_image();
        let tracker = CorrelationTracker::new(12, 0.6);

        let (found, score) = tracker
            .locate(&frame, &template, &BBox::new(24.0, 26.0, 16.0, 16.0))
            .unwrap();
        assert_eq!((found.x, found.y), (30.0, 20.0));
        assert!(score > 0.99);
    }

    #[test]
    fn test_locate_rejects_unrelated_content() {
        let frame = textured(80, 80, 7);
        let other = textured(80, 80, 99);
        let template = imageops::crop_imm(&frame, 30, 20, 16, 16).to_image();
        let tracker = CorrelationTracker::new(8, 0.6);
        assert!(tracker
            .locate(&other, &template, &BBox::new(30.0, 20.0, 16.0, 16.0))
            .is_none());
    }

    #[test]
    fn test_flat_template_never_matches() {
        let frame = GrayImage::from_pixel(40, 40, Luma([128]));
        let template = GrayImage::from_pixel(8, 8, Luma([128]));
        let tracker = CorrelationTracker::new(4, 0.1);
        assert!(tracker
            .locate(&frame, &template, &BBox::new(10.0, 10.0, 8.0, 8.0))
            .is_none());
    }

    #[test]
    fn test_track_lifecycle() {
        let gray = textured(64, 64, 3);
        let mut track = Track::new(1, BBox::new(10.0, 10.0, 12.0, 12.0), &gray);
        assert_eq!(track.state, TrackState::Detected);
        assert!(track.template().is_some());

        track.advance();
        track.coast();
        track.advance();
        track.coast();
        assert_eq!(track.state, TrackState::Predicted);
        assert_eq!(track.predicted_run, 2);

        track.advance();
        track.observe(BBox::new(12.0, 10.0, 12.0, 12.0), TrackState::Tracked, &gray);
        assert_eq!(track.predicted_run, 0);
        assert_eq!(track.state, TrackState::Tracked);
    }
}
