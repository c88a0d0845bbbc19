//! Region blurring and the sharpness measure used to verify it

use image::{GrayImage, RgbImage};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::preprocess::luma;
use super::{BBox, FrameSequence, FrameWriter, Region, TrackLog, VideoError};

/// Kernel sizes tried in order when a blur is judged too weak
pub const KERNEL_LADDER: [u32; 3] = [31, 51, 121];

#[derive(Debug, Clone, Copy)]
pub struct BlurParams {
    /// Box expansion about its center
    pub scale: f32,
    /// Odd kernel side
    pub kernel: u32,
}

impl BlurParams {
    pub fn new(scale: f32, kernel: u32) -> Self {
        Self { scale, kernel }
    }
}

/// Next kernel on the ladder above `current`, or `current` at the top
pub fn next_kernel(current: u32) -> u32 {
    KERNEL_LADDER
        .iter()
        .copied()
        .find(|k| *k > current)
        .unwrap_or(current)
}

/// Region a face box blurs once expanded and clamped to the frame
pub fn blur_region(bbox: &BBox, scale: f32, width: u32, height: u32) -> Option<Region> {
    bbox.scaled(scale).clamp_to(width, height)
}

/// Largest odd kernel not exceeding the region's shorter side
pub fn effective_kernel(kernel: u32, region: &Region) -> u32 {
    let side = region.w.min(region.h);
    let k = kernel.min(side);
    if k % 2 == 0 {
        k.saturating_sub(1)
    } else {
        k
    }
}

/// Normalized 1-D Gaussian weights for an odd kernel size
pub fn gaussian_weights(kernel: u32) -> Vec<f32> {
    let half = (kernel / 2) as i32;
    let sigma = 0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let denom = 2.0 * sigma * sigma;
    let mut weights: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= sum);
    weights
}

/// Separable Gaussian blur of one region, edges replicated inside the region
pub fn blur_in_place(frame: &mut RgbImage, region: Region, kernel: u32) {
    let k = effective_kernel(kernel, &region);
    if k < 3 {
        return;
    }
    let weights = gaussian_weights(k);
    let half = (k / 2) as i64;
    let (w, h) = (region.w as usize, region.h as usize);

    let mut buf = vec![[0f32; 3]; w * h];
    for y in 0..h {
        for x in 0..w {
            let p = frame.get_pixel(region.x + x as u32, region.y + y as u32).0;
            buf[y * w + x] = [p[0] as f32, p[1] as f32, p[2] as f32];
        }
    }

    let mut tmp = vec![[0f32; 3]; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0f32; 3];
            for (i, wt) in weights.iter().enumerate() {
                let sx = (x as i64 + i as i64 - half).clamp(0, w as i64 - 1) as usize;
                let s = buf[y * w + sx];
                for c in 0..3 {
                    acc[c] += wt * s[c];
                }
            }
            tmp[y * w + x] = acc;
        }
    }
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0f32; 3];
            for (i, wt) in weights.iter().enumerate() {
                let sy = (y as i64 + i as i64 - half).clamp(0, h as i64 - 1) as usize;
                let s = tmp[sy * w + x];
                for c in 0..3 {
                    acc[c] += wt * s[c];
                }
            }
            buf[y * w + x] = acc;
        }
    }

    for y in 0..h {
        for x in 0..w {
            let v = buf[y * w + x];
            frame.put_pixel(
                region.x + x as u32,
                region.y + y as u32,
                image::Rgb([
                    v[0].round().clamp(0.0, 255.0) as u8,
                    v[1].round().clamp(0.0, 255.0) as u8,
                    v[2].round().clamp(0.0, 255.0) as u8,
                ]),
            );
        }
    }
}

/// Variance of the 4-neighbour Laplacian over the region interior
///
/// `None` when the region has no interior pixels.
pub fn laplacian_variance(gray: &GrayImage, region: &Region) -> Option<f32> {
    if region.w < 3 || region.h < 3 {
        return None;
    }
    let at = |x: u32, y: u32| gray.get_pixel(x, y).0[0] as f64;
    let mut values = Vec::with_capacity(((region.w - 2) * (region.h - 2)) as usize);
    for y in region.y + 1..region.y + region.h - 1 {
        for x in region.x + 1..region.x + region.w - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            values.push(lap);
        }
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Some(var as f32)
}

/// Blur every tracked face of one frame, returning the regions touched
pub fn blur_frame<'a>(
    frame: &mut RgbImage,
    boxes: impl IntoIterator<Item = &'a BBox>,
    params: BlurParams,
) -> Vec<Region> {
    let (width, height) = frame.dimensions();
    let mut regions = Vec::new();
    for bbox in boxes {
        if let Some(region) = blur_region(bbox, params.scale, width, height) {
            blur_in_place(frame, region, params.kernel);
            regions.push(region);
        }
    }
    regions
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurReport {
    pub frames: usize,
    pub regions: usize,
}

/// Second offline pass: blur every frame of `clip` at the logged positions
pub fn blur_clip(
    clip: &FrameSequence,
    log: &TrackLog,
    out_dir: &Path,
    params: BlurParams,
    cancel: &CancellationToken,
) -> Result<BlurReport, VideoError> {
    if log.frames.len() != clip.len() {
        return Err(VideoError::InvalidClip(format!(
            "track log covers {} frames, clip has {}",
            log.frames.len(),
            clip.len()
        )));
    }
    let mut writer = FrameWriter::create(out_dir, clip.fps)?;
    let mut regions = 0;
    for (i, record) in log.frames.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(VideoError::Cancelled);
        }
        let mut frame = clip.frame(i)?;
        let touched = blur_frame(&mut frame, record.tracks.iter().map(|t| &t.bbox), params);
        trace!(frame = i, regions = touched.len(), "Blurred frame");
        regions += touched.len();
        writer.write(&frame)?;
    }
    debug!(frames = writer.written(), regions, kernel = params.kernel, "Blur pass complete");
    Ok(BlurReport {
        frames: writer.written(),
        regions,
    })
}

/// Mean Laplacian variance over every blurred region of an output clip
///
/// `None` when the log has no measurable regions.
pub fn mean_region_sharpness(
    output: &FrameSequence,
    log: &TrackLog,
    scale: f32,
) -> Result<Option<f32>, VideoError> {
    let mut total = 0.0f64;
    let mut count = 0usize;
    for (i, record) in log.frames.iter().enumerate() {
        if record.tracks.is_empty() || i >= output.len() {
            continue;
        }
        let gray = luma(&output.frame(i)?);
        let (w, h) = gray.dimensions();
        for obs in &record.tracks {
            let Some(region) = blur_region(&obs.bbox, scale, w, h) else {
                continue;
            };
            if let Some(v) = laplacian_variance(&gray, &region) {
                total += v as f64;
                count += 1;
            }
        }
    }
    Ok((count > 0).then(|| (total / count as f64) as f32))
}
