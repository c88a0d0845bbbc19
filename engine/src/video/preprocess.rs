//! Low-contrast frame enhancement ahead of detection
//!
//! Contrast-limited adaptive histogram equalization on luma, then a 3x3
//! sharpening pass. Only frames whose luma spread is below the configured
//! threshold are enhanced; the enhanced frame is fed to the detector and
//! tracker, never written to the output.

use image::{imageops, GrayImage, Luma, RgbImage};
use std::borrow::Cow;

const SHARPEN: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];

pub fn luma(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// Standard deviation of pixel intensities
pub fn contrast_stddev(gray: &GrayImage) -> f32 {
    let n = (gray.width() * gray.height()) as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = gray.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
    let var = gray
        .pixels()
        .map(|p| {
            let d = p.0[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt() as f32
}

/// Enhance `frame` when its contrast is below `min_stddev`
pub fn enhance_for_detection<'a>(
    frame: &'a RgbImage,
    min_stddev: f32,
    clip_limit: f32,
    tiles: u32,
) -> Cow<'a, RgbImage> {
    let gray = luma(frame);
    if contrast_stddev(&gray) >= min_stddev {
        return Cow::Borrowed(frame);
    }
    let equalized = clahe(&gray, clip_limit, tiles);
    let rgb = RgbImage::from_fn(equalized.width(), equalized.height(), |x, y| {
        let v = equalized.get_pixel(x, y).0[0];
        image::Rgb([v, v, v])
    });
    Cow::Owned(sharpen(&rgb))
}

pub fn sharpen(frame: &RgbImage) -> RgbImage {
    imageops::filter3x3(frame, &SHARPEN)
}

/// Contrast-limited adaptive histogram equalization
///
/// The image is split into a `tiles` x `tiles` grid. Each tile's histogram is
/// clipped at `clip_limit` times the uniform bin height, the excess spread
/// evenly over all bins, and the resulting CDF used as the tile's mapping.
/// Pixels are mapped by bilinear interpolation between the four nearest tile
/// centers.
pub fn clahe(gray: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }
    let tiles_x = tiles.clamp(1, width);
    let tiles_y = tiles.clamp(1, height);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            if x0 >= x1 || y0 >= y1 {
                // Grid overhang on tiny images: identity mapping
                let lut = &mut luts[(ty * tiles_x + tx) as usize];
                for (i, v) in lut.iter_mut().enumerate() {
                    *v = i as u8;
                }
                continue;
            }
            luts[(ty * tiles_x + tx) as usize] = tile_lut(gray, x0, y0, x1, y1, clip_limit);
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let v = gray.get_pixel(x, y).0[0] as usize;

        // Position relative to tile centers
        let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let tx0 = gx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
        let ty0 = gy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let fx = (gx - tx0 as f32).clamp(0.0, 1.0);
        let fy = (gy - ty0 as f32).clamp(0.0, 1.0);

        let at = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;
        let top = at(tx0, ty0) * (1.0 - fx) + at(tx1, ty0) * fx;
        let bottom = at(tx0, ty1) * (1.0 - fx) + at(tx1, ty1) * fx;
        let mapped = top * (1.0 - fy) + bottom * fy;
        Luma([mapped.round().clamp(0.0, 255.0) as u8])
    })
}

fn tile_lut(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y).0[0] as usize] += 1;
        }
    }
    let total = (x1 - x0) * (y1 - y0);

    let limit = ((clip_limit * total as f32) / 256.0).max(1.0) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    let scale = 255.0 / total as f32;
    for (i, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
