//! Pixel differ
//!
//! A pixelmatch-style comparison: colours are compared in YIQ space after
//! blending any translucency against white, anti-aliasing edges are detected
//! and excluded from the count, and a diff raster is painted showing
//! differing pixels over a faded copy of the reference.

use crate::codec::RasterImage;
use crate::{Error, Result};

/// Largest possible YIQ delta between two colours.
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Default per-pixel tolerance on the normalized 0..=1 scale.
pub const DEFAULT_TOLERANCE: f64 = 0.1;

/// Options controlling matching and how the diff raster is painted
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOptions {
    /// Matching threshold in [0, 1]; smaller is stricter
    pub tolerance: f64,
    /// Count anti-aliased pixels as differences
    pub include_aa: bool,
    /// Opacity of the reference image drawn under matching pixels
    pub alpha: f64,
    /// Colour for anti-aliased pixels
    pub aa_color: [u8; 3],
    /// Colour for differing pixels
    pub diff_color: [u8; 3],
    /// Colour for differing pixels where the test pixel is darker
    pub diff_color_alt: Option<[u8; 3]>,
    /// Leave matching pixels transparent instead of drawing the faded reference
    pub diff_mask: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            include_aa: false,
            alpha: 0.1,
            aa_color: [255, 255, 0],
            diff_color: [255, 0, 0],
            diff_color_alt: None,
            diff_mask: false,
        }
    }
}

/// Output of a comparison
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    pub diff_image: RasterImage,
    pub diff_pixel_count: u64,
}

impl DiffOutcome {
    /// Percentage of pixels that differ, in [0, 100].
    pub fn percentage(&self) -> f64 {
        diff_percentage(
            self.diff_pixel_count,
            self.diff_image.width(),
            self.diff_image.height(),
        )
    }
}

/// Compare two equally sized rasters with default painting options.
pub fn diff(reference: &RasterImage, test: &RasterImage, tolerance: f64) -> Result<DiffOutcome> {
    let options = DiffOptions {
        tolerance,
        ..Default::default()
    };
    diff_with_options(reference, test, &options)
}

/// Compare two equally sized rasters.
///
/// Fails with [`Error::DimensionMismatch`] when the sizes differ; callers
/// wanting to compare differently sized captures must reconcile them first.
pub fn diff_with_options(
    reference: &RasterImage,
    test: &RasterImage,
    options: &DiffOptions,
) -> Result<DiffOutcome> {
    if reference.dimensions() != test.dimensions() {
        return Err(Error::DimensionMismatch {
            reference_width: reference.width(),
            reference_height: reference.height(),
            test_width: test.width(),
            test_height: test.height(),
        });
    }
    if !(0.0..=1.0).contains(&options.tolerance) {
        return Err(Error::InvalidTolerance(options.tolerance));
    }

    let (width, height) = reference.dimensions();
    let img1 = reference.pixels();
    let img2 = test.pixels();
    let mut output = vec![0u8; img1.len()];

    if img1 == img2 {
        if !options.diff_mask {
            for pos in (0..img1.len()).step_by(4) {
                draw_gray_pixel(img1, pos, options.alpha, &mut output);
            }
        }
        return Ok(DiffOutcome {
            diff_image: RasterImage::new(width, height, output)?,
            diff_pixel_count: 0,
        });
    }

    let max_delta = MAX_YIQ_DELTA * options.tolerance * options.tolerance;
    let mut count = 0u64;

    for y in 0..height {
        for x in 0..width {
            let pos = (y as usize * width as usize + x as usize) * 4;
            let delta = color_delta(img1, img2, pos, pos, false);

            if delta.abs() > max_delta {
                let is_aa = !options.include_aa
                    && (antialiased(img1, x, y, width, height, img2)
                        || antialiased(img2, x, y, width, height, img1));
                if is_aa {
                    if !options.diff_mask {
                        draw_pixel(&mut output, pos, options.aa_color);
                    }
                } else {
                    let color = match options.diff_color_alt {
                        Some(alt) if delta < 0.0 => alt,
                        _ => options.diff_color,
                    };
                    draw_pixel(&mut output, pos, color);
                    count += 1;
                }
            } else if !options.diff_mask {
                draw_gray_pixel(img1, pos, options.alpha, &mut output);
            }
        }
    }

    Ok(DiffOutcome {
        diff_image: RasterImage::new(width, height, output)?,
        diff_pixel_count: count,
    })
}

/// `count / (width * height) * 100`, clamped to [0, 100].
pub fn diff_percentage(count: u64, width: u32, height: u32) -> f64 {
    let total = width as u64 * height as u64;
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Two-decimal rendering of a percentage.
///
/// Only an exact zero prints as `"0.00"`: a non-zero share too small to show
/// is rounded up to `"0.01"`, and anything short of 100 never prints as
/// `"100.00"`.
pub fn format_percentage(percentage: f64) -> String {
    if percentage <= 0.0 {
        return "0.00".to_string();
    }
    if percentage >= 100.0 {
        return "100.00".to_string();
    }
    let clamped = percentage.clamp(0.01, 99.99);
    format!("{:.2}", clamped)
}

fn blend(c: f64, a: f64) -> f64 {
    255.0 + (c - 255.0) * a
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94
}

fn blended_rgb(img: &[u8], k: usize) -> (f64, f64, f64) {
    let (r, g, b, a) = (
        img[k] as f64,
        img[k + 1] as f64,
        img[k + 2] as f64,
        img[k + 3] as f64,
    );
    if a < 255.0 {
        let a = a / 255.0;
        (blend(r, a), blend(g, a), blend(b, a))
    } else {
        (r, g, b)
    }
}

/// Squared YIQ distance between pixel `k` of `img1` and pixel `m` of `img2`,
/// negative when the first pixel is lighter. With `y_only` the signed luma
/// difference is returned instead.
fn color_delta(img1: &[u8], img2: &[u8], k: usize, m: usize, y_only: bool) -> f64 {
    if img1[k..k + 4] == img2[m..m + 4] {
        return 0.0;
    }

    let (r1, g1, b1) = blended_rgb(img1, k);
    let (r2, g2, b2) = blended_rgb(img2, m);

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;

    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

fn neighborhood(x: u32, y: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    (
        x.saturating_sub(1),
        y.saturating_sub(1),
        (x + 1).min(width - 1),
        (y + 1).min(height - 1),
    )
}

/// Whether pixel `(x1, y1)` of `img` looks like an anti-aliasing edge that
/// `other` renders slightly differently.
fn antialiased(img: &[u8], x1: u32, y1: u32, width: u32, height: u32, other: &[u8]) -> bool {
    let (x0, y0, x2, y2) = neighborhood(x1, y1, width, height);
    let pos = (y1 as usize * width as usize + x1 as usize) * 4;
    let mut zeroes = if x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2 { 1 } else { 0 };
    let mut min = 0.0f64;
    let mut max = 0.0f64;
    let mut min_at = (0, 0);
    let mut max_at = (0, 0);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let delta = color_delta(img, img, pos, (y as usize * width as usize + x as usize) * 4, true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (x, y);
            } else if delta > max {
                max = delta;
                max_at = (x, y);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_at.0, min_at.1, width, height)
        && has_many_siblings(other, min_at.0, min_at.1, width, height))
        || (has_many_siblings(img, max_at.0, max_at.1, width, height)
            && has_many_siblings(other, max_at.0, max_at.1, width, height))
}

/// Whether at least three neighbours of `(x1, y1)` share its exact colour.
fn has_many_siblings(img: &[u8], x1: u32, y1: u32, width: u32, height: u32) -> bool {
    let (x0, y0, x2, y2) = neighborhood(x1, y1, width, height);
    let pos = (y1 as usize * width as usize + x1 as usize) * 4;
    let mut zeroes = if x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2 { 1 } else { 0 };

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let pos2 = (y as usize * width as usize + x as usize) * 4;
            if img[pos..pos + 4] == img[pos2..pos2 + 4] {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}

fn draw_pixel(output: &mut [u8], pos: usize, rgb: [u8; 3]) {
    output[pos..pos + 3].copy_from_slice(&rgb);
    output[pos + 3] = 255;
}

fn draw_gray_pixel(img: &[u8], pos: usize, alpha: f64, output: &mut [u8]) {
    let (r, g, b, a) = (
        img[pos] as f64,
        img[pos + 1] as f64,
        img[pos + 2] as f64,
        img[pos + 3] as f64,
    );
    let val = blend(rgb2y(r, g, b), alpha * a / 255.0).round().clamp(0.0, 255.0) as u8;
    draw_pixel(output, pos, [val, val, val]);
}
