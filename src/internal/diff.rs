//! Perceptual per-pixel difference between two equally sized RGBA rasters.
//!
//! Colour distance is measured in YIQ space; a pixel counts as different when
//! its squared distance exceeds `35215 * threshold^2` (35215 being the largest
//! possible distance). Pixels that look like anti-aliasing in either image are
//! drawn but not counted unless `include_aa` is set.

use image::{Rgba, RgbaImage};

const MAX_YIQ_DELTA: f64 = 35215.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffOptions {
    /// Normalised colour distance tolerated per pixel, 0..=1. Lower is stricter.
    pub threshold: f64,
    /// Count anti-aliased pixels as differences.
    pub include_aa: bool,
    /// Opacity of the faded reference drawn under unchanged pixels.
    pub alpha: f64,
    pub aa_color: [u8; 3],
    pub diff_color: [u8; 3],
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            include_aa: false,
            alpha: 0.1,
            aa_color: [255, 255, 0],
            diff_color: [255, 0, 0],
        }
    }
}

impl DiffOptions {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PixelDiff {
    pub image: RgbaImage,
    pub diff_pixels: u64,
}

/// Diff two rasters of identical dimensions.
///
/// Callers must check dimensions first; the comparator turns a mismatch into an error.
pub fn pixel_diff(reference: &RgbaImage, actual: &RgbaImage, options: &DiffOptions) -> PixelDiff {
    debug_assert_eq!(reference.dimensions(), actual.dimensions());

    let (width, height) = reference.dimensions();
    let mut output = RgbaImage::new(width, height);

    if reference.as_raw() == actual.as_raw() {
        for (x, y, px) in reference.enumerate_pixels() {
            output.put_pixel(x, y, gray_pixel(px, options.alpha));
        }
        return PixelDiff {
            image: output,
            diff_pixels: 0,
        };
    }

    let max_delta = MAX_YIQ_DELTA * options.threshold * options.threshold;
    let mut diff_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            let a = reference.get_pixel(x, y);
            let b = actual.get_pixel(x, y);
            let delta = color_delta(a, b, false);

            if delta.abs() > max_delta {
                let antialiased = !options.include_aa
                    && (is_antialiased(reference, actual, x, y)
                        || is_antialiased(actual, reference, x, y));
                if antialiased {
                    output.put_pixel(x, y, opaque(options.aa_color));
                } else {
                    output.put_pixel(x, y, opaque(options.diff_color));
                    diff_pixels += 1;
                }
            } else {
                output.put_pixel(x, y, gray_pixel(a, options.alpha));
            }
        }
    }

    PixelDiff {
        image: output,
        diff_pixels,
    }
}

fn opaque([r, g, b]: [u8; 3]) -> Rgba<u8> {
    Rgba([r, g, b, 255])
}

fn gray_pixel(px: &Rgba<u8>, alpha: f64) -> Rgba<u8> {
    let [r, g, b, a] = px.0;
    let luma = rgb_to_y(r as f64, g as f64, b as f64);
    let value = blend(luma, alpha * a as f64 / 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba([value, value, value, 255])
}

/// Blend a channel with white by `alpha`.
fn blend(channel: f64, alpha: f64) -> f64 {
    255.0 + (channel - 255.0) * alpha
}

fn rgb_to_y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.29889531 + g * 0.58662247 + b * 0.11448223
}

fn rgb_to_i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.59597799 - g * 0.27417610 - b * 0.32180189
}

fn rgb_to_q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.21147017 - g * 0.52261711 + b * 0.31114694
}

fn flatten(px: &Rgba<u8>) -> (f64, f64, f64) {
    let [r, g, b, a] = px.0;
    let (r, g, b) = (r as f64, g as f64, b as f64);
    if a < 255 {
        let alpha = a as f64 / 255.0;
        (blend(r, alpha), blend(g, alpha), blend(b, alpha))
    } else {
        (r, g, b)
    }
}

/// Squared YIQ distance, negative when the first pixel is brighter.
/// With `y_only` the signed brightness difference is returned instead.
fn color_delta(a: &Rgba<u8>, b: &Rgba<u8>, y_only: bool) -> f64 {
    if a == b {
        return 0.0;
    }

    let (r1, g1, b1) = flatten(a);
    let (r2, g2, b2) = flatten(b);

    let y1 = rgb_to_y(r1, g1, b1);
    let y2 = rgb_to_y(r2, g2, b2);
    let y = y1 - y2;

    if y_only {
        return y;
    }

    let i = rgb_to_i(r1, g1, b1) - rgb_to_i(r2, g2, b2);
    let q = rgb_to_q(r1, g1, b1) - rgb_to_q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 { -delta } else { delta }
}

/// Inclusive 3x3 neighbourhood bounds clamped to the image.
fn neighbourhood(x: u32, y: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    (
        x.saturating_sub(1),
        y.saturating_sub(1),
        (x + 1).min(width - 1),
        (y + 1).min(height - 1),
    )
}

/// Whether the pixel at (x, y) in `image` looks like anti-aliasing when checked against `other`.
fn is_antialiased(image: &RgbaImage, other: &RgbaImage, x: u32, y: u32) -> bool {
    let (width, height) = image.dimensions();
    let (x0, y0, x2, y2) = neighbourhood(x, y, width, height);
    let center = image.get_pixel(x, y);

    let mut zeroes = u32::from(x == x0 || x == x2 || y == y0 || y == y2);
    let mut min = 0.0;
    let mut max = 0.0;
    let mut min_at = (0, 0);
    let mut max_at = (0, 0);

    for nx in x0..=x2 {
        for ny in y0..=y2 {
            if nx == x && ny == y {
                continue;
            }

            let delta = color_delta(center, image.get_pixel(nx, ny), true);
            if delta == 0.0 {
                zeroes += 1;
                // more than two identical siblings: part of a flat region, not a ramp
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (nx, ny);
            } else if delta > max {
                max = delta;
                max_at = (nx, ny);
            }
        }
    }

    // no darker or no brighter neighbour
    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(image, min_at.0, min_at.1) && has_many_siblings(other, min_at.0, min_at.1))
        || (has_many_siblings(image, max_at.0, max_at.1)
            && has_many_siblings(other, max_at.0, max_at.1))
}

/// Whether the pixel has at least three neighbours of exactly the same colour.
fn has_many_siblings(image: &RgbaImage, x: u32, y: u32) -> bool {
    let (width, height) = image.dimensions();
    let (x0, y0, x2, y2) = neighbourhood(x, y, width, height);
    let center = image.get_pixel(x, y);

    let mut zeroes = u32::from(x == x0 || x == x2 || y == y0 || y == y2);

    for nx in x0..=x2 {
        for ny in y0..=y2 {
            if nx == x && ny == y {
                continue;
            }
            if image.get_pixel(nx, ny) == center {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(rgba))
    }

    #[test]
    fn identical_images_have_no_differences() {
        let a = solid(8, 8, [10, 20, 30, 255]);
        let result = pixel_diff(&a, &a.clone(), &DiffOptions::default());

        assert_eq!(result.diff_pixels, 0);
        assert_eq!(result.image.dimensions(), (8, 8));
        // unchanged pixels are drawn as faded gray, fully opaque
        let px = result.image.get_pixel(0, 0);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn white_square_on_black_counts_every_pixel() {
        let reference = solid(100, 100, [0, 0, 0, 255]);
        let mut actual = reference.clone();
        for y in 40..50 {
            for x in 40..50 {
                actual.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }

        let result = pixel_diff(&reference, &actual, &DiffOptions::default());

        assert_eq!(result.diff_pixels, 100);
        assert_eq!(*result.image.get_pixel(45, 45), Rgba([255, 0, 0, 255]));
        assert_ne!(*result.image.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn small_shift_below_threshold_is_ignored() {
        let reference = solid(4, 4, [100, 100, 100, 255]);
        let actual = solid(4, 4, [103, 103, 103, 255]);

        let result = pixel_diff(&reference, &actual, &DiffOptions::default());
        assert_eq!(result.diff_pixels, 0);

        let strict = pixel_diff(&reference, &actual, &DiffOptions::with_threshold(0.0));
        assert_eq!(strict.diff_pixels, 16);
    }

    #[test]
    fn antialiased_edge_pixel_is_excluded_unless_requested() {
        // Left half black, right half white, with a single mid-gray pixel on the
        // boundary of the actual image: a classic anti-aliasing ramp.
        let mut reference = RgbaImage::new(6, 6);
        for (x, _, px) in reference.enumerate_pixels_mut() {
            *px = if x < 3 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            };
        }
        let mut actual = reference.clone();
        actual.put_pixel(2, 3, Rgba([128, 128, 128, 255]));

        let lenient = pixel_diff(&reference, &actual, &DiffOptions::default());
        assert_eq!(lenient.diff_pixels, 0);
        assert_eq!(*lenient.image.get_pixel(2, 3), Rgba([255, 255, 0, 255]));

        let options = DiffOptions {
            include_aa: true,
            ..DiffOptions::default()
        };
        let strict = pixel_diff(&reference, &actual, &options);
        assert_eq!(strict.diff_pixels, 1);
    }

    #[test]
    fn color_delta_sign_follows_brightness() {
        let black = Rgba([0, 0, 0, 255]);
        let white = Rgba([255, 255, 255, 255]);

        assert!(color_delta(&white, &black, false) < 0.0);
        assert!(color_delta(&black, &white, false) > 0.0);
        let delta = color_delta(&black, &white, false);
        assert!(delta > MAX_YIQ_DELTA * 0.1 * 0.1);
        assert!(delta <= MAX_YIQ_DELTA);
    }
}
