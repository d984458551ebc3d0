use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use super::diff::{DiffOptions, pixel_diff};
use super::models::Comparison;

pub const DEFAULT_THRESHOLD: f64 = 0.1;

#[derive(Debug, Error)]
pub enum CompareError {
    #[error(
        "Image dimensions must match. Reference: {reference_width}x{reference_height}, Implementation: {actual_width}x{actual_height}"
    )]
    DimensionMismatch {
        reference_width: u32,
        reference_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("failed to decode {what} image: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode diff image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid threshold {0}, expected a value between 0 and 1")]
    InvalidThreshold(f64),
}

/// Compare two PNG files and write the diff raster to `diff_path`.
///
/// Inputs are never modified. Parent directories of `diff_path` are created as needed.
pub fn compare(
    reference_path: &Path,
    implementation_path: &Path,
    diff_path: &Path,
    threshold: f64,
) -> Result<Comparison, CompareError> {
    let reference = read(reference_path)?;
    let implementation = read(implementation_path)?;

    let (comparison, diff_png) = compare_bytes(&reference, &implementation, threshold)?;

    write(diff_path, &diff_png)?;

    Ok(comparison)
}

/// Compare two PNG buffers, returning the score and the encoded diff raster.
pub fn compare_bytes(
    reference_png: &[u8],
    implementation_png: &[u8],
    threshold: f64,
) -> Result<(Comparison, Vec<u8>), CompareError> {
    let reference = decode(reference_png, "reference")?;
    let implementation = decode(implementation_png, "implementation")?;

    let (comparison, diff) = compare_images(&reference, &implementation, threshold)?;
    Ok((comparison, encode(&diff)?))
}

/// Compare decoded rasters. Unequal dimensions are an error, never resized or cropped.
pub fn compare_images(
    reference: &RgbaImage,
    implementation: &RgbaImage,
    threshold: f64,
) -> Result<(Comparison, RgbaImage), CompareError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(CompareError::InvalidThreshold(threshold));
    }

    let (reference_width, reference_height) = reference.dimensions();
    let (actual_width, actual_height) = implementation.dimensions();
    if (reference_width, reference_height) != (actual_width, actual_height) {
        return Err(CompareError::DimensionMismatch {
            reference_width,
            reference_height,
            actual_width,
            actual_height,
        });
    }

    let diff = pixel_diff(
        reference,
        implementation,
        &DiffOptions::with_threshold(threshold),
    );
    let total_pixels = reference_width as u64 * reference_height as u64;

    Ok((
        Comparison::from_counts(diff.diff_pixels, total_pixels),
        diff.image,
    ))
}

fn read(path: &Path) -> Result<Vec<u8>, CompareError> {
    std::fs::read(path).map_err(|source| CompareError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn write(path: &Path, data: &[u8]) -> Result<(), CompareError> {
    crate::utils::fs::create_parent_dir(path)
        .and_then(|()| std::fs::write(path, data))
        .map_err(|source| CompareError::Io {
            path: path.display().to_string(),
            source,
        })
}

pub fn decode(data: &[u8], what: &'static str) -> Result<RgbaImage, CompareError> {
    image::load_from_memory_with_format(data, ImageFormat::Png)
        .map(|img| img.to_rgba8())
        .map_err(|source| CompareError::Decode { what, source })
}

pub fn encode(image: &RgbaImage) -> Result<Vec<u8>, CompareError> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(CompareError::Encode)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn black(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]))
    }

    fn with_white_square(mut img: RgbaImage, origin: u32, size: u32) -> RgbaImage {
        for y in origin..origin + size {
            for x in origin..origin + size {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        img
    }

    #[test]
    fn test_identical_rasters_match_fully() {
        let img = black(20, 10);
        let (comparison, _) = compare_images(&img, &img.clone(), DEFAULT_THRESHOLD).unwrap();

        assert_eq!(comparison.diff_pixels, 0);
        assert_eq!(comparison.total_pixels, 200);
        assert_eq!(comparison.match_percentage, 100.0);
    }

    #[test]
    fn test_white_square_scores_ninety_nine() {
        let reference = encode(&black(100, 100)).unwrap();
        let implementation = encode(&with_white_square(black(100, 100), 30, 10)).unwrap();

        let (comparison, diff_png) =
            compare_bytes(&reference, &implementation, DEFAULT_THRESHOLD).unwrap();

        assert_eq!(comparison.diff_pixels, 100);
        assert_eq!(comparison.total_pixels, 10_000);
        assert_eq!(comparison.match_percentage, 99.0);

        let diff = decode(&diff_png, "diff").unwrap();
        assert_eq!(diff.dimensions(), (100, 100));
    }

    #[test]
    fn test_dimension_mismatch_is_hard_error() {
        let result = compare_images(&black(100, 100), &black(100, 120), DEFAULT_THRESHOLD);

        match result {
            Err(CompareError::DimensionMismatch {
                reference_height,
                actual_height,
                ..
            }) => {
                assert_eq!(reference_height, 100);
                assert_eq!(actual_height, 120);
            }
            other => panic!("expected dimension mismatch, got {:?}", other.map(|r| r.0)),
        }
    }

    #[test]
    fn test_dimension_mismatch_message_names_both_sizes() {
        let err = compare_images(&black(10, 10), &black(12, 10), DEFAULT_THRESHOLD).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("10x10"));
        assert!(msg.contains("12x10"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let img = black(2, 2);
        assert!(matches!(
            compare_images(&img, &img, 1.5),
            Err(CompareError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_compare_files_writes_diff_and_leaves_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let reference_path = dir.path().join("figma").join("home.png");
        let implementation_path = dir.path().join("shots").join("home.png");
        let diff_path = dir.path().join("diff").join("nested").join("diff-home.png");

        let reference = encode(&black(50, 50)).unwrap();
        let implementation = encode(&with_white_square(black(50, 50), 0, 5)).unwrap();
        crate::utils::fs::write_creating_dirs(&reference_path, &reference).unwrap();
        crate::utils::fs::write_creating_dirs(&implementation_path, &implementation).unwrap();

        let comparison = compare(
            &reference_path,
            &implementation_path,
            &diff_path,
            DEFAULT_THRESHOLD,
        )
        .unwrap();

        assert_eq!(comparison.diff_pixels, 25);
        assert!(diff_path.is_file());
        assert_eq!(std::fs::read(&reference_path).unwrap(), reference);
        assert_eq!(std::fs::read(&implementation_path).unwrap(), implementation);
    }

    #[test]
    fn test_diff_written_under_a_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("home.png");
        std::fs::write(&input, encode(&black(4, 4)).unwrap()).unwrap();
        let diff_path = input.join("diff-home.png");

        let err = compare(&input, &input, &diff_path, 0.1).unwrap_err();

        assert!(matches!(err, CompareError::Io { .. }));
        assert!(err.to_string().contains("diff-home.png"));
    }

    #[test]
    fn test_compare_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.png");

        let result = compare(&missing, &missing, &dir.path().join("d.png"), 0.1);
        assert!(matches!(result, Err(CompareError::Io { .. })));
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let result = compare_bytes(b"not a png", b"also not", 0.1);
        assert!(matches!(
            result,
            Err(CompareError::Decode {
                what: "reference",
                ..
            })
        ));
    }
}
