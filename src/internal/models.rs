use serde::{Deserialize, Serialize};

/// Logical viewport size in CSS pixels. Design exports may carry fractional heights.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Whole-pixel size handed to the browser, rounded up.
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width.ceil() as u32, self.height.ceil() as u32)
    }
}

/// A named viewport under visual test. `name` joins the baseline, screenshot and diff stores.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Frame {
    pub node_id: String,
    pub name: String,
    pub viewport: Viewport,
}

impl Frame {
    pub fn new(node_id: impl Into<String>, name: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            viewport,
        }
    }

    /// Name of the diff raster written for this frame.
    pub fn diff_name(&self) -> String {
        format!("diff-{}", self.name)
    }
}

/// Raw numbers produced by one raster comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub match_percentage: f64,
    pub diff_pixels: u64,
    pub total_pixels: u64,
}

impl Comparison {
    pub fn from_counts(diff_pixels: u64, total_pixels: u64) -> Self {
        let match_percentage = if total_pixels == 0 {
            100.0
        } else {
            (total_pixels - diff_pixels) as f64 / total_pixels as f64 * 100.0
        };
        Self {
            match_percentage,
            diff_pixels,
            total_pixels,
        }
    }
}

/// Per-frame result aggregated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub name: String,
    pub match_percentage: f64,
    pub diff_pixels: u64,
    pub total_pixels: u64,
    pub diff_path: String,
}

impl ComparisonResult {
    pub fn new(name: impl Into<String>, comparison: Comparison, diff_path: String) -> Self {
        Self {
            name: name.into(),
            match_percentage: comparison.match_percentage,
            diff_pixels: comparison.diff_pixels,
            total_pixels: comparison.total_pixels,
            diff_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_size_rounds_up() {
        let viewport = Viewport::new(1920.0, 7019.98);
        assert_eq!(viewport.pixel_size(), (1920, 7020));
    }

    #[test]
    fn test_match_percentage_formula() {
        let comparison = Comparison::from_counts(100, 10_000);
        assert_eq!(comparison.match_percentage, 99.0);

        let perfect = Comparison::from_counts(0, 42);
        assert_eq!(perfect.match_percentage, 100.0);
    }

    #[test]
    fn test_diff_name() {
        let frame = Frame::new("1-591", "homepage-desktop", Viewport::new(1920.0, 1080.0));
        assert_eq!(frame.diff_name(), "diff-homepage-desktop");
    }
}
