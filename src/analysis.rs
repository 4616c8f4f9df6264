//! Per-frame threat classification and viewing geometry.
//!
//! The pipeline only depends on [`FrameAnalyzer`]; deployments plug in their
//! own classifier. [`HotspotAnalyzer`] is the built-in stand-in.

use image::RgbImage;

use crate::models::FrameAnalysis;

/// Pure function of a decoded frame. Called from blocking worker threads.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(&self, frame: &RgbImage) -> FrameAnalysis;
}

/// Share of hot pixels above which a frame is tagged as a threat
const HOTSPOT_THREAT_RATIO: f64 = 0.01;

/// Flags frames with a saturated-red hotspot and locates it.
///
/// Azimuth and elevation are the angular offset of the hotspot centroid from
/// the optical axis, positive to the right and up. Frames without a hotspot
/// report the optical axis (0, 0).
#[derive(Debug, Clone)]
pub struct HotspotAnalyzer {
    horizontal_fov: f64,
}

impl HotspotAnalyzer {
    pub fn new(horizontal_fov: f64) -> Self {
        Self { horizontal_fov }
    }
}

fn is_hot(pixel: &image::Rgb<u8>) -> bool {
    let [r, g, b] = pixel.0;
    r >= 200 && g <= 80 && b <= 80
}

impl FrameAnalyzer for HotspotAnalyzer {
    fn analyze(&self, frame: &RgbImage) -> FrameAnalysis {
        let (width, height) = frame.dimensions();
        let total = width as u64 * height as u64;

        let mut hot = 0u64;
        let mut sum_x = 0u64;
        let mut sum_y = 0u64;
        for (x, y, pixel) in frame.enumerate_pixels() {
            if is_hot(pixel) {
                hot += 1;
                sum_x += x as u64;
                sum_y += y as u64;
            }
        }

        if total == 0 || hot == 0 {
            return FrameAnalysis {
                is_threat: false,
                fov: self.horizontal_fov,
                azimuth: 0.0,
                elevation: 0.0,
            };
        }

        // Pixel centres, normalised to [-0.5, 0.5] around the optical axis.
        let cx = (sum_x as f64 / hot as f64 + 0.5) / width as f64 - 0.5;
        let cy = (sum_y as f64 / hot as f64 + 0.5) / height as f64 - 0.5;
        let vertical_fov = self.horizontal_fov * height as f64 / width as f64;

        FrameAnalysis {
            is_threat: hot as f64 / total as f64 >= HOTSPOT_THREAT_RATIO,
            fov: self.horizontal_fov,
            azimuth: cx * self.horizontal_fov,
            elevation: -cy * vertical_fov,
        }
    }
}
