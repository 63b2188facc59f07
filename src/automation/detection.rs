//! UI element detection via normalized template matching.
//!
//! Both the screenshot and the reference icon are compared as grayscale
//! intensity images. The similarity at each offset is the mean-subtracted
//! normalized cross-correlation, so uniform brightness shifts between the
//! icon and the live screen do not affect the score.

use image::GrayImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Variance below this is treated as a flat (featureless) patch.
const FLAT_EPSILON: f64 = 1e-6;

/// A pixel position on the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// Result of comparing one template against one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    /// Best similarity found, in [0, 1]
    pub confidence: f64,
    /// Top-left offset of the best window; only set when the confidence
    /// reached the threshold
    pub location: Option<Point>,
    /// Template dimensions (width, height)
    pub size: (u32, u32),
}

impl TemplateMatch {
    /// Whether the confidence reached the threshold.
    pub fn is_found(&self) -> bool {
        self.location.is_some()
    }

    /// Where to tap to hit the matched element: the window's center.
    pub fn tap_point(&self) -> Option<Point> {
        self.location.map(|p| Point {
            x: p.x + self.size.0 / 2,
            y: p.y + self.size.1 / 2,
        })
    }
}

/// Best raw score of a template over an image, before thresholding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestScore {
    pub confidence: f64,
    pub offset: Point,
}

/// Finds the offset where `template` best matches `screen`.
///
/// Returns `None` when the template is empty or larger than the screen.
pub fn best_match(screen: &GrayImage, template: &GrayImage) -> Option<BestScore> {
    let (sw, sh) = screen.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > sw || th > sh {
        return None;
    }

    let n = (tw * th) as f64;
    let tmean = template.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let tdev: Vec<f64> = template.pixels().map(|p| p[0] as f64 - tmean).collect();
    let tvar: f64 = tdev.iter().map(|v| v * v).sum();
    let template_flat = tvar < FLAT_EPSILON;

    let (sum, sum_sq) = integral_images(screen);
    let stride = (sw + 1) as usize;
    let window = |table: &[f64], x: u32, y: u32| -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + tw as usize, y0 + th as usize);
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    };

    let raw = screen.as_raw();
    let mut best = BestScore {
        confidence: f64::NEG_INFINITY,
        offset: Point { x: 0, y: 0 },
    };

    for y in 0..=(sh - th) {
        for x in 0..=(sw - tw) {
            let s = window(&sum, x, y);
            let s2 = window(&sum_sq, x, y);
            let wvar = (s2 - s * s / n).max(0.0);
            let window_flat = wvar < FLAT_EPSILON;

            let score = if template_flat {
                // Flat templates can only be told apart by flatness and level
                if window_flat && (s / n - tmean).abs() < 1.0 {
                    1.0
                } else {
                    0.0
                }
            } else if window_flat {
                0.0
            } else {
                // The template deviations sum to zero, so the window mean drops out
                let mut num = 0.0;
                for j in 0..th {
                    let row = ((y + j) * sw + x) as usize;
                    let trow = (j * tw) as usize;
                    for i in 0..tw as usize {
                        num += tdev[trow + i] * raw[row + i] as f64;
                    }
                }
                num / (tvar * wvar).sqrt()
            };

            if score > best.confidence {
                best = BestScore {
                    confidence: score,
                    offset: Point { x, y },
                };
            }
        }
    }

    best.confidence = best.confidence.clamp(0.0, 1.0);
    Some(best)
}

/// Summed-area tables of intensity and squared intensity, with a zero
/// border row/column.
fn integral_images(img: &GrayImage) -> (Vec<f64>, Vec<f64>) {
    let (w, h) = img.dimensions();
    let stride = (w + 1) as usize;
    let mut sum = vec![0.0; stride * (h + 1) as usize];
    let mut sum_sq = vec![0.0; stride * (h + 1) as usize];

    for y in 0..h as usize {
        let mut row = 0.0;
        let mut row_sq = 0.0;
        for x in 0..w as usize {
            let v = img.as_raw()[y * w as usize + x] as f64;
            row += v;
            row_sq += v * v;
            sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
            sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
        }
    }

    (sum, sum_sq)
}

/// Locates named reference icons inside screenshots.
pub struct TemplateMatcher {
    search_dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<PathBuf, Arc<GrayImage>>>,
}

impl TemplateMatcher {
    /// Templates are looked up in `search_dirs`, first hit wins.
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a template name against the search directories in order.
    /// First existing file wins.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.search_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn load_template(&self, path: &Path) -> Option<Arc<GrayImage>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(img) = cache.get(path) {
            return Some(img.clone());
        }
        match image::open(path) {
            Ok(img) => {
                let gray = Arc::new(img.to_luma8());
                cache.insert(path.to_path_buf(), gray.clone());
                Some(gray)
            }
            Err(e) => {
                crate::log(&format!(
                    "Failed to load template {}: {}",
                    path.display(),
                    e
                ));
                None
            }
        }
    }

    /// Compares `template_name` against the capture at `capture_path`.
    ///
    /// Returns `None` only when an image is unavailable (missing template,
    /// unreadable capture). A below-threshold result is `Some` with no
    /// location.
    pub fn evaluate(
        &self,
        capture_path: &Path,
        template_name: &str,
        threshold: f64,
    ) -> Option<TemplateMatch> {
        let Some(template_path) = self.resolve(template_name) else {
            crate::log(&format!("Template not found: {}", template_name));
            return None;
        };
        let template = self.load_template(&template_path)?;

        let screen = match image::open(capture_path) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                crate::log(&format!(
                    "Failed to load screenshot {}: {}",
                    capture_path.display(),
                    e
                ));
                return None;
            }
        };

        let Some(best) = best_match(&screen, &template) else {
            crate::log(&format!(
                "Template {} ({}x{}) does not fit screen {}x{}",
                template_name,
                template.width(),
                template.height(),
                screen.width(),
                screen.height()
            ));
            return None;
        };

        crate::log(&format!(
            "Template matching confidence: {:.3} (threshold: {}) for {}",
            best.confidence, threshold, template_name
        ));

        Some(TemplateMatch {
            confidence: best.confidence,
            location: (best.confidence >= threshold).then_some(best.offset),
            size: template.dimensions(),
        })
    }

    /// Returns the matched element's position when its confidence reaches
    /// `threshold`, `None` otherwise.
    pub fn locate(&self, capture_path: &Path, template_name: &str, threshold: f64) -> Option<Point> {
        self.evaluate(capture_path, template_name, threshold)
            .and_then(|m| m.location)
    }

    /// Same as [`locate`](Self::locate) on the same capture, tagged with the
    /// instance for log correlation. Taking a fresh capture between tries is
    /// the caller's job.
    pub fn locate_for_instance(
        &self,
        capture_path: &Path,
        template_name: &str,
        threshold: f64,
        instance: u32,
    ) -> Option<TemplateMatch> {
        let result = self
            .evaluate(capture_path, template_name, threshold)
            .filter(TemplateMatch::is_found);
        match &result {
            Some(m) => crate::log(&format!(
                "[Instance {}] Found {} at {:?} ({:.3})",
                instance, template_name, m.location, m.confidence
            )),
            None => crate::log(&format!(
                "[Instance {}] {} not found",
                instance, template_name
            )),
        }
        result
    }
}
