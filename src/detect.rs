//! Detect candidate spots in a single frame.
//!
//! Detection finds integer-pixel locations likely to contain a
//! diffraction-limited spot:
//! 1. Compute a response image (`LocalMax`: the raw intensities; `Dog`: a
//!    difference-of-Gaussians band-pass that suppresses uneven background)
//! 2. Estimate the response background level and noise (median plus
//!    lower-half sigma, robust to the bright spots themselves)
//! 3. Keep local maxima above `background + threshold * noise`
//! 4. Suppress non-maximal candidates within `min_separation` pixels
//!
//! Fine discrimination of real spots from noise is deferred to the
//! sub-pixel fit; detection only has to be permissive and deterministic.
//! A degenerate frame (empty, flat, or zero-noise) yields an empty
//! candidate list, never an error.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::Frame;

/// Detection algorithm variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectMethod {
    /// Threshold the raw intensities and keep local maxima.
    #[default]
    LocalMax,
    /// Difference-of-Gaussians band-pass before thresholding. More robust
    /// against smooth background structure at the cost of two blurs.
    Dog,
}

/// Configuration for spot detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Detection algorithm variant.
    #[serde(default)]
    pub method: DetectMethod,
    /// Number of sigma above the background level a local maximum must
    /// reach to become a candidate. Default: 4.0
    pub threshold: f32,
    /// Minimum pairwise distance between candidates, in pixels. Overlapping
    /// maxima collapse to the strongest one. Default: 5.0
    pub min_separation: f32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            method: DetectMethod::LocalMax,
            threshold: 4.0,
            min_separation: 5.0,
        }
    }
}

/// An integer-pixel spot candidate, pre-refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Source frame index.
    pub frame: usize,
    /// Pixel row of the local maximum.
    pub row: usize,
    /// Pixel column of the local maximum.
    pub col: usize,
    /// Detection score (response value at the maximum).
    pub score: f32,
}

/// Sigma of the narrow DoG kernel, matched to a diffraction-limited spot.
const DOG_SIGMA_NARROW: f32 = 1.0;
/// Sigma of the wide DoG kernel (background scale).
const DOG_SIGMA_WIDE: f32 = 2.0;

/// Detect spot candidates in one frame.
///
/// Deterministic for identical input and configuration: candidates are
/// ordered by descending score, then row, then column. Returns an empty
/// list for degenerate frames.
pub fn detect(frame: &Frame, config: &DetectConfig) -> Vec<Candidate> {
    if frame.width < 3 || frame.height < 3 {
        return Vec::new();
    }

    let response: Vec<f32> = match config.method {
        DetectMethod::LocalMax => frame.pixels.clone(),
        DetectMethod::Dog => dog_filter(&frame.pixels, frame.width, frame.height),
    };

    let (bg, noise) = estimate_background(&response);
    if noise <= 0.0 || !noise.is_finite() {
        // Flat or pathological frame: nothing to detect.
        return Vec::new();
    }
    let threshold = bg + config.threshold * noise;

    // Local maxima above threshold (1-pixel border excluded: the sub-pixel
    // window could not be centered there anyway).
    let w = frame.width;
    let mut candidates: Vec<Candidate> = Vec::new();
    for row in 1..frame.height - 1 {
        for col in 1..w - 1 {
            let v = response[row * w + col];
            if v <= threshold || !v.is_finite() {
                continue;
            }
            let is_max = [
                response[(row - 1) * w + col - 1],
                response[(row - 1) * w + col],
                response[(row - 1) * w + col + 1],
                response[row * w + col - 1],
                response[row * w + col + 1],
                response[(row + 1) * w + col - 1],
                response[(row + 1) * w + col],
                response[(row + 1) * w + col + 1],
            ]
            .iter()
            .all(|&n| v >= n);
            if is_max {
                candidates.push(Candidate {
                    frame: frame.index,
                    row,
                    col,
                    score: v,
                });
            }
        }
    }

    let kept = suppress_non_maxima(candidates, config.min_separation);
    debug!(
        frame = frame.index,
        candidates = kept.len(),
        bg,
        noise,
        "detected spot candidates"
    );
    kept
}

/// Non-maximum suppression: strongest candidate wins within
/// `min_separation` pixels (Euclidean). Input order does not matter; the
/// result is sorted by descending score, then row, then column.
fn suppress_non_maxima(mut candidates: Vec<Candidate>, min_separation: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.row.cmp(&b.row))
            .then(a.col.cmp(&b.col))
    });

    let min_sep_sq = (min_separation * min_separation) as f64;
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        let occupied = kept.iter().any(|k| {
            let dy = k.row as f64 - cand.row as f64;
            let dx = k.col as f64 - cand.col as f64;
            dy * dy + dx * dx < min_sep_sq
        });
        if !occupied {
            kept.push(cand);
        }
    }
    kept
}

/// Estimate the background level and noise of a response image.
///
/// Uses the median as the background level and the RMS of the below-median
/// pixels as the noise sigma. Spots only contaminate the upper half of the
/// distribution, so the lower half mirrors the uncontaminated noise.
fn estimate_background(values: &[f32]) -> (f32, f32) {
    let mut finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return (0.0, 0.0);
    }
    finite.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = finite.len();
    let median = if n % 2 == 0 {
        (finite[n / 2 - 1] + finite[n / 2]) / 2.0
    } else {
        finite[n / 2]
    };

    let mut sum_sq = 0.0_f64;
    let mut count = 0usize;
    for &v in finite.iter().take_while(|&&v| v <= median) {
        let d = (v - median) as f64;
        sum_sq += d * d;
        count += 1;
    }
    if count == 0 {
        return (median, 0.0);
    }
    let sigma = (sum_sq / count as f64).sqrt() as f32;
    (median, sigma)
}

/// Difference-of-Gaussians band-pass filter.
fn dog_filter(pixels: &[f32], width: usize, height: usize) -> Vec<f32> {
    let narrow = gaussian_blur(pixels, width, height, DOG_SIGMA_NARROW);
    let wide = gaussian_blur(pixels, width, height, DOG_SIGMA_WIDE);
    narrow
        .iter()
        .zip(wide.iter())
        .map(|(&a, &b)| a - b)
        .collect()
}

/// Separable Gaussian blur with reflective boundary handling.
fn gaussian_blur(pixels: &[f32], width: usize, height: usize, sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|k| (-(k * k) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f32 = kernel.iter().sum();
    let kernel: Vec<f32> = kernel.iter().map(|&k| k / norm).collect();

    let reflect = |i: isize, n: usize| -> usize {
        let n = n as isize;
        let mut i = i;
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * n - 2 - i;
        }
        i.clamp(0, n - 1) as usize
    };

    // Horizontal pass
    let mut tmp = vec![0.0_f32; pixels.len()];
    for row in 0..height {
        let off = row * width;
        for col in 0..width {
            let mut acc = 0.0;
            for (ki, &kv) in kernel.iter().enumerate() {
                let c = reflect(col as isize + ki as isize - radius, width);
                acc += kv * pixels[off + c];
            }
            tmp[off + col] = acc;
        }
    }

    // Vertical pass
    let mut out = vec![0.0_f32; pixels.len()];
    for row in 0..height {
        for col in 0..width {
            let mut acc = 0.0;
            for (ki, &kv) in kernel.iter().enumerate() {
                let r = reflect(row as isize + ki as isize - radius, height);
                acc += kv * tmp[r * width + col];
            }
            out[row * width + col] = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic frame: uniform background with Gaussian spots added.
    fn spot_frame(width: usize, height: usize, spots: &[(f32, f32, f32)]) -> Frame {
        let mut pixels = vec![10.0_f32; width * height];
        // Deterministic low-amplitude ripple so the noise estimate is nonzero.
        for (i, p) in pixels.iter_mut().enumerate() {
            *p += ((i * 2654435761) % 7) as f32 * 0.1;
        }
        for &(sy, sx, amp) in spots {
            for row in 0..height {
                for col in 0..width {
                    let dy = row as f32 - sy;
                    let dx = col as f32 - sx;
                    pixels[row * width + col] += amp * (-(dy * dy + dx * dx) / 4.5).exp();
                }
            }
        }
        Frame::new(0, width, height, pixels)
    }

    #[test]
    fn test_detects_isolated_spots() {
        let frame = spot_frame(64, 64, &[(20.0, 20.0, 200.0), (45.0, 40.0, 150.0)]);
        let config = DetectConfig::default();
        let cands = detect(&frame, &config);
        assert_eq!(cands.len(), 2);
        // Strongest first
        assert!(cands[0].score >= cands[1].score);
        assert!((cands[0].row as i64 - 20).abs() <= 1);
        assert!((cands[0].col as i64 - 20).abs() <= 1);
    }

    #[test]
    fn test_min_separation_holds() {
        // A cluster of three nearby spots plus one far away.
        let frame = spot_frame(
            64,
            64,
            &[
                (30.0, 30.0, 200.0),
                (32.0, 33.0, 180.0),
                (28.0, 33.0, 160.0),
                (10.0, 50.0, 150.0),
            ],
        );
        let config = DetectConfig {
            min_separation: 6.0,
            ..Default::default()
        };
        let cands = detect(&frame, &config);
        for (i, a) in cands.iter().enumerate() {
            for b in cands.iter().skip(i + 1) {
                let dy = a.row as f64 - b.row as f64;
                let dx = a.col as f64 - b.col as f64;
                assert!(
                    (dy * dy + dx * dx).sqrt() >= config.min_separation as f64,
                    "candidates closer than min_separation: {a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn test_degenerate_frames_yield_nothing() {
        let flat = Frame::new(0, 32, 32, vec![100.0; 32 * 32]);
        assert!(detect(&flat, &DetectConfig::default()).is_empty());

        let tiny = Frame::new(0, 2, 2, vec![0.0; 4]);
        assert!(detect(&tiny, &DetectConfig::default()).is_empty());
    }

    #[test]
    fn test_dog_suppresses_gradient_background() {
        // Strong linear gradient plus one spot; LocalMax on the raw image
        // would fire on the bright edge, DoG should not.
        let width = 64;
        let height = 64;
        let mut pixels = vec![0.0_f32; width * height];
        for row in 0..height {
            for col in 0..width {
                pixels[row * width + col] = 10.0 + 3.0 * col as f32;
            }
        }
        for row in 0..height {
            for col in 0..width {
                let dy = row as f32 - 30.0;
                let dx = col as f32 - 20.0;
                pixels[row * width + col] += 300.0 * (-(dy * dy + dx * dx) / 4.5).exp();
            }
        }
        let frame = Frame::new(0, width, height, pixels);
        let config = DetectConfig {
            method: DetectMethod::Dog,
            ..Default::default()
        };
        let cands = detect(&frame, &config);
        assert!(!cands.is_empty());
        assert!((cands[0].row as i64 - 30).abs() <= 1);
        assert!((cands[0].col as i64 - 20).abs() <= 1);
    }

    #[test]
    fn test_deterministic_output() {
        let frame = spot_frame(64, 64, &[(20.0, 20.0, 200.0), (45.0, 40.0, 150.0)]);
        let config = DetectConfig::default();
        assert_eq!(detect(&frame, &config), detect(&frame, &config));
    }
}
