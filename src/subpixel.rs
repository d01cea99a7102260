//! Refine spot candidates to sub-pixel localizations.
//!
//! Each candidate is fit with a symmetric 2D Gaussian plus constant
//! background over a square window centered on the candidate pixel:
//!
//! ```text
//! model(r, c) = bg + i0 · exp(-((r - y)² + (c - x)²) / (2σ²))
//! ```
//!
//! The five parameters (y, x, i0, bg, σ) are refined by Gauss-Newton
//! iteration, solving each linearized step with an SVD least-squares solve.
//! Iteration stops when the position step falls below the configured
//! tolerance or the iteration cap is reached; a capped, non-converged fit
//! is reported as a failure rather than a possibly-divergent estimate.
//!
//! The fit is a pure function of (frame, candidate, config) and never
//! panics on low signal-to-noise input: amplitudes and backgrounds are
//! clamped non-negative, and fits that escape the window are rejected.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::detect::Candidate;
use crate::frame::Frame;

/// Outcome code of one sub-pixel fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// Successful fit; position and photophysical parameters are valid.
    Ok,
    /// Iteration cap reached before the position step fell below tolerance.
    NoConverge,
    /// The fitted position moved more than half the window from the seed
    /// (the fit escaped to a neighboring source).
    Diverged,
    /// Negative, zero, or non-finite amplitude or width at convergence.
    BadAmplitude,
    /// The candidate sits too close to the frame edge for a usable window.
    WindowClipped,
}

impl FitStatus {
    /// Numeric code stored in localization tables. 0 means success.
    pub fn code(self) -> u8 {
        match self {
            FitStatus::Ok => 0,
            FitStatus::NoConverge => 1,
            FitStatus::Diverged => 2,
            FitStatus::BadAmplitude => 3,
            FitStatus::WindowClipped => 4,
        }
    }

    /// Inverse of [`code`](Self::code). Unknown codes map to `NoConverge`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FitStatus::Ok,
            2 => FitStatus::Diverged,
            3 => FitStatus::BadAmplitude,
            4 => FitStatus::WindowClipped,
            _ => FitStatus::NoConverge,
        }
    }

    /// Whether this localization may participate in linking.
    pub fn is_ok(self) -> bool {
        self == FitStatus::Ok
    }
}

/// Configuration for sub-pixel localization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalizeConfig {
    /// Side length of the square fitting window, in pixels. Forced odd so
    /// the window centers on the candidate. Default: 9
    pub window_size: usize,
    /// Iteration cap for the Gauss-Newton refinement. Default: 20
    pub max_iterations: usize,
    /// Convergence tolerance on the position step, in pixels. Default: 1e-4
    pub tolerance: f64,
}

impl Default for LocalizeConfig {
    fn default() -> Self {
        Self {
            window_size: 9,
            max_iterations: 20,
            tolerance: 1e-4,
        }
    }
}

/// One refined per-frame observation of a spot.
///
/// When `status` is not [`FitStatus::Ok`] the position fields hold the
/// integer seed and the row must be excluded from linking.
#[derive(Debug, Clone, PartialEq)]
pub struct Localization {
    /// Source frame index.
    pub frame: usize,
    /// Localization identifier, assigned in detection order within a file.
    pub loc_id: u64,
    /// Sub-pixel row position, in pixels.
    pub y: f64,
    /// Sub-pixel column position, in pixels.
    pub x: f64,
    /// Fitted amplitude above background (non-negative on success).
    pub i0: f64,
    /// Fitted constant background level (non-negative on success).
    pub bg: f64,
    /// Fitted Gaussian width, in pixels.
    pub sigma: f64,
    /// Positional standard error estimate, in pixels (≥ 0).
    pub error: f64,
    /// Fit outcome code.
    pub status: FitStatus,
}

impl Localization {
    fn failed(candidate: &Candidate, loc_id: u64, status: FitStatus) -> Self {
        Self {
            frame: candidate.frame,
            loc_id,
            y: candidate.row as f64,
            x: candidate.col as f64,
            i0: 0.0,
            bg: 0.0,
            sigma: 0.0,
            error: 0.0,
            status,
        }
    }
}

/// Fit one candidate. Pure function of its inputs; always produces exactly
/// one [`Localization`], successful or not.
pub fn localize(
    frame: &Frame,
    candidate: &Candidate,
    config: &LocalizeConfig,
    loc_id: u64,
) -> Localization {
    let half = (config.window_size.max(3) | 1) / 2; // odd window, ≥ 3

    // Window bounds, rejecting candidates whose window would clip the edge
    // so severely that fewer than 3x3 pixels remain centered on the seed.
    if candidate.row < 1
        || candidate.col < 1
        || candidate.row + 1 >= frame.height
        || candidate.col + 1 >= frame.width
    {
        return Localization::failed(candidate, loc_id, FitStatus::WindowClipped);
    }
    let r0 = candidate.row.saturating_sub(half);
    let r1 = (candidate.row + half + 1).min(frame.height);
    let c0 = candidate.col.saturating_sub(half);
    let c1 = (candidate.col + half + 1).min(frame.width);

    let n_pix = (r1 - r0) * (c1 - c0);
    if n_pix < 9 {
        return Localization::failed(candidate, loc_id, FitStatus::WindowClipped);
    }

    // Window intensities as f64, with pixel coordinates.
    let mut values = Vec::with_capacity(n_pix);
    for row in r0..r1 {
        for col in c0..c1 {
            values.push((row as f64, col as f64, frame.get(row, col) as f64));
        }
    }

    // Initial guess: background from the window minimum, amplitude from the
    // seed pixel, width from a moment estimate clamped to a sane range.
    let seed_y = candidate.row as f64;
    let seed_x = candidate.col as f64;
    let bg0 = values
        .iter()
        .map(|&(_, _, v)| v)
        .fold(f64::INFINITY, f64::min);
    let peak = frame.get(candidate.row, candidate.col) as f64;
    let i0_init = (peak - bg0).max(1e-3);
    let sigma_init = moment_width(&values, seed_y, seed_x, bg0).clamp(0.5, half as f64);

    let mut y = seed_y;
    let mut x = seed_x;
    let mut i0 = i0_init;
    let mut bg = bg0;
    let mut sigma = sigma_init;

    let max_shift = half as f64;
    let mut converged = false;

    for _ in 0..config.max_iterations {
        // Linearize: residual r_i = I_i - model_i, Jacobian of the model
        // with respect to (y, x, i0, bg, sigma).
        let mut jac = DMatrix::<f64>::zeros(n_pix, 5);
        let mut resid = DVector::<f64>::zeros(n_pix);
        let s2 = sigma * sigma;
        for (i, &(row, col, v)) in values.iter().enumerate() {
            let dy = row - y;
            let dx = col - x;
            let r2 = dy * dy + dx * dx;
            let e = (-r2 / (2.0 * s2)).exp();
            let model = bg + i0 * e;
            resid[i] = v - model;
            jac[(i, 0)] = i0 * e * dy / s2;
            jac[(i, 1)] = i0 * e * dx / s2;
            jac[(i, 2)] = e;
            jac[(i, 3)] = 1.0;
            jac[(i, 4)] = i0 * e * r2 / (s2 * sigma);
        }

        let svd = jac.svd(true, true);
        let step = match svd.solve(&resid, 1e-12) {
            Ok(step) => step,
            Err(_) => return Localization::failed(candidate, loc_id, FitStatus::NoConverge),
        };

        // Clamp the position step to one pixel per iteration; large steps
        // on noisy windows otherwise overshoot into neighboring structure.
        let dy = step[0].clamp(-1.0, 1.0);
        let dx = step[1].clamp(-1.0, 1.0);
        y += dy;
        x += dx;
        i0 += step[2];
        bg += step[3];
        sigma = (sigma + step[4]).clamp(0.3, 2.0 * half as f64);

        if !y.is_finite() || !x.is_finite() {
            return Localization::failed(candidate, loc_id, FitStatus::Diverged);
        }
        if (y - seed_y).abs() > max_shift || (x - seed_x).abs() > max_shift {
            return Localization::failed(candidate, loc_id, FitStatus::Diverged);
        }
        if (dy * dy + dx * dx).sqrt() < config.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        return Localization::failed(candidate, loc_id, FitStatus::NoConverge);
    }
    // An amplitude this small means the window held no signal to fit.
    const MIN_AMPLITUDE: f64 = 1e-6;
    if !i0.is_finite() || !bg.is_finite() || i0 < MIN_AMPLITUDE || sigma <= 0.0 {
        return Localization::failed(candidate, loc_id, FitStatus::BadAmplitude);
    }

    let error = position_error(&values, y, x, i0, bg, sigma);

    Localization {
        frame: candidate.frame,
        loc_id,
        y,
        x,
        i0,
        bg: bg.max(0.0),
        sigma,
        error,
        status: FitStatus::Ok,
    }
}

/// Fit all candidates of one frame, in parallel across candidates.
///
/// Results are returned in detection order with localization ids
/// `first_loc_id, first_loc_id + 1, ...`, so the output is deterministic
/// regardless of worker scheduling.
pub fn localize_frame(
    frame: &Frame,
    candidates: &[Candidate],
    config: &LocalizeConfig,
    first_loc_id: u64,
) -> Vec<Localization> {
    use rayon::prelude::*;
    candidates
        .par_iter()
        .enumerate()
        .map(|(i, cand)| localize(frame, cand, config, first_loc_id + i as u64))
        .collect()
}

/// Intensity-weighted RMS radius of the window, used to seed sigma.
fn moment_width(values: &[(f64, f64, f64)], y: f64, x: f64, bg: f64) -> f64 {
    let mut sum_w = 0.0;
    let mut sum_r2 = 0.0;
    for &(row, col, v) in values {
        let w = (v - bg).max(0.0);
        let dy = row - y;
        let dx = col - x;
        sum_w += w;
        sum_r2 += w * (dy * dy + dx * dx);
    }
    if sum_w <= 0.0 {
        return 1.0;
    }
    // RMS radius of a symmetric 2D Gaussian is sigma * sqrt(2).
    (sum_r2 / sum_w / 2.0).sqrt()
}

/// Positional standard error from the linearized least-squares covariance:
/// `s² (JᵀJ)⁻¹` evaluated at the solution, averaged over the two position
/// components. Falls back to 0 for degenerate geometry.
fn position_error(values: &[(f64, f64, f64)], y: f64, x: f64, i0: f64, bg: f64, sigma: f64) -> f64 {
    let n = values.len();
    if n <= 5 {
        return 0.0;
    }
    let mut jtj = nalgebra::Matrix5::<f64>::zeros();
    let mut rss = 0.0;
    let s2 = sigma * sigma;
    for &(row, col, v) in values {
        let dy = row - y;
        let dx = col - x;
        let r2 = dy * dy + dx * dx;
        let e = (-r2 / (2.0 * s2)).exp();
        let resid = v - (bg + i0 * e);
        rss += resid * resid;
        let j = nalgebra::Vector5::new(
            i0 * e * dy / s2,
            i0 * e * dx / s2,
            e,
            1.0,
            i0 * e * r2 / (s2 * sigma),
        );
        jtj += j * j.transpose();
    }
    let variance = rss / (n - 5) as f64;
    match jtj.try_inverse() {
        Some(inv) => {
            let var_pos = 0.5 * (inv[(0, 0)] + inv[(1, 1)]) * variance;
            if var_pos.is_finite() && var_pos > 0.0 {
                var_pos.sqrt()
            } else {
                0.0
            }
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_frame(
        width: usize,
        height: usize,
        bg: f32,
        spots: &[(f64, f64, f64, f64)], // (y, x, amplitude, sigma)
    ) -> Frame {
        let mut pixels = vec![bg; width * height];
        for &(sy, sx, amp, sig) in spots {
            for row in 0..height {
                for col in 0..width {
                    let dy = row as f64 - sy;
                    let dx = col as f64 - sx;
                    let r2 = dy * dy + dx * dx;
                    pixels[row * width + col] +=
                        (amp * (-r2 / (2.0 * sig * sig)).exp()) as f32;
                }
            }
        }
        Frame::new(0, width, height, pixels)
    }

    fn seed(row: usize, col: usize) -> Candidate {
        Candidate {
            frame: 0,
            row,
            col,
            score: 0.0,
        }
    }

    #[test]
    fn test_recovers_subpixel_position() {
        let frame = gaussian_frame(32, 32, 20.0, &[(15.6, 14.3, 500.0, 1.4)]);
        let loc = localize(&frame, &seed(16, 14), &LocalizeConfig::default(), 0);

        assert_eq!(loc.status, FitStatus::Ok);
        assert!((loc.y - 15.6).abs() < 0.05, "y = {}", loc.y);
        assert!((loc.x - 14.3).abs() < 0.05, "x = {}", loc.x);
        assert!((loc.i0 - 500.0).abs() < 25.0, "i0 = {}", loc.i0);
        assert!((loc.bg - 20.0).abs() < 2.0, "bg = {}", loc.bg);
        assert!((loc.sigma - 1.4).abs() < 0.1, "sigma = {}", loc.sigma);
        assert!(loc.error >= 0.0);
    }

    #[test]
    fn test_success_invariants() {
        let frame = gaussian_frame(32, 32, 5.0, &[(10.2, 20.8, 120.0, 1.6)]);
        let config = LocalizeConfig::default();
        let loc = localize(&frame, &seed(10, 21), &config, 7);

        assert_eq!(loc.status, FitStatus::Ok);
        assert_eq!(loc.loc_id, 7);
        assert!(loc.i0 >= 0.0);
        assert!(loc.bg >= 0.0);
        let half = (config.window_size / 2) as f64;
        assert!((loc.y - 10.0).abs() <= half);
        assert!((loc.x - 21.0).abs() <= half);
    }

    #[test]
    fn test_edge_candidate_is_rejected() {
        let frame = gaussian_frame(32, 32, 10.0, &[(0.0, 0.0, 100.0, 1.5)]);
        let loc = localize(&frame, &seed(0, 0), &LocalizeConfig::default(), 0);
        assert_eq!(loc.status, FitStatus::WindowClipped);
    }

    #[test]
    fn test_fit_escaping_to_neighbor_is_rejected() {
        // Seed far from the only real spot: the fit walks toward the bright
        // neighbor and must be rejected once it leaves the window.
        let frame = gaussian_frame(40, 40, 10.0, &[(20.0, 26.0, 800.0, 1.5)]);
        let loc = localize(&frame, &seed(20, 19), &LocalizeConfig::default(), 0);
        assert_ne!(loc.status, FitStatus::Ok);
    }

    #[test]
    fn test_flat_window_does_not_succeed() {
        let frame = Frame::new(0, 32, 32, vec![50.0; 32 * 32]);
        let loc = localize(&frame, &seed(16, 16), &LocalizeConfig::default(), 0);
        assert_ne!(loc.status, FitStatus::Ok);
    }

    #[test]
    fn test_localize_frame_preserves_detection_order() {
        let frame = gaussian_frame(
            64,
            64,
            15.0,
            &[(20.3, 20.7, 400.0, 1.5), (40.6, 45.2, 300.0, 1.5)],
        );
        let candidates = vec![seed(20, 21), seed(41, 45)];
        let locs = localize_frame(&frame, &candidates, &LocalizeConfig::default(), 10);

        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].loc_id, 10);
        assert_eq!(locs[1].loc_id, 11);
        assert!((locs[0].y - 20.3).abs() < 0.1);
        assert!((locs[1].y - 40.6).abs() < 0.1);
    }
}
