//! # spottrack
//!
//! A **single-particle tracking pipeline** for time-lapse fluorescence
//! microscopy, written in Rust.
//!
//! Given a movie of diffraction-limited emitters, `spottrack` detects
//! candidate spots in each frame, refines them to sub-pixel positions with
//! an isotropic Gaussian fit, links the localizations across frames into
//! trajectories with gap closing, and writes the result as a CSV table —
//! one row per localization, trajectory membership in the last column.
//!
//! ## Features
//!
//! - **Spot detection** — intensity thresholding with non-maximum
//!   suppression, raw or after a difference-of-Gaussians band-pass
//! - **Sub-pixel localization** — iterative Gaussian least-squares fit with
//!   per-spot precision estimates and explicit failure codes
//! - **Trajectory linking** — optimal frame-to-frame assignment (never
//!   greedy nearest-neighbor) with gap closing for blinking emitters
//! - **Bounded memory** — movies stream through in fixed-size chunks;
//!   chunking never changes the output
//! - **Relinking** — re-run only the linking stage on a saved table to tune
//!   parameters without re-fitting pixel data
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use spottrack::{track_file, TrackingConfig};
//!
//! let config = TrackingConfig {
//!     chunk_size: 200,
//!     ..Default::default()
//! };
//!
//! // Writes movie01_tracks.csv next to the input.
//! let out = track_file(Path::new("data/movie01.tif"), &config).unwrap();
//! println!("trajectories written to {}", out.display());
//! ```
//!
//! ## Pipeline overview
//!
//! 1. **Detection** — threshold each frame in units of background noise,
//!    keep local maxima, suppress candidates closer than a minimum
//!    separation
//! 2. **Localization** — fit a 2D isotropic Gaussian plus constant
//!    background in a window around each candidate; report position,
//!    amplitude, background, width, and an estimated precision
//! 3. **Linking** — per frame, solve a minimum-cost assignment between
//!    active trajectories and new localizations, gated by a search radius;
//!    trajectories survive short disappearances up to a configurable gap
//! 4. **Output** — accumulate a table of every localization attempt and
//!    save it as CSV, grouped by trajectory or by frame

pub mod detect;
pub mod frame;
pub mod link;
pub mod pipeline;
pub mod subpixel;
pub mod table;

pub use detect::{detect, Candidate, DetectConfig, DetectMethod};
#[cfg(feature = "image")]
pub use frame::ImageSequenceSource;
pub use frame::{iterate_chunks, CropRegion, Frame, FrameSource, MemorySource, SourceOptions};
pub use link::{link_frame, ActiveTrajectory, FrameLinkResult, LinkConfig, LinkState};
#[cfg(feature = "image")]
pub use pipeline::{localize_file, track_directory, track_file};
pub use pipeline::{
    localize_source, locs_path, retrack_file, retrack_files, retrack_table, track_source,
    tracks_path, FileOutcome, TrackingConfig, DEFAULT_CHUNK_SIZE,
};
pub use subpixel::{localize, localize_frame, FitStatus, Localization, LocalizeConfig};
pub use table::{LocRow, LocalizationTable, RowOrder};
