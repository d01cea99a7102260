//! Pipeline orchestration: detect, localize, and link whole movies.
//!
//! The orchestrator walks a [`FrameSource`] in bounded-memory chunks,
//! runs detection and sub-pixel localization on each frame, feeds the
//! results to the streaming linker, and accumulates one
//! [`LocalizationTable`] for the movie. Chunking never changes the
//! output: the linker state is carried across chunk boundaries, so the
//! table for a movie is byte-identical for any chunk size.
//!
//! File-level entry points ([`track_file`], [`localize_file`],
//! [`track_directory`]) wrap the source-level drivers with image decoding
//! and CSV output next to the input. [`retrack_table`] and
//! [`retrack_file`] re-run only the linking stage on an existing table,
//! so linking parameters can be tuned without re-fitting the pixel data.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detect::{detect, DetectConfig};
use crate::frame::{iterate_chunks, FrameSource, SourceOptions};
use crate::link::{link_frame, LinkConfig, LinkState};
use crate::subpixel::{localize_frame, Localization, LocalizeConfig};
use crate::table::{LocalizationTable, RowOrder};

/// Default number of frames held in memory at once.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Full parameter set for a tracking run.
///
/// Serializes to and from TOML, so a run's parameters can live next to
/// its data. Scalar fields precede the per-stage tables for TOML's
/// value-before-table rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Frames per processing chunk. Memory management only; has no
    /// effect on the output.
    pub chunk_size: usize,
    /// Row ordering of saved trajectory tables.
    pub row_order: RowOrder,
    /// Frame range and crop options.
    pub source: SourceOptions,
    /// Spot detection parameters.
    pub detect: DetectConfig,
    /// Sub-pixel fit parameters.
    pub localize: LocalizeConfig,
    /// Trajectory linking parameters.
    pub link: LinkConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            row_order: RowOrder::default(),
            source: SourceOptions::default(),
            detect: DetectConfig::default(),
            localize: LocalizeConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

impl TrackingConfig {
    /// Load a configuration from a TOML file. Missing fields take their
    /// defaults, so a file may specify only what it changes.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Save the configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }
}

// ── Source-level drivers ─────────────────────────────────────────────────────

/// Detect and localize every frame of a source, without linking.
///
/// Rows come out in frame order, localization order within each frame,
/// with the trajectory column empty.
pub fn localize_source<S: FrameSource + ?Sized>(
    source: &S,
    config: &TrackingConfig,
) -> Result<LocalizationTable> {
    let mut table = LocalizationTable::new();
    let mut next_loc_id: u64 = 0;

    for chunk in iterate_chunks(source, config.chunk_size, &config.source) {
        for frame in chunk? {
            let candidates = detect(&frame, &config.detect);
            let locs = localize_frame(&frame, &candidates, &config.localize, next_loc_id);
            next_loc_id += locs.len() as u64;
            for loc in &locs {
                table.push(loc);
            }
            debug!(frame = frame.index, spots = locs.len(), "localized frame");
        }
    }

    info!(rows = table.len(), "localization finished");
    Ok(table)
}

/// Run the full pipeline on a source: detect, localize, and link.
///
/// The linker sees every frame in the configured range, including frames
/// with no detections, so gap counting matches the movie's timeline.
/// Failed fits are recorded with an empty trajectory column and never
/// offered to the linker. The returned table is sorted per
/// `config.row_order`.
pub fn track_source<S: FrameSource + ?Sized>(
    source: &S,
    config: &TrackingConfig,
) -> Result<LocalizationTable> {
    let mut table = LocalizationTable::new();
    let mut state = LinkState::new();
    let mut next_loc_id: u64 = 0;

    for chunk in iterate_chunks(source, config.chunk_size, &config.source) {
        for frame in chunk? {
            let candidates = detect(&frame, &config.detect);
            let locs = localize_frame(&frame, &candidates, &config.localize, next_loc_id);
            next_loc_id += locs.len() as u64;

            let linkable: Vec<Localization> =
                locs.iter().filter(|l| l.status.is_ok()).cloned().collect();
            let result = link_frame(&mut state, frame.index, &linkable, &config.link);

            let mut k = 0;
            for loc in &locs {
                if loc.status.is_ok() {
                    table.push_linked(loc, Some(result.assigned[k]));
                    k += 1;
                } else {
                    table.push_linked(loc, None);
                }
            }
            debug!(
                frame = frame.index,
                spots = locs.len(),
                active = state.active().len(),
                "tracked frame"
            );
        }
    }

    state.finish();
    table.sort(config.row_order);
    info!(
        rows = table.len(),
        trajectories = state.next_id(),
        "tracking finished"
    );
    Ok(table)
}

/// Re-run linking on an existing table with new parameters, discarding
/// any previous trajectory assignments. Detection and fitting results are
/// untouched.
///
/// Every frame index between the table's first and last frame is
/// presented to the linker, so frames that happened to have no
/// localizations still count against gap limits, exactly as in
/// [`track_source`].
pub fn retrack_table(table: &mut LocalizationTable, link: &LinkConfig) {
    for row in table.rows_mut() {
        row.trajectory = None;
    }
    let Some((first, last)) = table.frame_range() else {
        return;
    };

    let mut by_frame: Vec<Vec<usize>> = vec![Vec::new(); last - first + 1];
    for (i, row) in table.rows().iter().enumerate() {
        by_frame[row.frame - first].push(i);
    }

    let mut state = LinkState::new();
    for (offset, slots) in by_frame.iter().enumerate() {
        let frame = first + offset;
        let linkable: Vec<usize> = slots
            .iter()
            .copied()
            .filter(|&i| table.rows()[i].is_linkable())
            .collect();
        let locs: Vec<Localization> = linkable
            .iter()
            .enumerate()
            .map(|(k, &i)| table.rows()[i].to_localization(k as u64))
            .collect();
        let result = link_frame(&mut state, frame, &locs, link);
        for (k, &i) in linkable.iter().enumerate() {
            table.rows_mut()[i].trajectory = Some(result.assigned[k]);
        }
    }
    state.finish();
    info!(
        rows = table.len(),
        trajectories = state.next_id(),
        "relinking finished"
    );
}

// ── File-level entry points ──────────────────────────────────────────────────

/// Output path for a table derived from `input`: a sibling file named
/// `<stem><suffix>`.
fn output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}{suffix}"))
}

/// Path where [`track_file`] writes its trajectory table.
pub fn tracks_path(input: &Path) -> PathBuf {
    output_path(input, "_tracks.csv")
}

/// Path where [`localize_file`] writes its localization table.
pub fn locs_path(input: &Path) -> PathBuf {
    output_path(input, "_locs.csv")
}

/// Re-link an existing table file in place with new parameters.
pub fn retrack_file(path: &Path, link: &LinkConfig, order: RowOrder) -> Result<()> {
    let mut table = LocalizationTable::load_csv(path)?;
    retrack_table(&mut table, link);
    table.sort(order);
    table.save_csv(path)?;
    info!(path = %path.display(), "retracked");
    Ok(())
}

/// Outcome of processing one input in a batch.
#[derive(Debug)]
pub struct FileOutcome {
    /// The input that was processed.
    pub input: PathBuf,
    /// Output path on success, the error otherwise.
    pub result: Result<PathBuf>,
}

/// Re-link several table files in parallel. Each file is independent, so
/// one failure does not stop the batch.
pub fn retrack_files(paths: &[PathBuf], link: &LinkConfig, order: RowOrder) -> Vec<FileOutcome> {
    use rayon::prelude::*;
    let outcomes: Vec<FileOutcome> = paths
        .par_iter()
        .map(|path| FileOutcome {
            input: path.clone(),
            result: retrack_file(path, link, order).map(|()| path.clone()),
        })
        .collect();
    warn_failures(&outcomes);
    outcomes
}

fn warn_failures(outcomes: &[FileOutcome]) {
    for outcome in outcomes {
        if let Err(e) = &outcome.result {
            tracing::warn!(input = %outcome.input.display(), error = %e, "batch item failed");
        }
    }
}

// ── Image-file entry points (feature `image`) ────────────────────────────────

#[cfg(feature = "image")]
mod file_api {
    use super::*;
    use crate::frame::ImageSequenceSource;
    use rayon::prelude::*;

    /// Detect and localize one movie, writing `<stem>_locs.csv` next to
    /// the input. The movie may be a single image file or a directory of
    /// per-frame images. Returns the output path.
    pub fn localize_file(path: &Path, config: &TrackingConfig) -> Result<PathBuf> {
        let source = ImageSequenceSource::open(path)?;
        let table = localize_source(&source, config)?;
        let out = locs_path(path);
        table.save_csv(&out)?;
        info!(input = %path.display(), output = %out.display(), "localized");
        Ok(out)
    }

    /// Run the full pipeline on one movie, writing `<stem>_tracks.csv`
    /// next to the input. Returns the output path.
    pub fn track_file(path: &Path, config: &TrackingConfig) -> Result<PathBuf> {
        let source = ImageSequenceSource::open(path)?;
        let table = track_source(&source, config)?;
        let out = tracks_path(path);
        table.save_csv(&out)?;
        info!(input = %path.display(), output = %out.display(), "tracked");
        Ok(out)
    }

    /// Track every movie in a directory, in parallel.
    ///
    /// A movie entry is anything [`ImageSequenceSource::open`] accepts: an
    /// image file, or a subdirectory containing per-frame image files.
    /// Entries are processed in name order; one movie's failure does not
    /// stop the others.
    pub fn track_directory(dir: &Path, config: &TrackingConfig) -> Result<Vec<FileOutcome>> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| ImageSequenceSource::is_movie_path(p))
            .collect();
        entries.sort();
        if entries.is_empty() {
            tracing::warn!(dir = %dir.display(), "no movies found");
        }

        let outcomes: Vec<FileOutcome> = entries
            .par_iter()
            .map(|path| FileOutcome {
                input: path.clone(),
                result: track_file(path, config),
            })
            .collect();
        warn_failures(&outcomes);
        Ok(outcomes)
    }
}

#[cfg(feature = "image")]
pub use file_api::{localize_file, track_directory, track_file};
