//! Tabular localization store with CSV persistence.
//!
//! A [`LocalizationTable`] holds one row per localization attempt,
//! including failed fits (those carry a nonzero status code and an empty
//! trajectory column so downstream filtering can see what was attempted).
//! Tables round-trip through CSV: the file a tracking run writes can be
//! loaded back and re-linked with different parameters without touching
//! the pixel data again.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::subpixel::{FitStatus, Localization};

/// One output row. Serialized field order defines the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocRow {
    /// Frame index the localization came from.
    pub frame: usize,
    /// Sub-pixel row position.
    pub y: f64,
    /// Sub-pixel column position.
    pub x: f64,
    /// Fitted amplitude above background.
    #[serde(rename = "I0")]
    pub i0: f64,
    /// Fitted local background level.
    pub bg: f64,
    /// Fitted spot width.
    pub sigma: f64,
    /// Estimated localization precision in pixels.
    pub error: f64,
    /// Fit status code (0 = success).
    pub status: u8,
    /// Trajectory id, empty for unlinked or failed rows.
    pub trajectory: Option<u64>,
}

impl LocRow {
    /// Build a row from a localization, initially unlinked.
    pub fn from_localization(loc: &Localization) -> Self {
        Self {
            frame: loc.frame,
            y: loc.y,
            x: loc.x,
            i0: loc.i0,
            bg: loc.bg,
            sigma: loc.sigma,
            error: loc.error,
            status: loc.status.code(),
            trajectory: None,
        }
    }

    /// Whether this row is a successful fit and thus eligible for linking.
    pub fn is_linkable(&self) -> bool {
        self.status == FitStatus::Ok.code()
    }

    /// Reconstruct the localization this row was written from. `loc_id`
    /// is positional and not stored in the file, so the caller supplies it.
    pub fn to_localization(&self, loc_id: u64) -> Localization {
        Localization {
            frame: self.frame,
            loc_id,
            y: self.y,
            x: self.x,
            i0: self.i0,
            bg: self.bg,
            sigma: self.sigma,
            error: self.error,
            status: FitStatus::from_code(self.status),
        }
    }
}

/// Row ordering for saved tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOrder {
    /// Rows grouped by trajectory id, frames ascending within each group,
    /// with unlinked rows after all trajectories in frame order.
    #[default]
    TrajectoryMajor,
    /// Rows in frame order, localization order within each frame.
    FrameMajor,
}

/// In-memory localization table. Rows are held in insertion order, which
/// for freshly produced tables is frame-major.
#[derive(Debug, Clone, Default)]
pub struct LocalizationTable {
    rows: Vec<LocRow>,
}

impl LocalizationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[LocRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [LocRow] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a localization as an unlinked row.
    pub fn push(&mut self, loc: &Localization) {
        self.rows.push(LocRow::from_localization(loc));
    }

    /// Append a localization with its trajectory assignment.
    pub fn push_linked(&mut self, loc: &Localization, trajectory: Option<u64>) {
        let mut row = LocRow::from_localization(loc);
        row.trajectory = trajectory;
        self.rows.push(row);
    }

    /// Frame index range `(min, max)` covered by the table, or `None` when
    /// the table is empty.
    pub fn frame_range(&self) -> Option<(usize, usize)> {
        let first = self.rows.first()?.frame;
        Some(self.rows.iter().fold((first, first), |(lo, hi), r| {
            (lo.min(r.frame), hi.max(r.frame))
        }))
    }

    /// Distinct trajectory ids with their member row indices, ascending by
    /// trajectory id; frames ascend within each group for frame-major
    /// input. Failed and unlinked rows are not represented.
    pub fn trajectories(&self) -> Vec<(u64, Vec<usize>)> {
        let mut groups: Vec<(u64, Vec<usize>)> = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(id) = row.trajectory {
                match groups.binary_search_by_key(&id, |(gid, _)| *gid) {
                    Ok(pos) => groups[pos].1.push(i),
                    Err(pos) => groups.insert(pos, (id, vec![i])),
                }
            }
        }
        groups
    }

    /// Reorder rows in place. Both orderings are total, so a given table
    /// and ordering always produce the same byte-identical CSV.
    pub fn sort(&mut self, order: RowOrder) {
        match order {
            RowOrder::FrameMajor => {
                self.rows.sort_by(|a, b| {
                    a.frame
                        .cmp(&b.frame)
                        .then(cmp_f64(a.y, b.y))
                        .then(cmp_f64(a.x, b.x))
                });
            }
            RowOrder::TrajectoryMajor => {
                // Linked rows by (trajectory, frame); unlinked rows last,
                // in frame order. Option<u64>'s None sorts first, so map
                // it to a key that sorts after every real id.
                self.rows.sort_by(|a, b| {
                    let ka = a.trajectory.map_or(u64::MAX, |t| t);
                    let kb = b.trajectory.map_or(u64::MAX, |t| t);
                    ka.cmp(&kb)
                        .then(a.frame.cmp(&b.frame))
                        .then(cmp_f64(a.y, b.y))
                        .then(cmp_f64(a.x, b.x))
                });
            }
        }
    }

    /// Write the table as CSV with a header row.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for row in &self.rows {
            writer
                .serialize(row)
                .with_context(|| format!("Failed to write row to {}", path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush {}", path.display()))?;
        debug!(rows = self.rows.len(), path = %path.display(), "saved table");
        Ok(())
    }

    /// Read a table previously written by [`save_csv`](Self::save_csv).
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: LocRow =
                record.with_context(|| format!("Malformed row in {}", path.display()))?;
            rows.push(row);
        }
        debug!(rows = rows.len(), path = %path.display(), "loaded table");
        Ok(Self { rows })
    }
}

// f64 comparison for sort keys; positions from the fitter are finite.
fn cmp_f64(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(frame: usize, loc_id: u64, y: f64, x: f64, status: FitStatus) -> Localization {
        Localization {
            frame,
            loc_id,
            y,
            x,
            i0: 250.0,
            bg: 12.5,
            sigma: 1.4,
            error: 0.03,
            status,
        }
    }

    fn sample_table() -> LocalizationTable {
        let mut table = LocalizationTable::new();
        table.push_linked(&loc(0, 0, 10.0, 10.0, FitStatus::Ok), Some(0));
        table.push_linked(&loc(0, 1, 20.0, 20.0, FitStatus::Ok), Some(1));
        table.push_linked(&loc(0, 2, 30.0, 30.0, FitStatus::NoConverge), None);
        table.push_linked(&loc(1, 3, 10.4, 10.1, FitStatus::Ok), Some(0));
        table.push_linked(&loc(1, 4, 20.2, 19.8, FitStatus::Ok), Some(1));
        table
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locs.csv");

        let table = sample_table();
        table.save_csv(&path).unwrap();
        let loaded = LocalizationTable::load_csv(&path).unwrap();

        assert_eq!(loaded.rows(), table.rows());
        assert_eq!(loaded.rows()[2].trajectory, None);
        assert_eq!(loaded.rows()[2].status, FitStatus::NoConverge.code());
    }

    #[test]
    fn test_header_names_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locs.csv");
        sample_table().save_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, "frame,y,x,I0,bg,sigma,error,status,trajectory");
    }

    #[test]
    fn test_trajectory_major_sort() {
        let mut table = sample_table();
        table.sort(RowOrder::TrajectoryMajor);

        let keys: Vec<(Option<u64>, usize)> = table
            .rows()
            .iter()
            .map(|r| (r.trajectory, r.frame))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Some(0), 0),
                (Some(0), 1),
                (Some(1), 0),
                (Some(1), 1),
                (None, 0),
            ]
        );
    }

    #[test]
    fn test_frame_major_sort() {
        let mut table = sample_table();
        table.sort(RowOrder::TrajectoryMajor);
        table.sort(RowOrder::FrameMajor);

        let frames: Vec<usize> = table.rows().iter().map(|r| r.frame).collect();
        assert_eq!(frames, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_trajectories_grouping_skips_failed_rows() {
        let table = sample_table();
        let groups = table.trajectories();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, 0);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, 1);
        // Failed row (index 2) appears in no group.
        assert!(groups.iter().all(|(_, rows)| !rows.contains(&2)));
    }

    #[test]
    fn test_frame_range() {
        assert_eq!(sample_table().frame_range(), Some((0, 1)));
        assert_eq!(LocalizationTable::new().frame_range(), None);
    }
}
