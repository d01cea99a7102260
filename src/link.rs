//! Link localizations across frames into trajectories.
//!
//! The linker is a streaming frame-to-frame tracker: for each new frame it
//! assigns the frame's localizations either to an existing active
//! trajectory or to a newly born one, and closes trajectories that have
//! gone unmatched for more than `max_gap` consecutive frames. Frames
//! already resolved are never revisited, so the orchestrator can feed the
//! linker chunk by chunk and carry the [`LinkState`] across chunk
//! boundaries unchanged.
//!
//! Per-frame algorithm:
//! 1. Build a cost matrix between active trajectories and the frame's
//!    localizations: squared Euclidean distance from each trajectory's
//!    predicted position, with entries beyond the gating radius forbidden.
//! 2. Solve the minimum-cost assignment over feasible edges (optimal
//!    bipartite matching, never greedy nearest-neighbor). Ties between
//!    equal-cost optima resolve to the lowest trajectory id, then the
//!    lowest localization id.
//! 3. Matched pairs extend their trajectory and reset its gap counter;
//!    unmatched localizations are born as new trajectories; unmatched
//!    trajectories increment their gap counter and close once it exceeds
//!    `max_gap`.
//!
//! A localization with a failed fit status must not be offered to the
//! linker; the orchestrator filters those out.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::subpixel::Localization;

/// Configuration for trajectory linking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Gating radius: maximum distance in pixels between a trajectory's
    /// predicted position and a localization for a feasible link.
    /// Default: 5.0
    pub max_distance: f64,
    /// Maximum number of consecutive frames a trajectory may go unmatched
    /// before it closes. 0 closes on the first miss. Default: 2
    pub max_gap: usize,
    /// Fractional growth of the gating radius per missed frame, so a
    /// blinking particle is searched for in a wider window:
    /// `radius = max_distance * (1 + gap * search_radius_growth)`.
    /// Default: 0.0 (constant radius)
    #[serde(default)]
    pub search_radius_growth: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_distance: 5.0,
            max_gap: 2,
            search_radius_growth: 0.0,
        }
    }
}

/// A trajectory still eligible for extension by future frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveTrajectory {
    /// Trajectory identifier, assigned at birth, never reused.
    pub id: u64,
    /// Row position of the most recent member localization.
    pub last_y: f64,
    /// Column position of the most recent member localization.
    pub last_x: f64,
    /// Frame index of the most recent member localization.
    pub last_frame: usize,
    /// Consecutive frames without a match since the last member.
    pub gap: usize,
}

impl ActiveTrajectory {
    /// Predicted position for the next frame: the last observed position.
    fn predicted(&self) -> (f64, f64) {
        (self.last_y, self.last_x)
    }

    /// Gating radius for this trajectory, widened while it is gapped.
    fn gating_radius(&self, config: &LinkConfig) -> f64 {
        config.max_distance * (1.0 + self.gap as f64 * config.search_radius_growth)
    }
}

/// Linker working state: the active-trajectory set and the id counter.
///
/// Owned by the orchestrator and passed into each frame's linking call;
/// carrying it across chunk boundaries unmodified makes chunking invisible
/// in the output.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    // Kept in ascending id order; link_frame relies on this for its
    // deterministic tie-break.
    active: Vec<ActiveTrajectory>,
    next_id: u64,
}

impl LinkState {
    /// Fresh state with no active trajectories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently active trajectories, in ascending id order.
    pub fn active(&self) -> &[ActiveTrajectory] {
        &self.active
    }

    /// Ids issued so far (also the id the next birth will receive).
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Close every remaining active trajectory (end of data). Returns the
    /// closed ids.
    pub fn finish(&mut self) -> Vec<u64> {
        let closed = self.active.iter().map(|t| t.id).collect();
        self.active.clear();
        closed
    }
}

/// What happened when one frame was linked.
#[derive(Debug, Clone, Default)]
pub struct FrameLinkResult {
    /// Trajectory id assigned to each input localization, in input order.
    pub assigned: Vec<u64>,
    /// Ids of trajectories born this frame.
    pub born: Vec<u64>,
    /// Ids of trajectories closed this frame (gap exceeded).
    pub closed: Vec<u64>,
}

/// Cost marking an infeasible edge. Large enough that no optimal matching
/// ever uses one (a feasible alternative always exists), small enough that
/// dual-potential arithmetic stays finite.
const FORBIDDEN: f64 = 1e18;

/// Link one frame's localizations into the trajectory set.
///
/// `locs` must contain only successful fits, in ascending localization-id
/// order. Frames must be presented in strictly increasing index order; a
/// frame with zero localizations still counts against every active
/// trajectory's gap.
pub fn link_frame(
    state: &mut LinkState,
    frame: usize,
    locs: &[Localization],
    config: &LinkConfig,
) -> FrameLinkResult {
    debug_assert!(locs.iter().all(|l| l.status.is_ok()));

    let n_tracks = state.active.len();
    let n_locs = locs.len();
    let mut result = FrameLinkResult {
        assigned: vec![u64::MAX; n_locs],
        ..Default::default()
    };

    // Which localization (if any) extends each active trajectory.
    let mut track_match: Vec<Option<usize>> = vec![None; n_tracks];

    if n_tracks > 0 && n_locs > 0 {
        // Square assignment problem of size n_tracks + n_locs:
        // columns 0..n_locs are localizations, the rest are "stay
        // unmatched" slots (one per trajectory); rows 0..n_tracks are
        // trajectories, the rest are "new trajectory" rows (one per
        // localization). Gated link costs sit in the top-left block; the
        // unmatched/birth alternatives are priced at their gating radius
        // squared so a feasible link always beats leaving both sides
        // unmatched.
        let n = n_tracks + n_locs;
        let mut cost = vec![vec![FORBIDDEN; n]; n];

        for (t, track) in state.active.iter().enumerate() {
            let (py, px) = track.predicted();
            let radius = track.gating_radius(config);
            let radius_sq = radius * radius;
            for (l, loc) in locs.iter().enumerate() {
                let dy = loc.y - py;
                let dx = loc.x - px;
                let d_sq = dy * dy + dx * dx;
                if d_sq <= radius_sq {
                    cost[t][l] = d_sq;
                }
            }
            cost[t][n_locs + t] = radius_sq;
        }
        let birth_cost = config.max_distance * config.max_distance;
        for l in 0..n_locs {
            cost[n_tracks + l][l] = birth_cost;
            for slot in n_locs..n {
                cost[n_tracks + l][slot] = 0.0;
            }
        }

        let row_to_col = minimum_cost_assignment(&cost);
        for (t, tm) in track_match.iter_mut().enumerate() {
            let col = row_to_col[t];
            if col < n_locs {
                *tm = Some(col);
            }
        }
    }

    // Extend matched trajectories, age the rest.
    let mut closed_ids = Vec::new();
    let mut survivors = Vec::with_capacity(n_tracks + n_locs);
    for (t, track) in state.active.iter().enumerate() {
        let mut track = *track;
        match track_match[t] {
            Some(l) => {
                let loc = &locs[l];
                track.last_y = loc.y;
                track.last_x = loc.x;
                track.last_frame = frame;
                track.gap = 0;
                result.assigned[l] = track.id;
                survivors.push(track);
            }
            None => {
                track.gap += 1;
                if track.gap > config.max_gap {
                    closed_ids.push(track.id);
                } else {
                    survivors.push(track);
                }
            }
        }
    }

    // Unmatched localizations spawn new trajectories, in loc-id order so
    // trajectory ids stay monotone in birth order.
    for (l, loc) in locs.iter().enumerate() {
        if result.assigned[l] == u64::MAX {
            let id = state.next_id;
            state.next_id += 1;
            survivors.push(ActiveTrajectory {
                id,
                last_y: loc.y,
                last_x: loc.x,
                last_frame: frame,
                gap: 0,
            });
            result.assigned[l] = id;
            result.born.push(id);
        }
    }

    state.active = survivors;
    result.closed = closed_ids;

    debug!(
        frame,
        locs = n_locs,
        active = state.active.len(),
        born = result.born.len(),
        closed = result.closed.len(),
        "linked frame"
    );
    result
}

/// Minimum-cost assignment on a square cost matrix (Hungarian algorithm
/// with dual potentials and shortest augmenting paths, O(n³)).
///
/// Returns `row → column`. Deterministic: when several optima share the
/// same total cost, rows are settled in ascending index order and equal
/// reduced costs resolve to the lowest column index, which yields the
/// lowest-trajectory-id / lowest-localization-id tie-break documented in
/// [`link_frame`].
fn minimum_cost_assignment(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    // 1-indexed internals with a virtual row/column 0.
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    let mut col_to_row = vec![0_usize; n + 1];
    let mut way = vec![0_usize; n + 1];

    for row in 1..=n {
        col_to_row[0] = row;
        let mut j0 = 0_usize;
        let mut min_reduced = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = col_to_row[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0_usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let reduced = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < min_reduced[j] {
                    min_reduced[j] = reduced;
                    way[j] = j0;
                }
                if min_reduced[j] < delta {
                    delta = min_reduced[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[col_to_row[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_reduced[j] -= delta;
                }
            }
            j0 = j1;
            if col_to_row[j0] == 0 {
                break;
            }
        }

        // Augment along the found path.
        loop {
            let j1 = way[j0];
            col_to_row[j0] = col_to_row[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![0_usize; n];
    for j in 1..=n {
        if col_to_row[j] > 0 {
            row_to_col[col_to_row[j] - 1] = j - 1;
        }
    }
    row_to_col
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subpixel::FitStatus;

    fn loc(frame: usize, loc_id: u64, y: f64, x: f64) -> Localization {
        Localization {
            frame,
            loc_id,
            y,
            x,
            i0: 100.0,
            bg: 10.0,
            sigma: 1.5,
            error: 0.05,
            status: FitStatus::Ok,
        }
    }

    fn config(max_distance: f64, max_gap: usize) -> LinkConfig {
        LinkConfig {
            max_distance,
            max_gap,
            search_radius_growth: 0.0,
        }
    }

    #[test]
    fn test_assignment_beats_greedy() {
        // Greedy would take (0,0) at cost 1 and be forced into (1,1) at
        // cost 10; the optimum is the cross pairing.
        let cost = vec![vec![1.0, 2.0], vec![1.5, 10.0]];
        assert_eq!(minimum_cost_assignment(&cost), vec![1, 0]);
    }

    #[test]
    fn test_assignment_deterministic_tie() {
        // Two equal optima; the lowest row must claim the lowest column.
        let cost = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        assert_eq!(minimum_cost_assignment(&cost), vec![0, 1]);
    }

    #[test]
    fn test_gap_at_limit_survives_one_more_miss_closes() {
        // Three trajectories born at frame 0; frame 1 matches two of
        // them. With max_gap = 1 the missed one stays active at gap 1;
        // a second miss closes it.
        let cfg = config(2.0, 1);
        let mut state = LinkState::new();

        let frame0 = vec![
            loc(0, 0, 10.0, 10.0),
            loc(0, 1, 20.0, 20.0),
            loc(0, 2, 30.0, 30.0),
        ];
        let r0 = link_frame(&mut state, 0, &frame0, &cfg);
        assert_eq!(r0.born, vec![0, 1, 2]);

        let frame1 = vec![loc(1, 3, 10.5, 10.2), loc(1, 4, 29.5, 30.1)];
        let r1 = link_frame(&mut state, 1, &frame1, &cfg);
        assert_eq!(r1.assigned, vec![0, 2]);
        assert!(r1.born.is_empty());
        assert!(r1.closed.is_empty(), "gap at limit must not close yet");
        let gapped = state.active().iter().find(|t| t.id == 1).unwrap();
        assert_eq!(gapped.gap, 1);

        // Second consecutive miss exceeds max_gap = 1.
        let r2 = link_frame(&mut state, 2, &[], &cfg);
        assert_eq!(r2.closed, vec![1]);
        assert_eq!(state.active().len(), 2);
    }

    #[test]
    fn test_max_gap_zero_closes_immediately() {
        let cfg = config(2.0, 0);
        let mut state = LinkState::new();
        let frame0 = vec![
            loc(0, 0, 10.0, 10.0),
            loc(0, 1, 20.0, 20.0),
            loc(0, 2, 30.0, 30.0),
        ];
        link_frame(&mut state, 0, &frame0, &cfg);

        let frame1 = vec![loc(1, 3, 10.5, 10.2), loc(1, 4, 29.5, 30.1)];
        let r1 = link_frame(&mut state, 1, &frame1, &cfg);
        assert_eq!(r1.closed, vec![1]);
        assert_eq!(state.active().len(), 2);
    }

    #[test]
    fn test_cost_tie_resolves_to_lowest_loc_id() {
        // One trajectory, two localizations exactly equidistant and both
        // inside the gate: the trajectory takes the lower localization id,
        // the other spawns a new trajectory.
        let cfg = config(5.0, 2);
        let mut state = LinkState::new();
        link_frame(&mut state, 0, &[loc(0, 0, 50.0, 50.0)], &cfg);

        let frame1 = vec![loc(1, 1, 50.0, 53.0), loc(1, 2, 50.0, 47.0)];
        let r1 = link_frame(&mut state, 1, &frame1, &cfg);
        assert_eq!(r1.assigned[0], 0, "tie must go to the lower loc id");
        assert_eq!(r1.assigned[1], 1, "the other localization is born");
        assert_eq!(r1.born, vec![1]);
    }

    #[test]
    fn test_matching_is_one_to_one_and_gated() {
        let cfg = config(3.0, 1);
        let mut state = LinkState::new();
        let frame0: Vec<Localization> = (0..5)
            .map(|i| loc(0, i, 10.0 * i as f64, 10.0 * i as f64))
            .collect();
        link_frame(&mut state, 0, &frame0, &cfg);
        let before: Vec<ActiveTrajectory> = state.active().to_vec();

        let frame1: Vec<Localization> = (0..4)
            .map(|i| loc(1, 5 + i, 10.0 * i as f64 + 1.0, 10.0 * i as f64 - 0.5))
            .collect();
        let r1 = link_frame(&mut state, 1, &frame1, &cfg);

        // One-to-one: no trajectory id repeats among assignments.
        let mut ids = r1.assigned.clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), r1.assigned.len());

        // Every matched pair is within the gating radius.
        for (l, &id) in r1.assigned.iter().enumerate() {
            if let Some(track) = before.iter().find(|t| t.id == id) {
                let dy = frame1[l].y - track.last_y;
                let dx = frame1[l].x - track.last_x;
                assert!(dy * dy + dx * dx <= cfg.max_distance * cfg.max_distance);
            }
        }
    }

    #[test]
    fn test_ids_monotone_and_never_reused() {
        let cfg = config(1.0, 0);
        let mut state = LinkState::new();
        let mut seen = Vec::new();
        // Every frame's spots are far from the previous frame's, so every
        // frame births fresh trajectories and closes the old ones.
        for f in 0..5 {
            let locs = vec![
                loc(f, 0, 100.0 * f as f64, 0.0),
                loc(f, 1, 100.0 * f as f64, 50.0),
            ];
            let r = link_frame(&mut state, f, &locs, &cfg);
            seen.extend(r.born);
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted, "birth ids must be strictly increasing");
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_search_radius_growth_recovers_blinker() {
        // Particle at distance 7 after a 1-frame blink: base radius 5 is
        // too small, but with growth 0.5 the gapped radius is 7.5.
        let cfg = LinkConfig {
            max_distance: 5.0,
            max_gap: 2,
            search_radius_growth: 0.5,
        };
        let mut state = LinkState::new();
        link_frame(&mut state, 0, &[loc(0, 0, 50.0, 50.0)], &cfg);
        link_frame(&mut state, 1, &[], &cfg);

        let r2 = link_frame(&mut state, 2, &[loc(2, 1, 50.0, 57.0)], &cfg);
        assert_eq!(r2.assigned, vec![0], "widened gate must reconnect");
        assert!(r2.born.is_empty());
    }

    #[test]
    fn test_finish_closes_all() {
        let cfg = config(2.0, 5);
        let mut state = LinkState::new();
        link_frame(
            &mut state,
            0,
            &[loc(0, 0, 1.0, 1.0), loc(0, 1, 9.0, 9.0)],
            &cfg,
        );
        let closed = state.finish();
        assert_eq!(closed, vec![0, 1]);
        assert!(state.active().is_empty());
    }
}
