//! Short horizon obstacle map.
//!
//! World frame occupancy cells built from range scans. Confidence rises with
//! each scan that hits a cell and decays exponentially while it is not seen,
//! so obstacles that moved away fade out and memory stays bounded.

use crate::geometry::Pose2D;
use crate::range_sensor::RangeScan;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ObstacleMapConfig {
    /// cell edge length in meters
    pub resolution: f32,
    /// confidence added per scan that hits a cell
    pub hit_increment: f32,
    /// seconds for an unobserved cell to lose half its confidence
    pub half_life: f32,
    /// cells at or above this confidence count as occupied
    pub query_threshold: f32,
    /// cells below this confidence are forgotten
    pub eviction_threshold: f32,
    /// cells farther than this from the robot are forgotten
    pub horizon: f32,
    pub max_cells: usize,
}

impl Default for ObstacleMapConfig {
    fn default() -> Self {
        ObstacleMapConfig {
            resolution: 0.05,
            hit_increment: 0.6,
            half_life: 1.0,
            query_threshold: 0.5,
            eviction_threshold: 0.05,
            horizon: 4.0,
            max_cells: 20_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellIndex {
    pub i: i32,
    pub j: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObstacleCell {
    pub index: CellIndex,
    /// world frame center of the cell
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
    pub last_observed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Region {
    Circle { x: f32, y: f32, radius: f32 },
    Rect { min_x: f32, min_y: f32, max_x: f32, max_y: f32 },
}

impl Region {
    pub fn around(pose: &Pose2D, radius: f32) -> Self {
        Region::Circle {
            x: pose.x,
            y: pose.y,
            radius,
        }
    }

    fn contains(&self, px: f32, py: f32) -> bool {
        match *self {
            Region::Circle { x, y, radius } => (px - x).powi(2) + (py - y).powi(2) <= radius * radius,
            Region::Rect {
                min_x,
                min_y,
                max_x,
                max_y,
            } => px >= min_x && px <= max_x && py >= min_y && py <= max_y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Number of distinct cells raised
    Fused(usize),
    /// Scan had no points
    Empty,
    /// Scan was not newer than the last one ingested
    Stale,
}

#[derive(Debug, Clone)]
pub struct LocalObstacleMap {
    config: ObstacleMapConfig,
    cells: HashMap<CellIndex, ObstacleCell>,
    last_scan_timestamp: Option<f64>,
    last_decay: Option<f64>,
    last_pose: Option<Pose2D>,
}

impl LocalObstacleMap {
    pub fn new(config: ObstacleMapConfig) -> Self {
        LocalObstacleMap {
            config,
            cells: HashMap::new(),
            last_scan_timestamp: None,
            last_decay: None,
            last_pose: None,
        }
    }

    pub fn config(&self) -> &ObstacleMapConfig {
        &self.config
    }

    /// Cells are centred on multiples of the resolution, so points mirrored
    /// about an axis land in mirrored cells.
    pub fn cell_index(&self, x: f32, y: f32) -> CellIndex {
        CellIndex {
            i: (x / self.config.resolution).round() as i32,
            j: (y / self.config.resolution).round() as i32,
        }
    }

    pub fn cell_center(&self, index: CellIndex) -> (f32, f32) {
        (
            index.i as f32 * self.config.resolution,
            index.j as f32 * self.config.resolution,
        )
    }

    /// Fuses a scan taken at `robot_pose` into the map
    pub fn ingest(&mut self, scan: &RangeScan, robot_pose: &Pose2D) -> IngestOutcome {
        if scan.is_empty() {
            return IngestOutcome::Empty;
        }
        if let Some(last) = self.last_scan_timestamp {
            if scan.timestamp <= last {
                tracing::debug!(
                    "Ignoring scan stamped {:.3}, last ingested {:.3}",
                    scan.timestamp,
                    last
                );
                return IngestOutcome::Stale;
            }
        }
        self.last_scan_timestamp = Some(scan.timestamp);
        self.last_pose = Some(*robot_pose);

        let hits: HashSet<CellIndex> = scan
            .points
            .iter()
            .map(|point| {
                let (bx, by) = point.to_cartesian();
                let (wx, wy) = robot_pose.body_to_world(bx, by);
                self.cell_index(robot_pose.x + wx, robot_pose.y + wy)
            })
            .collect();

        for index in hits.iter() {
            let (x, y) = self.cell_center(*index);
            let increment = self.config.hit_increment;
            self.cells
                .entry(*index)
                .and_modify(|cell| {
                    cell.confidence = (cell.confidence + increment).min(1.0);
                    cell.last_observed = scan.timestamp;
                })
                .or_insert(ObstacleCell {
                    index: *index,
                    x,
                    y,
                    confidence: increment.min(1.0),
                    last_observed: scan.timestamp,
                });
        }
        self.enforce_capacity();
        IngestOutcome::Fused(hits.len())
    }

    /// Time based decay, run once per control tick
    pub fn decay(&mut self, now: f64) {
        let elapsed = match self.last_decay {
            Some(last) => (now - last).max(0.0) as f32,
            None => 0.0,
        };
        self.last_decay = Some(now);

        if elapsed > 0.0 {
            let factor = 0.5_f32.powf(elapsed / self.config.half_life);
            for cell in self.cells.values_mut() {
                cell.confidence *= factor;
            }
        }

        let eviction_threshold = self.config.eviction_threshold;
        let horizon_sq = self.config.horizon * self.config.horizon;
        let last_pose = self.last_pose;
        self.cells.retain(|_, cell| {
            let in_horizon = last_pose.map_or(true, |pose| {
                (cell.x - pose.x).powi(2) + (cell.y - pose.y).powi(2) <= horizon_sq
            });
            cell.confidence >= eviction_threshold && in_horizon
        });
    }

    fn enforce_capacity(&mut self) {
        if self.cells.len() <= self.config.max_cells {
            return;
        }
        let mut ranked: Vec<(CellIndex, f32)> = self
            .cells
            .values()
            .map(|cell| (cell.index, cell.confidence))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        let excess = self.cells.len() - self.config.max_cells;
        for (index, _) in ranked.into_iter().take(excess) {
            self.cells.remove(&index);
        }
    }

    /// Occupied cells inside a region
    pub fn query(&self, region: &Region) -> Vec<ObstacleCell> {
        self.cells
            .values()
            .filter(|cell| cell.confidence >= self.config.query_threshold)
            .filter(|cell| region.contains(cell.x, cell.y))
            .copied()
            .collect()
    }

    /// Forget everything, as if every cell had fully decayed
    pub fn clear(&mut self) {
        if !self.cells.is_empty() {
            tracing::debug!("Clearing {} obstacle cells", self.cells.len());
        }
        self.cells.clear();
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn last_scan_timestamp(&self) -> Option<f64> {
        self.last_scan_timestamp
    }
}
