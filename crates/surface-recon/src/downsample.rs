//! Voxel-grid downsampling.
//!
//! Space is cut into cubes of edge `voxel_size` anchored at the world origin
//! (cube `(i, j, k)` covers `[i*s, (i+1)*s)` on x, likewise y and z). Each
//! non-empty cube yields one point at the centroid of its members, with the
//! averaged color and the averaged, renormalized normal. Member normals are
//! flipped to agree with the cube's first normal before averaging, so the two
//! faces of a sheet thinner than a cube never cancel to nothing.
//!
//! Anchoring at the origin rather than at the cloud's bounding box makes the
//! operation a fixed point: a centroid stays inside its own cube, so a second
//! pass finds one point per cube and returns it untouched.
//!
//! The output count is non-increasing only along nested voxel sizes, where
//! the larger size is a power-of-two multiple of the smaller: every fine cube
//! then sits inside one coarse cube. For arbitrary size increases a fixed
//! grid can split a cluster that a smaller grid kept whole, so no such
//! guarantee holds.
//!
//! Output order is ascending `(i, j, k)`.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{ReconError, ReconResult};
use crate::pipeline::Stage;
use crate::progress::ProgressTracker;
use crate::tracing_ext::OperationTimer;
use crate::types::{CloudPoint, PointSet, VertexColor};

type VoxelKey = (i64, i64, i64);

/// Per-cube running sums.
#[derive(Debug, Clone)]
struct VoxelAccumulator {
    first: usize,
    count: usize,
    position: Vector3<f64>,
    normal: Vector3<f64>,
    normals: usize,
    /// First normal seen; later normals are flipped to agree with it.
    reference: Option<Vector3<f64>>,
    color: Vector3<f64>,
    colors: usize,
}

impl VoxelAccumulator {
    fn new(first: usize) -> Self {
        Self {
            first,
            count: 0,
            position: Vector3::zeros(),
            normal: Vector3::zeros(),
            normals: 0,
            reference: None,
            color: Vector3::zeros(),
            colors: 0,
        }
    }

    fn add(&mut self, point: &CloudPoint) {
        self.count += 1;
        self.position += point.position.coords;
        if let Some(n) = point.normal {
            let reference = *self.reference.get_or_insert(n);
            self.normal += if n.dot(&reference) < 0.0 { -n } else { n };
            self.normals += 1;
        }
        if let Some(c) = point.color {
            self.color += c.to_float();
            self.colors += 1;
        }
    }

    /// Fold in the sums of a later chunk.
    fn merge(&mut self, other: VoxelAccumulator) {
        self.first = self.first.min(other.first);
        self.count += other.count;
        self.position += other.position;
        match (self.reference, other.reference) {
            (Some(mine), Some(theirs)) if mine.dot(&theirs) < 0.0 => self.normal -= other.normal,
            (None, theirs) => {
                self.reference = theirs;
                self.normal += other.normal;
            }
            _ => self.normal += other.normal,
        }
        self.normals += other.normals;
        self.color += other.color;
        self.colors += other.colors;
    }

    fn representative(&self, points: &PointSet) -> CloudPoint {
        if self.count == 1 {
            return points.points[self.first].clone();
        }

        let position = Point3::from(self.position / self.count as f64);
        let normal = if self.normals > 0 {
            let len = self.normal.norm();
            (len > 1e-12).then(|| self.normal / len)
        } else {
            None
        };
        let color = (self.colors > 0).then(|| {
            let c = self.color / self.colors as f64;
            VertexColor::from_float(c.x, c.y, c.z)
        });

        CloudPoint {
            position,
            normal,
            color,
        }
    }
}

/// Cube index of a position.
#[inline]
pub fn voxel_key(position: &Point3<f64>, voxel_size: f64) -> (i64, i64, i64) {
    (
        (position.x / voxel_size).floor() as i64,
        (position.y / voxel_size).floor() as i64,
        (position.z / voxel_size).floor() as i64,
    )
}

/// Downsample a point set to one point per occupied voxel.
pub fn voxel_downsample(points: &PointSet, voxel_size: f64) -> ReconResult<PointSet> {
    voxel_downsample_with_progress(points, voxel_size, &ProgressTracker::silent(Stage::Downsampling))
}

/// [`voxel_downsample`] with progress reporting and cancellation.
pub fn voxel_downsample_with_progress(
    points: &PointSet,
    voxel_size: f64,
    tracker: &ProgressTracker<'_>,
) -> ReconResult<PointSet> {
    if !(voxel_size.is_finite() && voxel_size > 0.0) {
        return Err(ReconError::invalid_config(
            "voxel_size",
            format!("must be positive and finite, got {}", voxel_size),
        ));
    }
    if points.is_empty() {
        return Ok(PointSet::new());
    }
    if let Some(i) = points.first_non_finite() {
        return Err(ReconError::degenerate_input(format!(
            "point {} has a non-finite coordinate",
            i
        )));
    }

    let _timer = OperationTimer::with_points("voxel_downsample", points.len());

    // Per-chunk maps, merged afterwards.
    const CHUNK: usize = 1 << 16;
    let partials: Vec<HashMap<VoxelKey, VoxelAccumulator>> = points
        .points
        .par_chunks(CHUNK)
        .enumerate()
        .map(|(chunk_idx, chunk)| {
            tracker.report(
                0.8 * (chunk_idx * CHUNK) as f64 / points.len() as f64,
                "binning points",
            )?;
            let mut map: HashMap<VoxelKey, VoxelAccumulator> = HashMap::new();
            for (offset, point) in chunk.iter().enumerate() {
                let key = voxel_key(&point.position, voxel_size);
                map.entry(key)
                    .or_insert_with(|| VoxelAccumulator::new(chunk_idx * CHUNK + offset))
                    .add(point);
            }
            Ok(map)
        })
        .collect::<ReconResult<_>>()?;

    let mut voxels: HashMap<VoxelKey, VoxelAccumulator> = HashMap::new();
    for partial in partials {
        for (key, acc) in partial {
            match voxels.get_mut(&key) {
                Some(existing) => existing.merge(acc),
                None => {
                    voxels.insert(key, acc);
                }
            }
        }
    }
    tracker.checkpoint()?;

    let mut cells: Vec<(VoxelKey, VoxelAccumulator)> = voxels.into_iter().collect();
    cells.par_sort_unstable_by_key(|(key, _)| *key);

    let result: PointSet = cells
        .par_iter()
        .map(|(_, acc)| acc.representative(points))
        .collect::<Vec<_>>()
        .into_iter()
        .collect();

    tracker.report_now(1.0, "downsampled")?;
    info!(
        input = points.len(),
        output = result.len(),
        voxel_size = voxel_size,
        "Voxel downsampling finished"
    );
    debug!(voxels = result.len(), "Occupied voxels");

    Ok(result)
}
