//! Cascadic screened-Poisson solve over the octree levels.
//!
//! The implicit function is a sum of trilinear hat functions, one lattice per
//! depth:
//!
//! ```text
//! chi(p) = sum over levels l, sum over corners c in U_l of x[l][c] * phi_{l,c}(p)
//! ```
//!
//! A level-`l` corner is an unknown only when every depth-`l` cube around it
//! exists, so each hat's support lies inside refined space. That makes `chi`
//! continuous everywhere and trilinear inside every leaf, which the extractor
//! relies on.
//!
//! Levels are solved coarse to fine. Level `l` solves for a correction that
//! minimizes
//!
//! ```text
//! E(chi) = integral |grad chi - V|^2 + alpha_l * sum_p A_p * chi(p)^2
//! ```
//!
//! with the coarser levels held fixed, `V` the area-weighted sample normals
//! and `alpha_l = point_weight * 2^l`. The Galerkin system uses the exact
//! 27-point trilinear stiffness stencil with natural boundary conditions and
//! is solved by Jacobi-preconditioned conjugate gradients.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::octree::{CellKey, Octree, Sample, cell_key};
use crate::error::{ReconError, ReconResult};
use crate::progress::ProgressTracker;
use crate::tracing_ext::log_solver_iteration;

/// Solver iterations between cancellation polls.
const POLL_INTERVAL: usize = 16;

/// Relative diagonal shift that keeps pure-Neumann levels positive definite.
const REGULARIZATION: f64 = 1e-10;

/// Solver settings.
#[derive(Debug, Clone, Copy)]
pub struct SolverParams {
    pub point_weight: f64,
    /// Relative residual target per level.
    pub tolerance: f64,
    /// Iteration bound per level.
    pub max_iterations: usize,
}

/// Per-level solve record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelStats {
    pub depth: u8,
    pub unknowns: usize,
    pub iterations: usize,
    /// Final relative residual.
    pub residual: f64,
}

/// Hierarchical hat-function representation of the indicator function.
#[derive(Debug, Clone, Default)]
pub struct ImplicitFunction {
    levels: Vec<HashMap<CellKey, f64>>,
}

/// Cell index and fractional offset of a lattice coordinate at `level`.
#[inline]
fn lattice_cell(coord: u32, depth: u8, level: u8) -> (u32, f64) {
    let cells = 1u32 << level;
    let (cell, frac) = if level <= depth {
        let shift = depth - level;
        let mask = (1u32 << shift) - 1;
        (coord >> shift, (coord & mask) as f64 / (1u32 << shift) as f64)
    } else {
        (coord << (level - depth), 0.0)
    };
    if cell >= cells {
        (cells - 1, 1.0)
    } else {
        (cell, frac)
    }
}

/// Cell index and fractional offset of a unit-cube coordinate at `level`.
#[inline]
fn point_cell(c: f64, level: u8) -> (u32, f64) {
    let cells = (1u64 << level) as f64;
    let t = c * cells;
    let cell = t.floor().clamp(0.0, cells - 1.0);
    (cell as u32, (t - cell).clamp(0.0, 1.0))
}

#[inline]
fn corner_of(cell: [u32; 3], slot: usize) -> CellKey {
    [
        cell[0] + (slot & 1) as u32,
        cell[1] + ((slot >> 1) & 1) as u32,
        cell[2] + ((slot >> 2) & 1) as u32,
    ]
}

/// Trilinear weights of the eight cell corners.
#[inline]
fn corner_weights(frac: [f64; 3]) -> [f64; 8] {
    let mut w = [0.0; 8];
    for (slot, wi) in w.iter_mut().enumerate() {
        let mut v = 1.0;
        for (axis, f) in frac.iter().enumerate() {
            v *= if (slot >> axis) & 1 == 1 { *f } else { 1.0 - f };
        }
        *wi = v;
    }
    w
}

/// Gradients of the eight corner hats inside a cell of width `h`.
#[inline]
fn corner_gradients(frac: [f64; 3], h: f64) -> [Vector3<f64>; 8] {
    let mut g = [Vector3::zeros(); 8];
    for (slot, gi) in g.iter_mut().enumerate() {
        let lin = |axis: usize| {
            if (slot >> axis) & 1 == 1 { frac[axis] } else { 1.0 - frac[axis] }
        };
        let slope = |axis: usize| if (slot >> axis) & 1 == 1 { 1.0 / h } else { -1.0 / h };
        *gi = Vector3::new(
            slope(0) * lin(1) * lin(2),
            lin(0) * slope(1) * lin(2),
            lin(0) * lin(1) * slope(2),
        );
    }
    g
}

impl ImplicitFunction {
    /// Assemble from per-level coefficient maps, coarsest first.
    pub(crate) fn from_levels(levels: Vec<HashMap<CellKey, f64>>) -> Self {
        Self { levels }
    }

    /// Nonzero coefficients across all levels.
    pub fn coefficient_count(&self) -> usize {
        self.levels.iter().map(HashMap::len).sum()
    }

    /// Value at a unit-cube position.
    pub fn evaluate(&self, p: &Point3<f64>) -> f64 {
        let mut value = 0.0;
        for (level, coeffs) in self.levels.iter().enumerate() {
            if coeffs.is_empty() {
                continue;
            }
            let level = level as u8;
            let (cx, fx) = point_cell(p.x, level);
            let (cy, fy) = point_cell(p.y, level);
            let (cz, fz) = point_cell(p.z, level);
            value += Self::cell_sum(coeffs, [cx, cy, cz], [fx, fy, fz]);
        }
        value
    }

    /// Value at lattice point `key` of the depth-`depth` lattice. Exact in
    /// the sense that every caller gets bit-identical results for a point.
    pub fn evaluate_lattice(&self, key: CellKey, depth: u8) -> f64 {
        let mut value = 0.0;
        for (level, coeffs) in self.levels.iter().enumerate() {
            if coeffs.is_empty() {
                continue;
            }
            let level = level as u8;
            let (cx, fx) = lattice_cell(key[0], depth, level);
            let (cy, fy) = lattice_cell(key[1], depth, level);
            let (cz, fz) = lattice_cell(key[2], depth, level);
            value += Self::cell_sum(coeffs, [cx, cy, cz], [fx, fy, fz]);
        }
        value
    }

    #[inline]
    fn cell_sum(coeffs: &HashMap<CellKey, f64>, cell: [u32; 3], frac: [f64; 3]) -> f64 {
        let weights = corner_weights(frac);
        let mut sum = 0.0;
        for (slot, &w) in weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            if let Some(x) = coeffs.get(&corner_of(cell, slot)) {
                sum += w * x;
            }
        }
        sum
    }

    /// Contribution of a single level at a unit-cube position.
    fn evaluate_level(&self, level: usize, p: &Point3<f64>) -> f64 {
        let coeffs = &self.levels[level];
        if coeffs.is_empty() {
            return 0.0;
        }
        let level = level as u8;
        let (cx, fx) = point_cell(p.x, level);
        let (cy, fy) = point_cell(p.y, level);
        let (cz, fz) = point_cell(p.z, level);
        Self::cell_sum(coeffs, [cx, cy, cz], [fx, fy, fz])
    }
}

/// 1D mass and stiffness between lattice nodes `i` and `j` (`|i - j| <= 1`)
/// on `[0, n]` with spacing `h`.
#[inline]
fn axis_factors(i: u32, j: u32, n: u32, h: f64) -> (f64, f64) {
    if i == j {
        let elements = u32::from(i > 0) + u32::from(i < n);
        (elements as f64 * h / 3.0, elements as f64 / h)
    } else {
        (h / 6.0, -1.0 / h)
    }
}

/// Stiffness entry between two neighbouring lattice corners.
#[inline]
fn stiffness(a: CellKey, b: CellKey, n: u32, h: f64) -> f64 {
    let (mx, kx) = axis_factors(a[0], b[0], n, h);
    let (my, ky) = axis_factors(a[1], b[1], n, h);
    let (mz, kz) = axis_factors(a[2], b[2], n, h);
    kx * my * mz + mx * ky * mz + mx * my * kz
}

#[inline]
fn offset_index(d: [i64; 3]) -> usize {
    ((d[0] + 1) + 3 * (d[1] + 1) + 9 * (d[2] + 1)) as usize
}

/// Compressed sparse row matrix.
#[derive(Debug, Clone, Default)]
pub struct CsrMatrix {
    row_ptr: Vec<usize>,
    cols: Vec<u32>,
    vals: Vec<f64>,
    diag: Vec<f64>,
}

impl CsrMatrix {
    /// Build from per-row `(column, value)` lists.
    pub fn from_rows(rows: Vec<Vec<(u32, f64)>>) -> Self {
        let mut matrix = CsrMatrix {
            row_ptr: Vec::with_capacity(rows.len() + 1),
            diag: vec![0.0; rows.len()],
            ..Default::default()
        };
        matrix.row_ptr.push(0);
        for (r, row) in rows.into_iter().enumerate() {
            for (c, v) in row {
                if c as usize == r {
                    matrix.diag[r] = v;
                }
                matrix.cols.push(c);
                matrix.vals.push(v);
            }
            matrix.row_ptr.push(matrix.cols.len());
        }
        matrix
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.diag.len()
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.vals.len()
    }

    /// `y = A x`, rows in parallel.
    pub fn mul(&self, x: &[f64], y: &mut [f64]) {
        y.par_iter_mut().enumerate().for_each(|(r, yr)| {
            let (start, end) = (self.row_ptr[r], self.row_ptr[r + 1]);
            *yr = self.cols[start..end]
                .iter()
                .zip(&self.vals[start..end])
                .map(|(&c, &v)| v * x[c as usize])
                .sum();
        });
    }

    fn shift_diagonal(&mut self, relative: f64) {
        for r in 0..self.rows() {
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                if self.cols[k] as usize == r {
                    self.vals[k] += relative * self.vals[k].abs();
                    self.diag[r] = self.vals[k];
                }
            }
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Outcome of one conjugate-gradient run.
#[derive(Debug, Clone)]
pub struct CgOutcome {
    pub solution: Vec<f64>,
    pub iterations: usize,
    /// `||r|| / ||b||`.
    pub relative_residual: f64,
}

/// Jacobi-preconditioned conjugate gradients from a zero start.
///
/// Dot products run sequentially so the result is independent of the
/// thread count.
pub fn conjugate_gradient(
    a: &CsrMatrix,
    b: &[f64],
    params: &SolverParams,
    level: u8,
    tracker: &ProgressTracker<'_>,
    fraction: f64,
) -> ReconResult<CgOutcome> {
    let n = a.rows();
    let mut x = vec![0.0; n];
    let b_norm = dot(b, b).sqrt();
    if !b_norm.is_finite() {
        return Err(ReconError::SolverDivergence {
            level,
            iterations: 0,
            residual: b_norm,
            tolerance: params.tolerance,
        });
    }
    if b_norm == 0.0 {
        return Ok(CgOutcome {
            solution: x,
            iterations: 0,
            relative_residual: 0.0,
        });
    }

    let inv_diag: Vec<f64> = a
        .diag
        .iter()
        .map(|&d| if d > 0.0 { 1.0 / d } else { 1.0 })
        .collect();

    let mut r = b.to_vec();
    let mut z: Vec<f64> = r.iter().zip(&inv_diag).map(|(ri, di)| ri * di).collect();
    let mut p = z.clone();
    let mut ap = vec![0.0; n];
    let mut rz = dot(&r, &z);
    let mut relative = 1.0;

    for iteration in 1..=params.max_iterations {
        a.mul(&p, &mut ap);
        let pap = dot(&p, &ap);
        if !(pap.is_finite() && pap > 0.0) {
            return Err(ReconError::SolverDivergence {
                level,
                iterations: iteration,
                residual: relative,
                tolerance: params.tolerance,
            });
        }

        let alpha = rz / pap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }

        relative = dot(&r, &r).sqrt() / b_norm;
        if !relative.is_finite() {
            return Err(ReconError::SolverDivergence {
                level,
                iterations: iteration,
                residual: relative,
                tolerance: params.tolerance,
            });
        }
        if relative <= params.tolerance {
            return Ok(CgOutcome {
                solution: x,
                iterations: iteration,
                relative_residual: relative,
            });
        }

        if iteration % POLL_INTERVAL == 0 {
            log_solver_iteration(level, iteration, relative);
            tracker.report(fraction, format!("solving depth {}", level))?;
        }

        for i in 0..n {
            z[i] = r[i] * inv_diag[i];
        }
        let rz_next = dot(&r, &z);
        let beta = rz_next / rz;
        rz = rz_next;
        for i in 0..n {
            p[i] = z[i] + beta * p[i];
        }
    }

    Err(ReconError::SolverDivergence {
        level,
        iterations: params.max_iterations,
        residual: relative,
        tolerance: params.tolerance,
    })
}

/// Accumulated sample terms of one depth-`l` cube.
#[derive(Debug, Clone)]
struct CellLoad {
    /// `sum_p A_p phi_a(p) phi_b(p)`.
    mass: [[f64; 8]; 8],
    /// `sum_p A_p (grad phi_a(p) . n_p - alpha_l phi_a(p) chi_coarse(p))`.
    load: [f64; 8],
}

impl Default for CellLoad {
    fn default() -> Self {
        Self {
            mass: [[0.0; 8]; 8],
            load: [0.0; 8],
        }
    }
}

/// Solve every level of the octree, coarse to fine.
///
/// `areas[i]` is the surface area represented by `samples[i]`. Progress is
/// reported inside `[start, end]` of the tracker's stage.
pub fn solve_levels(
    octree: &Octree,
    samples: &[Sample],
    areas: &[f64],
    params: &SolverParams,
    tracker: &ProgressTracker<'_>,
    (start, end): (f64, f64),
) -> ReconResult<(ImplicitFunction, Vec<LevelStats>)> {
    let mut function = ImplicitFunction::default();
    let mut stats = Vec::new();
    // chi at every sample from the levels solved so far.
    let mut sample_values = vec![0.0; samples.len()];
    let levels = octree.max_depth() as usize + 1;

    for l in 0..levels {
        let depth = l as u8;
        let fraction = start + (end - start) * l as f64 / levels as f64;
        tracker.report_now(fraction, format!("solving depth {}", depth))?;

        let n = 1u32 << depth;
        let h = 1.0 / n as f64;
        let alpha = params.point_weight * n as f64;

        // Corners of depth-l cubes, in node order.
        let mut corner_index: HashMap<CellKey, usize> = HashMap::new();
        let mut corners: Vec<CellKey> = Vec::new();
        for &id in octree.level(depth) {
            let key = octree.node(id).key;
            for slot in 0..8 {
                let c = corner_of(key, slot);
                corner_index.entry(c).or_insert_with(|| {
                    corners.push(c);
                    corners.len() - 1
                });
            }
        }

        let unknowns: Vec<CellKey> = corners
            .iter()
            .copied()
            .filter(|c| hat_support_refined(octree, depth, *c))
            .collect();
        if unknowns.is_empty() {
            function.levels.push(HashMap::new());
            stats.push(LevelStats {
                depth,
                unknowns: 0,
                iterations: 0,
                residual: 0.0,
            });
            continue;
        }
        let unknown_index: HashMap<CellKey, u32> = unknowns
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32))
            .collect();

        let coarse: Vec<f64> = corners
            .par_iter()
            .map(|&c| function.evaluate_lattice(c, depth))
            .collect();

        let mut loads: HashMap<CellKey, CellLoad> = HashMap::new();
        for (i, sample) in samples.iter().enumerate() {
            let cell = cell_key(&sample.position, depth);
            if octree.find(depth, cell).is_none() {
                continue;
            }
            let frac = [
                sample.position.x * n as f64 - cell[0] as f64,
                sample.position.y * n as f64 - cell[1] as f64,
                sample.position.z * n as f64 - cell[2] as f64,
            ]
            .map(|f| f.clamp(0.0, 1.0));
            let w = corner_weights(frac);
            let g = corner_gradients(frac, h);
            let area = areas[i];
            let entry = loads.entry(cell).or_default();
            for a in 0..8 {
                entry.load[a] +=
                    area * (g[a].dot(&sample.normal) - alpha * w[a] * sample_values[i]);
                for b in 0..8 {
                    entry.mass[a][b] += area * w[a] * w[b];
                }
            }
        }

        let assembled: Vec<(Vec<(u32, f64)>, f64)> = unknowns
            .par_iter()
            .map(|&c| {
                let mut screening = [0.0; 27];
                let mut rhs = 0.0;
                for slot in 0..8 {
                    let d = [slot & 1, (slot >> 1) & 1, (slot >> 2) & 1].map(|b| b as u32);
                    if (0..3).any(|axis| c[axis] < d[axis] || c[axis] - d[axis] >= n) {
                        continue;
                    }
                    let cell = [c[0] - d[0], c[1] - d[1], c[2] - d[2]];
                    let Some(load) = loads.get(&cell) else {
                        continue;
                    };
                    rhs += load.load[slot];
                    for other in 0..8 {
                        let o = [other & 1, (other >> 1) & 1, (other >> 2) & 1];
                        let delta = [0, 1, 2].map(|axis| o[axis] as i64 - d[axis] as i64);
                        screening[offset_index(delta)] += load.mass[slot][other];
                    }
                }

                let mut row = Vec::with_capacity(27);
                for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let nb = [c[0] as i64 + dx, c[1] as i64 + dy, c[2] as i64 + dz];
                            if nb.iter().any(|&v| v < 0 || v > n as i64) {
                                continue;
                            }
                            let nb = nb.map(|v| v as u32);
                            let lap = stiffness(c, nb, n, h);
                            if let Some(&j) = corner_index.get(&nb) {
                                rhs -= lap * coarse[j];
                            }
                            if let Some(&col) = unknown_index.get(&nb) {
                                row.push((col, lap + alpha * screening[offset_index([dx, dy, dz])]));
                            }
                        }
                    }
                }
                row.sort_unstable_by_key(|&(col, _)| col);
                (row, rhs)
            })
            .collect();

        let (rows, rhs): (Vec<_>, Vec<_>) = assembled.into_iter().unzip();
        let mut matrix = CsrMatrix::from_rows(rows);
        matrix.shift_diagonal(REGULARIZATION);

        let outcome = conjugate_gradient(&matrix, &rhs, params, depth, tracker, fraction)?;
        debug!(
            depth = depth,
            unknowns = unknowns.len(),
            nnz = matrix.nnz(),
            iterations = outcome.iterations,
            residual = outcome.relative_residual,
            "Solved level"
        );
        if outcome.iterations > params.max_iterations / 2 {
            warn!(
                depth = depth,
                iterations = outcome.iterations,
                "Slow convergence"
            );
        }

        let coeffs: HashMap<CellKey, f64> = unknowns
            .iter()
            .zip(&outcome.solution)
            .map(|(c, x)| (*c, *x))
            .collect();
        function.levels.push(coeffs);

        sample_values
            .par_iter_mut()
            .zip(samples.par_iter())
            .for_each(|(value, sample)| *value += function.evaluate_level(l, &sample.position));

        stats.push(LevelStats {
            depth,
            unknowns: unknowns.len(),
            iterations: outcome.iterations,
            residual: outcome.relative_residual,
        });
    }

    Ok((function, stats))
}

/// True when every in-domain depth-`depth` cube touching corner `c` exists.
fn hat_support_refined(octree: &Octree, depth: u8, c: CellKey) -> bool {
    let n = 1u32 << depth;
    for slot in 0..8 {
        let d = [slot & 1, (slot >> 1) & 1, (slot >> 2) & 1].map(|b| b as u32);
        if (0..3).any(|axis| c[axis] < d[axis] || c[axis] - d[axis] >= n) {
            continue;
        }
        let cell = [c[0] - d[0], c[1] - d[1], c[2] - d[2]];
        if octree.find(depth, cell).is_none() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    #[test]
    fn test_stiffness_interior_and_boundary() {
        let h = 0.25;
        let c = [2, 2, 2];
        assert!((stiffness(c, c, 4, h) - 8.0 * h / 3.0).abs() < 1e-12);
        // Rows of the stiffness matrix sum to zero (constants are in the kernel).
        for corner in [[2u32, 2, 2], [0, 0, 0], [4, 1, 0]] {
            let mut sum = 0.0;
            for dz in -1i64..=1 {
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let nb = [corner[0] as i64 + dx, corner[1] as i64 + dy, corner[2] as i64 + dz];
                        if nb.iter().any(|&v| v < 0 || v > 4) {
                            continue;
                        }
                        sum += stiffness(corner, nb.map(|v| v as u32), 4, h);
                    }
                }
            }
            assert!(sum.abs() < 1e-12, "row sum {} at {:?}", sum, corner);
        }
    }

    #[test]
    fn test_weights_partition_unity_and_gradients_sum_zero() {
        let frac = [0.3, 0.8, 0.45];
        let w = corner_weights(frac);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        let g = corner_gradients(frac, 0.5);
        let total: Vector3<f64> = g.iter().sum();
        assert!(total.norm() < 1e-12);
    }

    #[test]
    fn test_lattice_cell_upper_boundary() {
        assert_eq!(lattice_cell(8, 3, 2), (3, 1.0));
        assert_eq!(lattice_cell(5, 3, 2), (2, 0.5));
        assert_eq!(lattice_cell(1, 1, 3), (4, 0.0));
    }

    #[test]
    fn test_conjugate_gradient_small_system() {
        // [4 1; 1 3] x = [1; 2]  =>  x = [1/11, 7/11]
        let a = CsrMatrix::from_rows(vec![vec![(0, 4.0), (1, 1.0)], vec![(0, 1.0), (1, 3.0)]]);
        let params = SolverParams {
            point_weight: 0.0,
            tolerance: 1e-12,
            max_iterations: 10,
        };
        let tracker = ProgressTracker::silent(Stage::Reconstructing);
        let out = conjugate_gradient(&a, &[1.0, 2.0], &params, 0, &tracker, 0.0).unwrap();
        assert!((out.solution[0] - 1.0 / 11.0).abs() < 1e-10);
        assert!((out.solution[1] - 7.0 / 11.0).abs() < 1e-10);
        assert!(out.iterations <= 2);
    }

    #[test]
    fn test_conjugate_gradient_iteration_bound() {
        let rows = (0..6)
            .map(|i| {
                let mut row = vec![(i as u32, 2.0 + i as f64)];
                if i > 0 {
                    row.insert(0, (i as u32 - 1, -1.0));
                }
                if i < 5 {
                    row.push((i as u32 + 1, -1.0));
                }
                row
            })
            .collect();
        let a = CsrMatrix::from_rows(rows);
        let params = SolverParams {
            point_weight: 0.0,
            tolerance: 1e-14,
            max_iterations: 1,
        };
        let tracker = ProgressTracker::silent(Stage::Reconstructing);
        let err = conjugate_gradient(&a, &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0], &params, 3, &tracker, 0.0)
            .unwrap_err();
        assert!(matches!(err, ReconError::SolverDivergence { level: 3, iterations: 1, .. }));
    }

    #[test]
    fn test_cancellation_inside_solve() {
        let n = 64;
        let rows = (0..n)
            .map(|i| {
                let mut row = vec![(i as u32, 2.0001)];
                if i > 0 {
                    row.insert(0, (i as u32 - 1, -1.0));
                }
                if i < n - 1 {
                    row.push((i as u32 + 1, -1.0));
                }
                row
            })
            .collect();
        let a = CsrMatrix::from_rows(rows);
        let params = SolverParams {
            point_weight: 0.0,
            tolerance: 1e-15,
            max_iterations: 1000,
        };
        let tracker = ProgressTracker::silent(Stage::Reconstructing);
        tracker.token().cancel();
        let mut b = vec![0.0; n];
        b[0] = 1.0;
        b[n - 1] = -0.5;
        b[n / 3] = 0.25;
        let err = conjugate_gradient(&a, &b, &params, 0, &tracker, 0.0).unwrap_err();
        assert!(err.is_cancelled());
    }
}
