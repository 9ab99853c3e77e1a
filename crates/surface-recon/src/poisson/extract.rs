//! Isosurface extraction over the octree.
//!
//! Every leaf is walked down to the finest lattice, skipping sub-cubes whose
//! eight corners lie on one side of the isovalue. The implicit function is
//! trilinear inside a leaf, so its extremes over any sub-cube sit at the
//! corners and the skip never loses a crossing. Surviving unit cells are
//! split into six tetrahedra around their main diagonal and polygonized.
//!
//! All cells share one finest-level lattice and one value cache, so two cells
//! meeting at a face see identical corner values and produce identical edge
//! vertices. The result has no cracks between leaves of different depth.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::debug;

use super::octree::{CellKey, Octree};
use super::solver::ImplicitFunction;
use crate::error::ReconResult;
use crate::progress::ProgressTracker;

/// Leaves visited between progress reports.
const REPORT_INTERVAL: usize = 1024;

/// Six tetrahedra sharing the 0-7 diagonal. Corner `i` of a cell sits at
/// offset `(i & 1, (i >> 1) & 1, (i >> 2) & 1)`.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 3, 2, 7],
    [0, 2, 6, 7],
    [0, 6, 4, 7],
    [0, 4, 5, 7],
    [0, 5, 1, 7],
];

/// Triangle soup with shared vertices, in unit-cube coordinates.
#[derive(Debug, Clone, Default)]
pub struct ExtractedSurface {
    pub positions: Vec<Point3<f64>>,
    pub faces: Vec<[u32; 3]>,
    /// Finest-lattice cells that were polygonized.
    pub active_cells: usize,
}

struct Extractor<'a> {
    function: &'a ImplicitFunction,
    isovalue: f64,
    depth: u8,
    values: HashMap<CellKey, f64>,
    /// Edge endpoints (inside, outside) to vertex id. A vertex on a lattice
    /// point is keyed by that point twice.
    vertex_ids: HashMap<(CellKey, CellKey), u32>,
    surface: ExtractedSurface,
}

#[inline]
fn offset(key: CellKey, slot: usize, size: u32) -> CellKey {
    [
        key[0] + (slot & 1) as u32 * size,
        key[1] + ((slot >> 1) & 1) as u32 * size,
        key[2] + ((slot >> 2) & 1) as u32 * size,
    ]
}

impl<'a> Extractor<'a> {
    fn lattice_point(&self, key: CellKey) -> Point3<f64> {
        let scale = 1.0 / (1u64 << self.depth) as f64;
        Point3::new(
            key[0] as f64 * scale,
            key[1] as f64 * scale,
            key[2] as f64 * scale,
        )
    }

    /// Shifted function value at a finest-lattice point.
    fn value(&mut self, key: CellKey) -> f64 {
        if let Some(&v) = self.values.get(&key) {
            return v;
        }
        let v = self.function.evaluate_lattice(key, self.depth) - self.isovalue;
        self.values.insert(key, v);
        v
    }

    fn corner_values(&mut self, origin: CellKey, size: u32) -> [f64; 8] {
        let mut vals = [0.0; 8];
        for (slot, v) in vals.iter_mut().enumerate() {
            *v = self.value(offset(origin, slot, size));
        }
        vals
    }

    fn visit(&mut self, origin: CellKey, size: u32) {
        let vals = self.corner_values(origin, size);
        let inside = vals.iter().filter(|&&v| v < 0.0).count();
        if inside == 0 || inside == 8 {
            return;
        }
        if size == 1 {
            self.polygonize(origin, &vals);
            return;
        }
        let half = size / 2;
        for slot in 0..8 {
            self.visit(offset(origin, slot, half), half);
        }
    }

    fn edge_vertex(&mut self, inside: (CellKey, f64), outside: (CellKey, f64)) -> u32 {
        let (a, fa) = inside;
        let (b, fb) = outside;
        let key = if fb == 0.0 {
            (b, b)
        } else if a < b {
            (a, b)
        } else {
            (b, a)
        };
        if let Some(&id) = self.vertex_ids.get(&key) {
            return id;
        }

        let pa = self.lattice_point(a);
        let pb = self.lattice_point(b);
        let position = if fb == 0.0 {
            pb
        } else {
            // fa < 0 <= fb, so the denominator is strictly negative.
            let t = fa / (fa - fb);
            pa + (pb - pa) * t
        };

        let id = self.surface.positions.len() as u32;
        self.surface.positions.push(position);
        self.vertex_ids.insert(key, id);
        id
    }

    fn polygonize(&mut self, origin: CellKey, vals: &[f64; 8]) {
        self.surface.active_cells += 1;
        let keys: [CellKey; 8] = std::array::from_fn(|slot| offset(origin, slot, 1));

        for tet in &TETRAHEDRA {
            let (inside, outside): (Vec<usize>, Vec<usize>) =
                tet.iter().copied().partition(|&corner| vals[corner] < 0.0);

            let edge = |this: &mut Self, i: usize, o: usize| {
                this.edge_vertex((keys[i], vals[i]), (keys[o], vals[o]))
            };

            let triangles: Vec<[u32; 3]> = match (inside.len(), outside.len()) {
                (1, 3) => {
                    let i = inside[0];
                    vec![[
                        edge(self, i, outside[0]),
                        edge(self, i, outside[1]),
                        edge(self, i, outside[2]),
                    ]]
                }
                (3, 1) => {
                    let o = outside[0];
                    vec![[
                        edge(self, inside[0], o),
                        edge(self, inside[1], o),
                        edge(self, inside[2], o),
                    ]]
                }
                (2, 2) => {
                    let q = [
                        edge(self, inside[0], outside[0]),
                        edge(self, inside[0], outside[1]),
                        edge(self, inside[1], outside[1]),
                        edge(self, inside[1], outside[0]),
                    ];
                    vec![[q[0], q[1], q[2]], [q[0], q[2], q[3]]]
                }
                _ => continue,
            };

            // Face toward increasing values.
            let centroid = |corners: &[usize]| {
                let sum = corners
                    .iter()
                    .fold(Vector3::zeros(), |acc, &c| acc + self.lattice_point(keys[c]).coords);
                sum / corners.len() as f64
            };
            let outward = centroid(&outside) - centroid(&inside);

            for [a, b, c] in triangles {
                if a == b || b == c || a == c {
                    continue;
                }
                let pa = self.surface.positions[a as usize];
                let pb = self.surface.positions[b as usize];
                let pc = self.surface.positions[c as usize];
                let normal = (pb - pa).cross(&(pc - pa));
                if normal.dot(&outward) < 0.0 {
                    self.surface.faces.push([a, c, b]);
                } else {
                    self.surface.faces.push([a, b, c]);
                }
            }
        }
    }
}

/// Extract the `isovalue` level set of `function` over `octree`.
pub fn extract_isosurface(
    octree: &Octree,
    function: &ImplicitFunction,
    isovalue: f64,
    tracker: &ProgressTracker<'_>,
    (start, end): (f64, f64),
) -> ReconResult<ExtractedSurface> {
    let depth = octree.max_depth();
    let mut extractor = Extractor {
        function,
        isovalue,
        depth,
        values: HashMap::new(),
        vertex_ids: HashMap::new(),
        surface: ExtractedSurface::default(),
    };

    let leaves: Vec<_> = octree.leaves().collect();
    for (i, &id) in leaves.iter().enumerate() {
        if i % REPORT_INTERVAL == 0 {
            let fraction = start + (end - start) * i as f64 / leaves.len() as f64;
            tracker.report(fraction, "extracting isosurface")?;
        }
        let node = octree.node(id);
        let size = 1u32 << (depth - node.depth);
        let origin = node.key.map(|k| k * size);
        extractor.visit(origin, size);
    }

    debug!(
        leaves = leaves.len(),
        cells = extractor.surface.active_cells,
        cached_values = extractor.values.len(),
        vertices = extractor.surface.positions.len(),
        faces = extractor.surface.faces.len(),
        "Extracted isosurface"
    );
    Ok(extractor.surface)
}
