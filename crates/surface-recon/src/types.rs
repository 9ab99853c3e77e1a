//! Core data types: oriented point samples in, indexed triangle mesh out.
//!
//! A [`PointSet`] is what the ingestion side hands to the core and what every
//! point stage returns. Stages never mutate their input; they build a new set.
//! A [`Mesh`] is the final product handed to the export side.

use nalgebra::{Point3, Vector3};

/// RGB color with 8-bit components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl VertexColor {
    /// Create a new color from RGB components.
    #[inline]
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Create a color from floating point values in [0, 1] range.
    #[inline]
    pub fn from_float(r: f64, g: f64, b: f64) -> Self {
        Self {
            r: (r.clamp(0.0, 1.0) * 255.0).round() as u8,
            g: (g.clamp(0.0, 1.0) * 255.0).round() as u8,
            b: (b.clamp(0.0, 1.0) * 255.0).round() as u8,
        }
    }

    /// Convert to floating point values in [0, 1] range.
    #[inline]
    pub fn to_float(&self) -> Vector3<f64> {
        Vector3::new(
            self.r as f64 / 255.0,
            self.g as f64 / 255.0,
            self.b as f64 / 255.0,
        )
    }
}

/// A single sample with optional color and normal.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudPoint {
    /// 3D position.
    pub position: Point3<f64>,

    /// Unit normal vector (estimated or supplied by the scanner).
    pub normal: Option<Vector3<f64>>,

    /// Point color (RGB).
    pub color: Option<VertexColor>,
}

impl CloudPoint {
    /// Create a point with only position.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
            color: None,
        }
    }

    /// Create a point from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }

    /// Create a point with position and normal.
    #[inline]
    pub fn with_normal(position: Point3<f64>, normal: Vector3<f64>) -> Self {
        Self {
            position,
            normal: Some(normal),
            color: None,
        }
    }

    /// True when all three coordinates are finite.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.position.coords.iter().all(|c| c.is_finite())
    }
}

/// An ordered sequence of points sharing one coordinate frame.
///
/// Order is the insertion order of the source and is preserved by every stage
/// that does not explicitly reorder (only the downsampler does).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSet {
    /// The points, in source order.
    pub points: Vec<CloudPoint>,
}

impl PointSet {
    /// Create an empty point set.
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create an empty point set with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Create a point set from bare positions.
    pub fn from_positions(positions: &[Point3<f64>]) -> Self {
        Self {
            points: positions.iter().map(|&p| CloudPoint::new(p)).collect(),
        }
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if there are no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True if the set is non-empty and every point carries a normal.
    pub fn has_normals(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.normal.is_some())
    }

    /// True if any point carries a color.
    pub fn has_colors(&self) -> bool {
        self.points.iter().any(|p| p.color.is_some())
    }

    /// Axis-aligned bounding box, `None` when empty.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.points.first()?.position;
        let mut min = first;
        let mut max = first;

        for point in &self.points[1..] {
            let p = &point.position;
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Some((min, max))
    }

    /// Largest edge of the bounding box (0 for empty or single-point sets).
    pub fn span(&self) -> f64 {
        self.bounds()
            .map(|(min, max)| (max - min).max())
            .unwrap_or(0.0)
    }

    /// Mean position, `None` when empty.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.position.coords);
        Some(Point3::from(sum / self.points.len() as f64))
    }

    /// Append a point.
    #[inline]
    pub fn push(&mut self, point: CloudPoint) {
        self.points.push(point);
    }

    /// Append a point from raw coordinates.
    #[inline]
    pub fn push_coords(&mut self, x: f64, y: f64, z: f64) {
        self.points.push(CloudPoint::from_coords(x, y, z));
    }

    /// Index of the first point with a NaN or infinite coordinate.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.points.iter().position(|p| !p.is_finite())
    }

    /// Flip every normal that points toward the centroid.
    ///
    /// Only meaningful for clouds sampled from the outside of a roughly
    /// star-shaped object.
    pub fn orient_normals_outward(&mut self) {
        let centroid = match self.centroid() {
            Some(c) => c,
            None => return,
        };

        for point in &mut self.points {
            if let Some(ref mut normal) = point.normal {
                let to_point = point.position - centroid;
                if normal.dot(&to_point) < 0.0 {
                    *normal = -*normal;
                }
            }
        }
    }
}

impl FromIterator<CloudPoint> for PointSet {
    fn from_iter<I: IntoIterator<Item = CloudPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

/// A mesh vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    /// 3D position.
    pub position: Point3<f64>,

    /// Unit normal, if computed.
    pub normal: Option<Vector3<f64>>,
}

impl Vertex {
    /// Create a vertex with only position set.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
        }
    }

    /// Create a vertex from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }
}

/// A triangle mesh with indexed vertices and faces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex data.
    pub vertices: Vec<Vertex>,

    /// Triangle faces as indices into the vertex array.
    /// Each face is [v0, v1, v2] with counter-clockwise winding seen from outside.
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
        }
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(vertex_count: usize, face_count: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertex_count),
            faces: Vec::with_capacity(face_count),
        }
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of faces (triangles) in the mesh.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if mesh is empty (no vertices or faces).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Compute the axis-aligned bounding box.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.vertices.first()?.position;
        let (mut min, mut max) = (first, first);
        for vertex in &self.vertices[1..] {
            let p = &vertex.position;
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }
        Some((min, max))
    }

    /// True when every face index is in range and each face has three
    /// distinct vertices.
    pub fn validate_indices(&self) -> bool {
        let n = self.vertices.len() as u64;
        self.faces.iter().all(|&[a, b, c]| {
            (a as u64) < n && (b as u64) < n && (c as u64) < n && a != b && b != c && a != c
        })
    }

    /// Recompute per-vertex normals from area-weighted face normals.
    ///
    /// Vertices not referenced by any non-degenerate face end up with `None`.
    pub fn compute_vertex_normals(&mut self) {
        let mut accum: Vec<Vector3<f64>> = vec![Vector3::zeros(); self.vertices.len()];

        for face in &self.faces {
            let [a, b, c] = face.map(|i| self.vertices[i as usize].position);
            // Length is twice the triangle area.
            let weighted = (b - a).cross(&(c - a));
            for &i in face {
                accum[i as usize] += weighted;
            }
        }

        for (vertex, n) in self.vertices.iter_mut().zip(accum) {
            let len_sq = n.norm_squared();
            vertex.normal = (len_sq > f64::EPSILON * f64::EPSILON).then(|| n / len_sq.sqrt());
        }
    }

    /// Drop the flagged vertices and every face touching one, compacting
    /// indices. Returns the number of vertices removed.
    pub fn remove_vertices(&mut self, remove: &[bool]) -> usize {
        debug_assert_eq!(remove.len(), self.vertices.len());

        let mut remap = vec![u32::MAX; self.vertices.len()];
        let mut kept = Vec::with_capacity(self.vertices.len());
        for (i, vertex) in self.vertices.drain(..).enumerate() {
            if !remove.get(i).copied().unwrap_or(false) {
                remap[i] = kept.len() as u32;
                kept.push(vertex);
            }
        }
        let removed = remap.len() - kept.len();
        self.vertices = kept;

        self.faces.retain_mut(|face| {
            let mapped = face.map(|i| remap[i as usize]);
            if mapped.contains(&u32::MAX) {
                return false;
            }
            *face = mapped;
            true
        });

        removed
    }
}
