//! Density estimates for output vertices and low-density trimming.

use nalgebra::Point3;
use rayon::prelude::*;
use tracing::{debug, warn};

use super::octree::Octree;
use crate::types::Mesh;

/// Sample density around each unit-cube position.
///
/// The density is the sample count of the deepest node containing the
/// position, looking no deeper than `reference_depth`, expressed per
/// reference-depth cube (a coarser node's count is divided by the number of
/// reference cubes it spans).
pub fn vertex_densities(
    octree: &Octree,
    positions: &[Point3<f64>],
    reference_depth: u8,
) -> Vec<f64> {
    positions
        .par_iter()
        .map(|p| {
            let node = octree.node(octree.locate(p, reference_depth));
            let coarsening = reference_depth.saturating_sub(node.depth) as i32;
            node.samples as f64 / 8f64.powi(coarsening)
        })
        .collect()
}

/// Value at quantile `q` in `[0, 1]` (lower nearest rank).
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let rank = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).floor() as usize;
    Some(sorted[rank])
}

/// Remove vertices whose density is below `threshold` or below the
/// `quantile_cut` quantile, together with their faces, then drop vertices
/// left without faces. `densities` is compacted alongside the mesh.
///
/// Returns the number of vertices removed.
pub fn trim_low_density(
    mesh: &mut Mesh,
    densities: &mut Vec<f64>,
    threshold: f64,
    quantile_cut: Option<f64>,
) -> usize {
    let quantile_value = quantile_cut.and_then(|q| quantile(densities, q));
    let cutoff = threshold.max(quantile_value.unwrap_or(0.0));
    if cutoff <= 0.0 || mesh.vertices.is_empty() {
        return 0;
    }

    let low: Vec<bool> = densities.iter().map(|&d| d < cutoff).collect();
    let mut removed = remove_with_densities(mesh, densities, &low);

    let mut referenced = vec![false; mesh.vertices.len()];
    for face in &mesh.faces {
        for &v in face {
            referenced[v as usize] = true;
        }
    }
    let orphans: Vec<bool> = referenced.iter().map(|r| !r).collect();
    removed += remove_with_densities(mesh, densities, &orphans);

    debug!(
        cutoff = cutoff,
        removed = removed,
        remaining = mesh.vertex_count(),
        "Trimmed low-density vertices"
    );
    if mesh.faces.is_empty() {
        warn!(cutoff = cutoff, "Density trimming removed every face");
    }
    removed
}

fn remove_with_densities(mesh: &mut Mesh, densities: &mut Vec<f64>, remove: &[bool]) -> usize {
    if !remove.iter().any(|&r| r) {
        return 0;
    }
    let mut flags = remove.iter();
    densities.retain(|_| !flags.next().copied().unwrap_or(false));
    mesh.remove_vertices(remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poisson::octree::{OctreeParams, Sample};
    use crate::types::Vertex;
    use nalgebra::Vector3;

    fn strip() -> Mesh {
        // Four triangles in a row over vertices 0..6.
        let mut mesh = Mesh::new();
        for i in 0..6 {
            mesh.vertices
                .push(Vertex::from_coords((i / 2) as f64, (i % 2) as f64, 0.0));
        }
        mesh.faces = vec![[0, 1, 2], [1, 3, 2], [2, 3, 4], [3, 5, 4]];
        mesh
    }

    #[test]
    fn test_quantile() {
        let values = [5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(quantile(&values, 0.0), Some(1.0));
        assert_eq!(quantile(&values, 0.5), Some(3.0));
        assert_eq!(quantile(&values, 1.0), Some(5.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_zero_threshold_is_noop() {
        let mut mesh = strip();
        let mut densities = vec![0.0; 6];
        assert_eq!(trim_low_density(&mut mesh, &mut densities, 0.0, None), 0);
        assert_eq!(mesh.face_count(), 4);
    }

    #[test]
    fn test_threshold_trims_and_compacts() {
        let mut mesh = strip();
        let mut densities = vec![9.0, 9.0, 9.0, 9.0, 0.5, 9.0];
        let removed = trim_low_density(&mut mesh, &mut densities, 1.0, None);

        // Vertex 4 goes, then vertex 5 is orphaned.
        assert_eq!(removed, 2);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(densities.len(), 4);
        assert_eq!(mesh.faces, vec![[0, 1, 2], [1, 3, 2]]);
        assert!(mesh.validate_indices());
    }

    #[test]
    fn test_quantile_cut() {
        let mut mesh = strip();
        let mut densities = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        trim_low_density(&mut mesh, &mut densities, 0.0, Some(0.2));
        // The 0.2 quantile is 2.0, so only vertex 0 is below it.
        assert!(densities.iter().all(|&d| d >= 2.0));
        assert_eq!(mesh.face_count(), 3);
    }

    #[test]
    fn test_vertex_densities_scale_with_depth() {
        let samples: Vec<Sample> = (0..16)
            .map(|i| Sample {
                position: Point3::new(0.1 + 0.001 * i as f64, 0.1, 0.1),
                normal: Vector3::x(),
            })
            .collect();
        let tree = Octree::build(
            &samples,
            &OctreeParams {
                max_depth: 4,
                full_depth: 1,
                samples_per_node: 1.5,
            },
        );
        let d = vertex_densities(
            &tree,
            &[Point3::new(0.11, 0.1, 0.1), Point3::new(0.9, 0.9, 0.9)],
            3,
        );
        assert_eq!(d[0], 16.0);
        assert!(d[1] == 0.0);
    }
}
