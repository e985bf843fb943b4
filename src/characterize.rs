//! One-time preprocessing: assigns every triangle a pop level, every vertex
//! its minimum needed level, and derives the level-respecting vertex
//! reordering and the POP/full threshold (§4.2).

use std::collections::BTreeSet;

use crate::config::CacheConfig;
use crate::quantize::{Quantizer, LEVELS};
use crate::vertex::DecodePosition;
use crate::Error;

/// Result of characterizing a mesh: per-triangle levels, per-vertex minimum
/// levels, the reordering, and the threshold beyond which POP storage stops.
pub struct CharacterizedMesh {
    /// `vert_min_level[i]` is the smallest level at which original vertex `i`
    /// is first referenced by a stored triangle.
    pub vert_min_level: Vec<u8>,

    /// `level_tris[level]` holds original triangle indices whose pop level is
    /// exactly `level`, in first-encountered order. A partition of
    /// `0..triangle_count`.
    pub level_tris: Vec<Vec<u32>>,

    /// `level_tri_verts[level]` holds original vertex indices first needed at
    /// `level`, ascending. A partition of `0..vertex_count`.
    pub level_tri_verts: Vec<Vec<u32>>,

    /// `vert_reorder[i]` is the position of original vertex `i` in the
    /// level-respecting global ordering.
    pub vert_reorder: Vec<u32>,

    /// Smallest level beyond which per-level POP files are not worth
    /// writing; see §4.2 step 5 and §9's note on the saturation edge case.
    pub tri_threshold: u8,

    /// Padded quantization bounds used to characterize and later re-snap.
    pub qmin: [f64; 3],
    pub qmax: [f64; 3],
}

/// Run the full characterization pipeline over `vertices`/`indices`.
///
/// `indices` is a flat triangle-index buffer, three entries per triangle.
pub fn characterize<T: DecodePosition>(
    vertices: &[T],
    indices: &[u32],
    config: &CacheConfig,
) -> crate::Result<CharacterizedMesh> {
    if vertices.is_empty() || indices.is_empty() {
        return Err(Error::invalid_input(
            "vertex and index arrays must be non-empty",
        ));
    }
    if indices.len() % 3 != 0 {
        return Err(Error::invalid_input(
            "index buffer length must be a multiple of 3",
        ));
    }

    let vert_cnt = vertices.len();
    let tri_cnt = indices.len() / 3;

    let positions: Vec<[f64; 3]> = vertices.iter().map(|v| v.decode_position()).collect();

    let (qmin, qmax) = tight_quantization_bounds(&positions, config.bump_factor);
    let quantizer = Quantizer::new(qmin, qmax);

    let mut vert_min_level = vec![(LEVELS - 1) as u8; vert_cnt];
    let mut level_tris: Vec<Vec<u32>> = vec![Vec::new(); LEVELS];

    for tri in 0..tri_cnt {
        let idx = [
            indices[3 * tri] as usize,
            indices[3 * tri + 1] as usize,
            indices[3 * tri + 2] as usize,
        ];
        let tri_positions = [positions[idx[0]], positions[idx[1]], positions[idx[2]]];
        let recs = quantizer.quantize_tri(tri_positions);
        let level = quantizer.pop_level(recs[0], recs[1], recs[2]);

        level_tris[level].push(tri as u32);

        for &v in &idx {
            if (vert_min_level[v] as usize) > level {
                vert_min_level[v] = level as u8;
            }
        }
    }

    let mut level_tri_verts_sets: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); LEVELS];
    for (v, &level) in vert_min_level.iter().enumerate() {
        level_tri_verts_sets[level as usize].insert(v as u32);
    }
    let level_tri_verts: Vec<Vec<u32>> = level_tri_verts_sets
        .into_iter()
        .map(|set| set.into_iter().collect())
        .collect();

    let mut vert_reorder = vec![0u32; vert_cnt];
    let mut next_index = 0u32;
    for verts in &level_tri_verts {
        for &v in verts {
            vert_reorder[v as usize] = next_index;
            next_index += 1;
        }
    }

    let tri_threshold = compute_tri_threshold(&level_tris, tri_cnt, config.threshold_fraction);

    Ok(CharacterizedMesh {
        vert_min_level,
        level_tris,
        level_tri_verts,
        vert_reorder,
        tri_threshold,
        qmin,
        qmax,
    })
}

fn tight_quantization_bounds(positions: &[[f64; 3]], bump_factor: f64) -> ([f64; 3], [f64; 3]) {
    let mut min = [f64::MAX; 3];
    let mut max = [f64::MIN; 3];
    for p in positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    let mut qmin = [0.0; 3];
    let mut qmax = [0.0; 3];
    for axis in 0..3 {
        qmin[axis] = min[axis] - (bump_factor * min[axis]).abs();
        qmax[axis] = max[axis] + (bump_factor * max[axis]).abs();
    }
    (qmin, qmax)
}

/// §4.2 step 5: find the smallest level whose cumulative triangle count
/// exceeds `threshold_fraction` of the total, backing off by one level if
/// that cumulative count is the entire mesh (the saturation edge case in §9).
fn compute_tri_threshold(level_tris: &[Vec<u32>], tri_cnt: usize, threshold_fraction: f64) -> u8 {
    let cutoff = (tri_cnt as f64) * threshold_fraction;
    let mut running = 0usize;
    for (level, tris) in level_tris.iter().enumerate() {
        running += tris.len();
        if (running as f64) > cutoff {
            return if running < tri_cnt {
                level as u8
            } else {
                level.saturating_sub(1) as u8
            };
        }
    }
    // Unreachable for tri_cnt > 0: the final level's cumulative count equals
    // tri_cnt, which always exceeds any fraction < 1.0 of itself.
    (LEVELS - 1) as u8
}
