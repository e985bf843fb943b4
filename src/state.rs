//! Per-handle runtime state: incremental POP loading, the POP/full regime
//! switch, and draw dispatch (§4.4).

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::cache::{self, CacheRoot, DefaultCacheRoot};
use crate::config::CacheConfig;
use crate::quantize::{Quantizer, LEVELS};
use crate::{Error, Result};

/// Non-owning reference to a cache entry, used instead of a raw back-pointer
/// in callback payloads (§9's cyclic-relation note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LodId(pub u64);

/// Which storage regime a handle is currently rendering from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    /// Rendering from per-level POP buffers loaded on demand up to `curr_level`.
    Pop,
    /// Rendering from the full, unquantized `all_verts`/`all_faces` buffers.
    Full,
}

/// Payload handed to the draw callback for one draw call (§6).
pub struct DrawInfo<'a> {
    /// Unused by this core; always `0`.
    pub face_set_count: u32,
    /// Unused by this core; always `None`.
    pub face_set: Option<&'a [u32]>,
    pub face_count: usize,
    /// Flat triangle-index buffer, three entries per triangle.
    pub triangles: &'a [u32],
    /// Flat, unquantized vertex buffer, three floats per vertex.
    pub points_orig: &'a [f64],
    /// Flat vertex buffer the renderer should draw: snapped in POP regime,
    /// identical to `points_orig` in Full regime.
    pub points: &'a [f64],
    /// Always `None`; this core does not compute normals.
    pub face_normals: Option<&'a [f64]>,
    pub vertex_normals: Option<&'a [f64]>,
    /// Opaque pass-through from the caller.
    pub mode: i32,
    pub lod: LodId,
}

/// A single draw callback slot. `Send` (cache state may be handed across a
/// thread boundary) but deliberately not `Sync` — concurrent calls into one
/// handle are not supported (§5).
pub type DrawCallback = Box<dyn FnMut(&DrawInfo<'_>) -> i32 + Send>;

/// Live, mutable state for one cached mesh: which levels are loaded, the
/// current regime, and the installed draw callback.
pub struct LodHandle {
    key: u64,
    dir: PathBuf,
    quantizer: Quantizer,
    max_pop_level: u8,

    /// `level_vert_counts[ℓ]`/`level_tri_counts[ℓ]`: vertex and triangle
    /// counts contributed by level `ℓ`, read once from each per-level file's
    /// header at `open`. Only the counts are kept resident — not the vertex
    /// or triangle payloads — so a down-trim knows exactly where to truncate
    /// without re-reading, and an up-load knows nothing about a level until
    /// it actually reads that level's file.
    level_vert_counts: Vec<usize>,
    level_tri_counts: Vec<usize>,

    regime: Regime,
    verts_world: Vec<f64>,
    verts_snapped: Vec<f64>,
    tris: Vec<u32>,
    /// Highest pop level currently materialized, meaningful only in
    /// `Regime::Pop`. `-1` before any level has been loaded.
    curr_level: i32,

    callback: Option<DrawCallback>,
}

impl LodHandle {
    /// Open an existing cache entry and load its coarsest (level 0) POP
    /// buffers (§4.4 steps 1-4).
    pub fn open(key: u64, config: &CacheConfig) -> Result<Self> {
        Self::open_with_root(key, config, &DefaultCacheRoot)
    }

    pub fn open_with_root(key: u64, config: &CacheConfig, provider: &dyn CacheRoot) -> Result<Self> {
        let root = cache::resolve_root(config, provider)?;
        let dir = cache::entry_dir(&root, key);
        if !dir.is_dir() {
            return Err(Error::CacheAbsent(key));
        }

        cache::read_format(&dir)?;
        let minmax = cache::read_minmax(&dir)?;
        let quantizer = Quantizer::new(minmax.qmin, minmax.qmax);
        let max_pop_level = cache::discover_max_pop_level(&dir);

        let mut level_vert_counts = Vec::with_capacity(max_pop_level as usize + 1);
        let mut level_tri_counts = Vec::with_capacity(max_pop_level as usize + 1);
        for level in 0..=max_pop_level as usize {
            level_vert_counts.push(cache::read_level_vert_count(&dir, level)?);
            level_tri_counts.push(cache::read_level_tri_count(&dir, level)?);
        }

        let mut handle = Self {
            key,
            dir,
            quantizer,
            max_pop_level,
            level_vert_counts,
            level_tri_counts,
            regime: Regime::Pop,
            verts_world: Vec::new(),
            verts_snapped: Vec::new(),
            tris: Vec::new(),
            curr_level: -1,
            callback: None,
        };
        handle.load_pop_prefix(0)?;
        debug!(key = %format!("{key:016x}"), max_pop_level, "opened lod handle");
        Ok(handle)
    }

    pub fn id(&self) -> LodId {
        LodId(self.key)
    }

    /// Current level: `-1` before anything is loaded (never observed after
    /// `open`), `0..=max_pop_level` in POP regime, `i32::MAX` in Full regime.
    pub fn current_level(&self) -> i32 {
        match self.regime {
            Regime::Pop => self.curr_level,
            Regime::Full => i32::MAX,
        }
    }

    pub fn max_pop_level(&self) -> u8 {
        self.max_pop_level
    }

    /// The coarsest level whose grid-cell diagonal is below a threshold
    /// scaled by `view_size` (§4.4). Does not change loaded state.
    pub fn get_level(&self, view_size: f64) -> i32 {
        let dx = self.quantizer.qmax[0] - self.quantizer.qmin[0];
        let dy = self.quantizer.qmax[1] - self.quantizer.qmin[1];
        let dz = self.quantizer.qmax[2] - self.quantizer.qmin[2];
        let bdiag = (dx * dx + dy * dy + dz * dz).sqrt();
        let delta = 0.01 * view_size;
        for level in 0..LEVELS {
            if bdiag / f64::from(1u32 << level) < delta {
                return level as i32;
            }
        }
        (LEVELS - 1) as i32
    }

    /// Transition to `target`, one of the five cases in §4.4's table:
    /// POP-up, POP-down, POP-to-full, full-to-POP, or no-op.
    pub fn set_level(&mut self, target: i32) -> Result<()> {
        if target < 0 {
            return Err(Error::invalid_input("target level must be non-negative"));
        }

        if target == self.current_level() {
            trace!(target, "set_level no-op, already at target");
            return Ok(());
        }

        match self.regime {
            Regime::Full => {
                if target > self.max_pop_level as i32 {
                    trace!(target, "already in full regime, no-op");
                    return Ok(());
                }
                self.load_pop_prefix(target)?;
            }
            Regime::Pop => {
                if target > self.max_pop_level as i32 {
                    self.load_full()?;
                } else if target > self.curr_level {
                    self.append_pop_levels(self.curr_level, target)?;
                } else {
                    self.trim_pop_down(target);
                }
            }
        }
        debug!(level = self.current_level(), "set_level complete");
        Ok(())
    }

    /// Discard everything and reload levels `0..=target` from their
    /// per-level cache files, for a Full→POP transition (§4.4).
    fn load_pop_prefix(&mut self, target: i32) -> Result<()> {
        self.verts_world.clear();
        self.verts_world.shrink_to_fit();
        self.tris.clear();
        self.tris.shrink_to_fit();
        self.curr_level = -1;
        self.regime = Regime::Pop;
        self.append_pop_levels(-1, target)
    }

    /// Read levels `(from, to]` from their per-level cache files and append
    /// them onto the current buffers, then re-snap the whole of
    /// `verts_world` at `to` (§4.4's POP-up case).
    fn append_pop_levels(&mut self, from: i32, to: i32) -> Result<()> {
        for level in (from + 1)..=to {
            let level = level as usize;
            if let Some(extra) = cache::read_level_verts(&self.dir, level)? {
                self.verts_world.extend_from_slice(&extra);
            }
            if let Some(extra) = cache::read_level_tris(&self.dir, level)? {
                self.tris.extend_from_slice(&extra);
            }
        }
        self.curr_level = to;
        self.resnap();
        Ok(())
    }

    /// Truncate `verts_world`/`tris` down to the prefix belonging to levels
    /// `[0, target]` and release the memory above it back to the allocator,
    /// then re-snap (§4.4's POP-down case).
    fn trim_pop_down(&mut self, target: i32) {
        self.verts_world.truncate(self.vert_float_prefix_len(target));
        self.verts_world.shrink_to_fit();
        self.tris.truncate(self.tri_index_prefix_len(target));
        self.tris.shrink_to_fit();
        self.curr_level = target;
        self.resnap();
    }

    /// Number of `f64`s belonging to levels `[0, through_level]`.
    fn vert_float_prefix_len(&self, through_level: i32) -> usize {
        if through_level < 0 {
            return 0;
        }
        self.level_vert_counts[..=through_level as usize].iter().sum::<usize>() * 3
    }

    /// Number of `u32` triangle indices belonging to levels `[0, through_level]`.
    fn tri_index_prefix_len(&self, through_level: i32) -> usize {
        if through_level < 0 {
            return 0;
        }
        self.level_tri_counts[..=through_level as usize].iter().sum::<usize>() * 3
    }

    fn resnap(&mut self) {
        let level = self.curr_level.max(0) as usize;
        self.verts_snapped.clear();
        self.verts_snapped.reserve(self.verts_world.len());
        for chunk in self.verts_world.chunks_exact(3) {
            let snapped = self.quantizer.snap([chunk[0], chunk[1], chunk[2]], level);
            self.verts_snapped.extend_from_slice(&snapped);
        }
        self.verts_snapped.shrink_to_fit();
    }

    fn load_full(&mut self) -> Result<()> {
        self.verts_world = cache::read_all_verts(&self.dir)?;
        self.tris = cache::read_all_faces(&self.dir)?;
        self.verts_snapped.clear();
        self.verts_snapped.shrink_to_fit();
        self.regime = Regime::Full;
        debug!("switched to full regime");
        Ok(())
    }

    /// Install (or replace) the draw callback for this handle.
    pub fn install_callback(&mut self, callback: DrawCallback) {
        self.callback = Some(callback);
    }

    /// Invoke the installed callback with the currently loaded buffers.
    /// Returns `None` if no callback is installed. The callback is taken out
    /// of its slot for the duration of the call so a callback that re-enters
    /// `draw` on the same handle cannot observe or invoke itself (§5).
    pub fn draw(&mut self, mode: i32) -> Option<i32> {
        let mut callback = self.callback.take()?;
        let points = match self.regime {
            Regime::Pop => &self.verts_snapped,
            Regime::Full => &self.verts_world,
        };
        let info = DrawInfo {
            face_set_count: 0,
            face_set: None,
            face_count: self.tris.len() / 3,
            triangles: &self.tris,
            points_orig: &self.verts_world,
            points,
            face_normals: None,
            vertex_normals: None,
            mode,
            lod: self.id(),
        };
        let result = callback(&info);
        self.callback = Some(callback);
        Some(result)
    }

    /// Write the currently loaded geometry as a plain-text OBJ file, for
    /// debugging what a given level actually looks like.
    pub fn plot(&self, path: &std::path::Path) -> Result<()> {
        use std::io::Write;
        let mut f = std::fs::File::create(path)?;
        let points = match self.regime {
            Regime::Pop => &self.verts_snapped,
            Regime::Full => &self.verts_world,
        };
        for chunk in points.chunks_exact(3) {
            writeln!(f, "v {} {} {}", chunk[0], chunk[1], chunk[2])?;
        }
        for tri in self.tris.chunks_exact(3) {
            writeln!(f, "f {} {} {}", tri[0] + 1, tri[1] + 1, tri[2] + 1)?;
        }
        Ok(())
    }

    pub fn vertex_count(&self) -> usize {
        self.verts_world.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.tris.len() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{hash_mesh, write_entry};
    use crate::characterize::characterize;

    fn sample_mesh() -> (Vec<[f64; 3]>, Vec<u32>) {
        let mut verts = Vec::new();
        let mut indices = Vec::new();
        let n = 6;
        for i in 0..n {
            let t = i as f64;
            verts.push([t, 0.0, 0.0]);
            verts.push([t, 1.0, 0.0]);
            verts.push([t, 0.0, 1.0]);
            indices.push((3 * i) as u32);
            indices.push((3 * i + 1) as u32);
            indices.push((3 * i + 2) as u32);
        }
        (verts, indices)
    }

    fn open_test_handle() -> (tempfile::TempDir, LodHandle, u64) {
        let tmp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default();
        let (verts, indices) = sample_mesh();
        let mesh = characterize(&verts, &indices, &config).unwrap();
        let key = hash_mesh(&verts, &indices);
        write_entry(tmp.path(), key, &mesh, &verts, &indices, [0.0; 3], [5.0, 1.0, 1.0]).unwrap();

        let config = config.with_cache_root(tmp.path());
        let handle = LodHandle::open(key, &config).unwrap();
        (tmp, handle, key)
    }

    #[test]
    fn open_loads_level_zero() {
        let (_tmp, handle, _key) = open_test_handle();
        assert_eq!(handle.current_level(), 0);
        assert!(handle.triangle_count() > 0);
        assert_eq!(handle.verts_world.len(), handle.verts_snapped.len());
    }

    #[test]
    fn set_level_up_then_down_round_trips_vertex_count() {
        let (_tmp, mut handle, _key) = open_test_handle();
        let max = handle.max_pop_level() as i32;
        handle.set_level(max).unwrap();
        let verts_at_max = handle.vertex_count();
        handle.set_level(0).unwrap();
        assert!(handle.vertex_count() <= verts_at_max);
        handle.set_level(max).unwrap();
        assert_eq!(handle.vertex_count(), verts_at_max);
    }

    #[test]
    fn set_level_beyond_max_switches_to_full_regime() {
        let (_tmp, mut handle, _key) = open_test_handle();
        let beyond = handle.max_pop_level() as i32 + 5;
        handle.set_level(beyond).unwrap();
        assert_eq!(handle.current_level(), i32::MAX);
        assert_eq!(handle.triangle_count(), 6);
        assert!(handle.verts_snapped.is_empty());
    }

    #[test]
    fn full_regime_back_to_pop_restores_partial_geometry() {
        let (_tmp, mut handle, _key) = open_test_handle();
        let beyond = handle.max_pop_level() as i32 + 5;
        handle.set_level(beyond).unwrap();
        handle.set_level(0).unwrap();
        assert_eq!(handle.current_level(), 0);
        assert_eq!(handle.verts_world.len(), handle.verts_snapped.len());
    }

    #[test]
    fn draw_without_callback_returns_none() {
        let (_tmp, mut handle, _key) = open_test_handle();
        assert!(handle.draw(0).is_none());
    }

    #[test]
    fn draw_invokes_installed_callback_with_current_buffers() {
        let (_tmp, mut handle, key) = open_test_handle();
        handle.install_callback(Box::new(move |info| {
            assert_eq!(info.lod, LodId(key));
            assert_eq!(info.points.len(), info.points_orig.len());
            7
        }));
        assert_eq!(handle.draw(0), Some(7));
    }

    #[test]
    fn get_level_is_monotone_non_increasing_in_view_size() {
        let (_tmp, handle, _key) = open_test_handle();
        let small = handle.get_level(0.01);
        let large = handle.get_level(1000.0);
        assert!(small >= large);
    }

    #[test]
    fn open_missing_key_is_cache_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_root(tmp.path());
        let err = LodHandle::open(0xdead_beef, &config).unwrap_err();
        assert!(matches!(err, Error::CacheAbsent(_)));
    }
}
