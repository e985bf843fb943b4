//! Public façade: a small set of free functions mirroring the reference
//! implementation's `bg_mesh_lod_*` C ABI (§6), backed by a process-wide
//! registry of open [`LodHandle`]s keyed by content hash.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::{info, warn};

use crate::bounds::{BoundsProvider, TightBounds};
use crate::cache::{self, CacheRoot, DefaultCacheRoot};
use crate::characterize::characterize;
use crate::config::CacheConfig;
use crate::state::{DrawCallback, LodHandle};
use crate::vertex::DecodePosition;
use crate::{Error, Result};

fn registry() -> &'static Mutex<HashMap<u64, LodHandle>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, LodHandle>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Characterize `vertices`/`indices` and write a cache entry for them if one
/// does not already exist, returning its content-hash key.
///
/// Equivalent to the reference `bg_mesh_lod_cache()`.
pub fn cache<T: DecodePosition>(
    vertices: &[T],
    indices: &[u32],
    config: &CacheConfig,
) -> Result<u64> {
    try_cache(vertices, indices, config, &DefaultCacheRoot)
}

/// As [`cache`], but with an explicit cache-root provider (for tests and
/// embedders that redirect cache storage).
pub fn try_cache<T: DecodePosition>(
    vertices: &[T],
    indices: &[u32],
    config: &CacheConfig,
    provider: &dyn CacheRoot,
) -> Result<u64> {
    let positions: Vec<[f64; 3]> = vertices.iter().map(|v| v.decode_position()).collect();
    let key = cache::hash_mesh(&positions, indices);

    let root = cache::resolve_root(config, provider)?;
    if cache::entry_exists(&root, key) {
        return Ok(key);
    }

    let mesh = characterize(vertices, indices, config)?;
    let (bbox_min, bbox_max) = TightBounds.bounds(vertices);
    cache::write_entry(&root, key, &mesh, &positions, indices, bbox_min, bbox_max)?;
    info!(key = %format!("{key:016x}"), "wrote new cache entry");
    Ok(key)
}

/// Open a cache entry for rendering. Equivalent to `bg_mesh_lod_init()`.
pub fn init(key: u64, config: &CacheConfig) -> Result<()> {
    init_with_root(key, config, &DefaultCacheRoot)
}

pub fn init_with_root(key: u64, config: &CacheConfig, provider: &dyn CacheRoot) -> Result<()> {
    let handle = LodHandle::open_with_root(key, config, provider)?;
    registry().lock().unwrap().insert(key, handle);
    Ok(())
}

/// Drop the in-memory state for a cache entry. Equivalent to
/// `bg_mesh_lod_destroy()`. A no-op if `key` is not currently open.
pub fn destroy(key: u64) {
    registry().lock().unwrap().remove(&key);
}

/// Compute the level for `view_size` (a proxy for viewing distance),
/// apply `scale_offset`, clamp to `[0, LEVELS - 1]`, load it, and return it
/// (§4.5). Equivalent to `bg_mesh_lod_view()`.
pub fn view(key: u64, view_size: f64, scale_offset: i32) -> Result<i32> {
    with_handle_mut(key, |handle| {
        let level = (handle.get_level(view_size) + scale_offset)
            .clamp(0, crate::quantize::LEVELS as i32 - 1);
        handle.set_level(level)?;
        Ok(level)
    })
}

/// Directly set the active level. Equivalent to `bg_mesh_lod_level()`.
pub fn set_level_direct(key: u64, level: i32) -> Result<()> {
    with_handle_mut(key, |handle| handle.set_level(level))
}

/// The level a handle is currently rendering at. Equivalent to
/// `bg_mesh_lod_update()`'s read-back path.
pub fn current_level(key: u64) -> Result<i32> {
    with_handle(key, |handle| Ok(handle.current_level()))
}

/// Install a draw callback for `key`. Equivalent to
/// `bg_mesh_lod_set_draw_callback()`.
pub fn install_callback(key: u64, callback: DrawCallback) -> Result<()> {
    with_handle_mut(key, |handle| {
        handle.install_callback(callback);
        Ok(())
    })
}

/// Invoke the installed draw callback, if any, passing `mode` through
/// opaquely. Equivalent to `bg_mesh_lod_draw()`.
pub fn draw(key: u64, mode: i32) -> Result<Option<i32>> {
    with_handle_mut(key, |handle| Ok(handle.draw(mode)))
}

/// Remove an on-disk cache entry. A logging stub: no eviction policy is
/// implemented, it simply deletes the named entry on request (§9).
pub fn clear_cache(key: u64, config: &CacheConfig) -> Result<()> {
    clear_cache_with_root(key, config, &DefaultCacheRoot)
}

pub fn clear_cache_with_root(key: u64, config: &CacheConfig, provider: &dyn CacheRoot) -> Result<()> {
    let root = cache::resolve_root(config, provider)?;
    let dir = cache::entry_dir(&root, key);
    if !dir.is_dir() {
        warn!(key = %format!("{key:016x}"), "clear_cache: no such entry");
        return Err(Error::CacheAbsent(key));
    }
    std::fs::remove_dir_all(&dir)?;
    info!(key = %format!("{key:016x}"), "cleared cache entry");
    Ok(())
}

fn with_handle<R>(key: u64, f: impl FnOnce(&LodHandle) -> Result<R>) -> Result<R> {
    let registry = registry().lock().unwrap();
    let handle = registry.get(&key).ok_or(Error::CacheAbsent(key))?;
    f(handle)
}

fn with_handle_mut<R>(key: u64, f: impl FnOnce(&mut LodHandle) -> Result<R>) -> Result<R> {
    let mut registry = registry().lock().unwrap();
    let handle = registry.get_mut(&key).ok_or(Error::CacheAbsent(key))?;
    f(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mesh() -> (Vec<[f64; 3]>, Vec<u32>) {
        let mut verts = Vec::new();
        let mut indices = Vec::new();
        for i in 0..6u32 {
            let t = f64::from(i);
            verts.push([t, 0.0, 0.0]);
            verts.push([t, 1.0, 0.0]);
            verts.push([t, 0.0, 1.0]);
            indices.push(3 * i);
            indices.push(3 * i + 1);
            indices.push(3 * i + 2);
        }
        (verts, indices)
    }

    #[test]
    fn cache_is_idempotent_on_repeated_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_root(tmp.path());
        let (verts, indices) = sample_mesh();
        let key1 = cache(&verts, &indices, &config).unwrap();
        let key2 = cache(&verts, &indices, &config).unwrap();
        assert_eq!(key1, key2);
    }

    #[test]
    fn init_destroy_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_root(tmp.path());
        let (verts, indices) = sample_mesh();
        let key = cache(&verts, &indices, &config).unwrap();

        init(key, &config).unwrap();
        assert_eq!(current_level(key).unwrap(), 0);
        destroy(key);
        assert!(matches!(current_level(key), Err(Error::CacheAbsent(_))));
    }

    #[test]
    fn operating_on_unopened_key_is_cache_absent() {
        assert!(matches!(current_level(0x1234), Err(Error::CacheAbsent(_))));
        assert!(matches!(set_level_direct(0x1234, 0), Err(Error::CacheAbsent(_))));
    }

    #[test]
    fn clear_cache_removes_entry_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_root(tmp.path());
        let (verts, indices) = sample_mesh();
        let key = cache(&verts, &indices, &config).unwrap();
        clear_cache(key, &config).unwrap();
        assert!(matches!(
            LodHandle::open(key, &config),
            Err(Error::CacheAbsent(_))
        ));
    }
}
