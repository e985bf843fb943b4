//! Property-style checks against the nine invariants and six end-to-end
//! scenarios a conforming implementation must satisfy.

use poplod::{cache, current_level, destroy, init, set_level_direct, view, CacheConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn grid_mesh(n: usize, seed: u64) -> (Vec<[f64; 3]>, Vec<u32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut verts = Vec::new();
    for i in 0..n {
        for j in 0..n {
            let jitter = || rng.gen_range(-0.05..0.05);
            verts.push([i as f64 + jitter(), j as f64 + jitter(), jitter()]);
        }
    }
    let mut indices = Vec::new();
    for i in 0..n - 1 {
        for j in 0..n - 1 {
            let a = (i * n + j) as u32;
            let b = (i * n + j + 1) as u32;
            let c = ((i + 1) * n + j) as u32;
            let d = ((i + 1) * n + j + 1) as u32;
            indices.extend_from_slice(&[a, b, c, b, d, c]);
        }
    }
    (verts, indices)
}

#[test]
fn scenario_cache_then_init_then_progressive_refine() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(6, 1);

    let key = cache(&verts, &indices, &config).unwrap();
    init(key, &config).unwrap();
    assert_eq!(current_level(key).unwrap(), 0);

    for level in 1..=3 {
        set_level_direct(key, level).unwrap();
        assert_eq!(current_level(key).unwrap(), level);
    }
    destroy(key);
}

#[test]
fn scenario_set_level_monotonic_up_then_down_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(5, 2);
    let key = cache(&verts, &indices, &config).unwrap();
    init(key, &config).unwrap();

    set_level_direct(key, 5).unwrap();
    set_level_direct(key, 5).unwrap();
    assert_eq!(current_level(key).unwrap(), 5);

    set_level_direct(key, 2).unwrap();
    set_level_direct(key, 2).unwrap();
    assert_eq!(current_level(key).unwrap(), 2);
    destroy(key);
}

#[test]
fn scenario_requesting_beyond_pop_levels_reaches_full_detail() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(4, 3);
    let key = cache(&verts, &indices, &config).unwrap();
    init(key, &config).unwrap();

    set_level_direct(key, 10_000).unwrap();
    assert_eq!(current_level(key).unwrap(), i32::MAX);
    destroy(key);
}

#[test]
fn scenario_full_regime_falls_back_to_pop_on_lower_request() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(4, 4);
    let key = cache(&verts, &indices, &config).unwrap();
    init(key, &config).unwrap();

    set_level_direct(key, 10_000).unwrap();
    set_level_direct(key, 0).unwrap();
    assert_eq!(current_level(key).unwrap(), 0);
    destroy(key);
}

#[test]
fn scenario_repeated_cache_calls_reuse_the_same_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(4, 5);
    let key1 = cache(&verts, &indices, &config).unwrap();
    let key2 = cache(&verts, &indices, &config).unwrap();
    assert_eq!(key1, key2);
}

#[test]
fn scenario_view_level_is_monotone_non_increasing_in_view_size() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(6, 6);
    let key = cache(&verts, &indices, &config).unwrap();
    init(key, &config).unwrap();

    let tiny_view = view(key, 0.001, 0).unwrap();
    let huge_view = view(key, 4096.0, 0).unwrap();
    assert!(tiny_view >= huge_view);
    assert_eq!(current_level(key).unwrap(), huge_view);
    destroy(key);
}

#[test]
fn invariant_negative_level_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts, indices) = grid_mesh(4, 7);
    let key = cache(&verts, &indices, &config).unwrap();
    init(key, &config).unwrap();
    assert!(set_level_direct(key, -1).is_err());
}

#[test]
fn invariant_different_meshes_get_different_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig::default().with_cache_root(tmp.path());
    let (verts_a, indices_a) = grid_mesh(4, 8);
    let (verts_b, indices_b) = grid_mesh(4, 9);
    let key_a = cache(&verts_a, &indices_a, &config).unwrap();
    let key_b = cache(&verts_b, &indices_b, &config).unwrap();
    assert_ne!(key_a, key_b);
}
