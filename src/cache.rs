//! Content-addressed, format-versioned on-disk cache (§4.3).
//!
//! A cache entry lives at `<root>/<CACHE_SUBDIR>/<key as lowercase hex>/` and
//! either contains a complete set of files or does not exist at all —
//! writers skip existing directories rather than overwrite them, and readers
//! never observe a partially-written one (§3's "Ownership & lifecycle").

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

use crate::characterize::CharacterizedMesh;
use crate::config::CacheConfig;
use crate::quantize::LEVELS;
use crate::{Error, Result};

/// Fixed subfolder beneath the cache root that all entries live under.
pub const CACHE_SUBDIR: &str = ".poplod_cache";

/// Current on-disk format version. Bumped from the reference implementation's
/// implicit version 1 to fix the non-portable platform-`usize` counts on
/// `all_verts`/`all_faces` (§9).
pub const FORMAT_VERSION: u32 = 2;

/// Resolves the directory new cache entries should be written under. A
/// small trait, mirroring [`crate::bounds::BoundsProvider`], so embedders can
/// redirect the cache (tests, sandboxes) without forking the crate.
pub trait CacheRoot {
    fn root(&self) -> Result<PathBuf>;
}

/// Default `CacheRoot`: the host OS's standard cache directory convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheRoot;

impl CacheRoot for DefaultCacheRoot {
    fn root(&self) -> Result<PathBuf> {
        dirs::cache_dir().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine a platform cache directory",
            ))
        })
    }
}

/// Resolve the effective cache root: the config override if set, otherwise
/// the `CacheRoot` provider's answer. Resolved fresh on every call, never
/// cached in process state (§9).
pub fn resolve_root(config: &CacheConfig, provider: &dyn CacheRoot) -> Result<PathBuf> {
    match &config.cache_root_override {
        Some(path) => Ok(path.clone()),
        None => provider.root(),
    }
}

/// Stream the vertex bytes then the triangle-index bytes through a 64-bit,
/// non-cryptographic digest, in that order (§4.3).
pub fn hash_mesh(positions: &[[f64; 3]], indices: &[u32]) -> u64 {
    let mut hasher = Xxh3::new();
    for p in positions {
        for c in p {
            hasher.update(&c.to_le_bytes());
        }
    }
    for i in indices {
        hasher.update(&i.to_le_bytes());
    }
    hasher.digest()
}

pub fn entry_dir(root: &Path, key: u64) -> PathBuf {
    root.join(CACHE_SUBDIR).join(format!("{key:016x}"))
}

pub fn entry_exists(root: &Path, key: u64) -> bool {
    entry_dir(root, key).is_dir()
}

/// Write a complete cache entry. No-ops if the directory already exists
/// (writer contract: content-addressed writes are idempotent on success).
pub fn write_entry(
    root: &Path,
    key: u64,
    mesh: &CharacterizedMesh,
    positions: &[[f64; 3]],
    indices: &[u32],
    bbox_min: [f64; 3],
    bbox_max: [f64; 3],
) -> Result<()> {
    let dir = entry_dir(root, key);
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(&dir)?;

    write_format(&dir)?;
    write_minmax(&dir, bbox_min, bbox_max, mesh.qmin, mesh.qmax)?;

    for level in 0..=mesh.tri_threshold as usize {
        let verts = &mesh.level_tri_verts[level];
        if !verts.is_empty() {
            write_level_verts(&dir, level, verts, positions)?;
        }
        let tris = &mesh.level_tris[level];
        if !tris.is_empty() {
            write_level_tris(&dir, level, tris, indices, &mesh.vert_reorder)?;
        }
    }

    write_all_verts(&dir, positions)?;
    write_all_faces(&dir, indices)?;

    Ok(())
}

fn write_format(dir: &Path) -> Result<()> {
    let mut f = fs::File::create(dir.join("format"))?;
    writeln!(f, "{FORMAT_VERSION}")?;
    Ok(())
}

fn write_minmax(
    dir: &Path,
    bbox_min: [f64; 3],
    bbox_max: [f64; 3],
    qmin: [f64; 3],
    qmax: [f64; 3],
) -> Result<()> {
    let mut f = fs::File::create(dir.join("minmax"))?;
    for v in bbox_min.iter().chain(bbox_max.iter()) {
        f.write_all(&v.to_le_bytes())?;
    }
    for v in qmin.iter().chain(qmax.iter()) {
        f.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_level_verts(dir: &Path, level: usize, verts: &[u32], positions: &[[f64; 3]]) -> Result<()> {
    let mut f = fs::File::create(dir.join(format!("tri_verts_level_{level}")))?;
    let count = i32::try_from(verts.len())
        .map_err(|_| Error::InvalidInput("too many vertices for one level".into()))?;
    f.write_all(&count.to_le_bytes())?;
    for &v in verts {
        let p = positions[v as usize];
        for c in p {
            f.write_all(&c.to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_level_tris(
    dir: &Path,
    level: usize,
    tris: &[u32],
    indices: &[u32],
    vert_reorder: &[u32],
) -> Result<()> {
    let mut f = fs::File::create(dir.join(format!("tris_level_{level}")))?;
    let count = i32::try_from(tris.len())
        .map_err(|_| Error::InvalidInput("too many triangles for one level".into()))?;
    f.write_all(&count.to_le_bytes())?;
    for &t in tris {
        for k in 0..3 {
            let orig = indices[3 * t as usize + k];
            let reordered = vert_reorder[orig as usize] as i32;
            f.write_all(&reordered.to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_all_verts(dir: &Path, positions: &[[f64; 3]]) -> Result<()> {
    let mut f = fs::File::create(dir.join("all_verts"))?;
    let count = positions.len() as u64;
    f.write_all(&count.to_le_bytes())?;
    for p in positions {
        for c in p {
            f.write_all(&c.to_le_bytes())?;
        }
    }
    Ok(())
}

fn write_all_faces(dir: &Path, indices: &[u32]) -> Result<()> {
    let mut f = fs::File::create(dir.join("all_faces"))?;
    let count = (indices.len() / 3) as u64;
    f.write_all(&count.to_le_bytes())?;
    for &i in indices {
        f.write_all(&(i as i32).to_le_bytes())?;
    }
    Ok(())
}

// --- readers ---

pub fn read_format(dir: &Path) -> Result<()> {
    let text = fs::read_to_string(dir.join("format"))
        .map_err(|_| Error::CacheIncompatible("missing format marker".into()))?;
    let version: u32 = text
        .trim()
        .parse()
        .map_err(|_| Error::CacheIncompatible(format!("unparseable format marker: {text:?}")))?;
    if version != FORMAT_VERSION {
        return Err(Error::CacheIncompatible(format!(
            "unsupported cache format {version}, expected {FORMAT_VERSION}"
        )));
    }
    Ok(())
}

pub struct MinMax {
    pub bbox_min: [f64; 3],
    pub bbox_max: [f64; 3],
    pub qmin: [f64; 3],
    pub qmax: [f64; 3],
}

pub fn read_minmax(dir: &Path) -> Result<MinMax> {
    let bytes = fs::read(dir.join("minmax"))?;
    if bytes.len() != 12 * 8 {
        return Err(Error::CacheCorrupt(format!(
            "minmax file has {} bytes, expected {}",
            bytes.len(),
            12 * 8
        )));
    }
    let mut floats = [0f64; 12];
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        floats[i] = f64::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(MinMax {
        bbox_min: [floats[0], floats[1], floats[2]],
        bbox_max: [floats[3], floats[4], floats[5]],
        qmin: [floats[6], floats[7], floats[8]],
        qmax: [floats[9], floats[10], floats[11]],
    })
}

/// Largest `level` for which a `tris_level_<level>` file exists; levels with
/// zero triangles never got a file, so this is a max over existing files,
/// not a contiguous scan.
pub fn discover_max_pop_level(dir: &Path) -> u8 {
    let mut max_level = 0u8;
    for level in 0..LEVELS {
        if dir.join(format!("tris_level_{level}")).is_file() {
            max_level = level as u8;
        }
    }
    max_level
}

/// Reads `tri_verts_level_<level>` if present. Absence means zero entries,
/// not an error (§4.3 reader contract).
pub fn read_level_verts(dir: &Path, level: usize) -> Result<Option<Vec<f64>>> {
    let path = dir.join(format!("tri_verts_level_{level}"));
    if !path.is_file() {
        return Ok(None);
    }
    let mut f = fs::File::open(path)?;
    let count = read_i32(&mut f)? as usize;
    let mut out = Vec::with_capacity(count * 3);
    for _ in 0..count * 3 {
        out.push(read_f64(&mut f)?);
    }
    Ok(Some(out))
}

/// Reads `tris_level_<level>` if present, as a flat triple-of-`u32` buffer
/// already in the reordered vertex index space.
pub fn read_level_tris(dir: &Path, level: usize) -> Result<Option<Vec<u32>>> {
    let path = dir.join(format!("tris_level_{level}"));
    if !path.is_file() {
        return Ok(None);
    }
    let mut f = fs::File::open(path)?;
    let count = read_i32(&mut f)? as usize;
    let mut out = Vec::with_capacity(count * 3);
    for _ in 0..count * 3 {
        out.push(read_i32(&mut f)? as u32);
    }
    Ok(Some(out))
}

/// Reads just the leading count of `tri_verts_level_<level>`, without the
/// vertex payload. Used to build the range bookkeeping a down-trim needs
/// without holding the level's data resident.
pub fn read_level_vert_count(dir: &Path, level: usize) -> Result<usize> {
    let path = dir.join(format!("tri_verts_level_{level}"));
    if !path.is_file() {
        return Ok(0);
    }
    let mut f = fs::File::open(path)?;
    Ok(read_i32(&mut f)? as usize)
}

/// As [`read_level_vert_count`], for `tris_level_<level>`.
pub fn read_level_tri_count(dir: &Path, level: usize) -> Result<usize> {
    let path = dir.join(format!("tris_level_{level}"));
    if !path.is_file() {
        return Ok(0);
    }
    let mut f = fs::File::open(path)?;
    Ok(read_i32(&mut f)? as usize)
}

pub fn read_all_verts(dir: &Path) -> Result<Vec<f64>> {
    let mut f = fs::File::open(dir.join("all_verts"))?;
    let count = read_u64(&mut f)? as usize;
    let mut out = Vec::with_capacity(count * 3);
    for _ in 0..count * 3 {
        out.push(read_f64(&mut f)?);
    }
    Ok(out)
}

pub fn read_all_faces(dir: &Path) -> Result<Vec<u32>> {
    let mut f = fs::File::open(dir.join("all_faces"))?;
    let count = read_u64(&mut f)? as usize;
    let mut out = Vec::with_capacity(count * 3);
    for _ in 0..count * 3 {
        out.push(read_i32(&mut f)? as u32);
    }
    Ok(out)
}

fn read_i32(f: &mut fs::File) -> Result<i32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)
        .map_err(|e| cache_corrupt_on_eof(e, "truncated i32 field"))?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(f: &mut fs::File) -> Result<u64> {
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)
        .map_err(|e| cache_corrupt_on_eof(e, "truncated u64 field"))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(f: &mut fs::File) -> Result<f64> {
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)
        .map_err(|e| cache_corrupt_on_eof(e, "truncated f64 field"))?;
    Ok(f64::from_le_bytes(buf))
}

fn cache_corrupt_on_eof(e: io::Error, msg: &str) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::CacheCorrupt(msg.to_string())
    } else {
        Error::Io(e)
    }
}
