//! Preservation of declared volume directories across RUN instructions.
//!
//! Writes made under a declared `VOLUME` path during RUN must not persist
//! into the committed image, while COPY/ADD into the same path must. The
//! cache tars each preserved directory once per stage, restores it after
//! every RUN, and is invalidated by COPY/ADD destinations underneath it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use tracing::debug;

/// Maximum symlink indirections tolerated while resolving a path.
const MAX_SYMLINK_HOPS: usize = 40;

/// An ordered, prefix-minimal set of volume paths: if `/a` is present,
/// `/a/b` is never a separate member.
#[derive(Debug, Clone, Default)]
pub struct VolumeSet {
    volumes: Vec<String>,
}

impl VolumeSet {
    /// Whether `path` equals a member or lies underneath one.
    pub fn covers(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.volumes
            .iter()
            .any(|v| path == *v || path.starts_with(&format!("{v}/")))
    }

    /// Insert `path`, dropping members it supersedes. Returns false when the
    /// path is already covered.
    pub fn add(&mut self, path: &str) -> bool {
        if self.covers(path) {
            return false;
        }
        let path = clean_path(path);
        self.volumes
            .retain(|v| !v.starts_with(&format!("{path}/")));
        self.volumes.push(path);
        true
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.volumes.iter().any(|v| *v == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().map(String::as_str)
    }
}

/// Normalize a volume path: rooted, no trailing separator, `.`/`..` folded.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Captured metadata of a preserved directory, re-applied after restore.
#[derive(Debug, Clone)]
struct VolumeStat {
    mode: u32,
    modified: SystemTime,
}

/// Snapshot state for one stage's preserved directories.
#[derive(Debug, Default)]
pub struct VolumeCache {
    volumes: VolumeSet,
    /// Volume path to snapshot tar, for every preserved path.
    cache: BTreeMap<String, PathBuf>,
    info: BTreeMap<String, VolumeStat>,
    preserved: usize,
}

impl VolumeCache {
    pub fn volumes(&self) -> &VolumeSet {
        &self.volumes
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Start preserving `path`. Snapshot files are allocated under
    /// `cache_dir` (the working container's scratch directory).
    pub fn preserve(&mut self, mountpoint: &Path, cache_dir: &Path, path: &str) -> Result<()> {
        debug!(path, "PRESERVE");
        let path = resolve_symlink(mountpoint, path)
            .with_context(|| format!("reading symbolic link to {path:?}"))?;
        let archived = host_path(mountpoint, &path);
        if self.volumes.covers(&path) {
            // Already under a preserved path; make sure it exists and drop
            // any caches we are about to write through.
            fs::create_dir_all(&archived)
                .with_context(|| format!("ensuring volume path {} exists", archived.display()))?;
            self.invalidate(&path)
                .with_context(|| format!("ensuring volume path {} is preserved", archived.display()))?;
            return Ok(());
        }
        self.preserved += 1;
        let cache_file = cache_dir.join(format!("volume{}.tar", self.preserved));
        if !archived.exists() {
            fs::create_dir_all(&archived)
                .with_context(|| format!("ensuring volume path {} exists", archived.display()))?;
        }
        let metadata = fs::metadata(&archived)
            .with_context(|| format!("reading info about volume path {}", archived.display()))?;
        self.info.insert(
            path.clone(),
            VolumeStat {
                mode: mode_of(&metadata),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            },
        );
        if !self.volumes.add(&path) {
            bail!("adding {path:?} to the volume cache");
        }
        self.cache.insert(path, cache_file);
        // Prune snapshots for volumes this one just subsumed.
        let removed: Vec<String> = self
            .cache
            .keys()
            .filter(|cached| !self.volumes.contains(cached))
            .cloned()
            .collect();
        for cached in removed {
            let cache_file = self.cache.remove(&cached).unwrap();
            debug!(path = cached, file = %cache_file.display(), "no longer need cache");
            if let Err(err) = fs::remove_file(&cache_file) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err)
                        .with_context(|| format!("removing {}", cache_file.display()));
                }
            }
            self.info.remove(&cached);
        }
        Ok(())
    }

    /// Drop every cache entry covering `dest` because a COPY/ADD is about to
    /// write through it. Missing snapshot files are ignored.
    pub fn invalidate(&mut self, dest: &str) -> Result<()> {
        let probe = format!("{}/", clean_path(dest));
        let invalidated: Vec<String> = self
            .cache
            .keys()
            .filter(|cached| probe.starts_with(&format!("{cached}/")))
            .cloned()
            .collect();
        for cached in invalidated {
            let cache_file = self.cache.remove(&cached).unwrap();
            if let Err(err) = fs::remove_file(&cache_file) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err)
                        .with_context(|| format!("removing volume cache {}", cache_file.display()));
                }
            }
            debug!(path = cached, "invalidated volume cache");
            self.info.remove(&cached);
        }
        Ok(())
    }

    /// Archive every preserved directory that does not already have a
    /// snapshot. Existing snapshots are reused: one save per stage, restored
    /// after every RUN.
    pub fn save(&self, mountpoint: &Path) -> Result<()> {
        for (cached, cache_file) in &self.cache {
            let archived = host_path(mountpoint, cached);
            match cache_file.symlink_metadata() {
                Ok(_) => {
                    debug!(path = cached, file = %cache_file.display(), "volume already cached");
                    continue;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("checking for cache of {} in {}", archived.display(), cache_file.display())
                    })
                }
            }
            fs::create_dir_all(&archived)
                .with_context(|| format!("ensuring volume path {} exists", archived.display()))?;
            debug!(path = cached, file = %cache_file.display(), "caching volume contents");
            let file = fs::File::create(cache_file)
                .with_context(|| format!("creating archive at {}", cache_file.display()))?;
            let mut archive = tar::Builder::new(file);
            archive.follow_symlinks(false);
            archive
                .append_dir_all(".", &archived)
                .with_context(|| format!("archiving {}", archived.display()))?;
            archive
                .into_inner()
                .with_context(|| format!("archiving {} to {}", archived.display(), cache_file.display()))?;
        }
        Ok(())
    }

    /// Reset every preserved directory to its snapshot, re-applying the
    /// captured mode, root ownership, and timestamps.
    pub fn restore(&self, mountpoint: &Path) -> Result<()> {
        for (cached, cache_file) in &self.cache {
            let archived = host_path(mountpoint, cached);
            debug!(path = cached, file = %cache_file.display(), "restoring volume contents");
            let file = fs::File::open(cache_file)
                .with_context(|| format!("opening archive at {}", cache_file.display()))?;
            if archived.exists() {
                fs::remove_dir_all(&archived)
                    .with_context(|| format!("clearing volume path {}", archived.display()))?;
            }
            fs::create_dir_all(&archived)
                .with_context(|| format!("recreating volume path {}", archived.display()))?;
            let mut archive = tar::Archive::new(file);
            archive.set_preserve_permissions(true);
            archive.set_preserve_mtime(true);
            archive
                .unpack(&archived)
                .with_context(|| format!("extracting archive at {}", archived.display()))?;
            if let Some(stat) = self.info.get(cached) {
                let permissions = std::os::unix::fs::PermissionsExt::from_mode(stat.mode);
                fs::set_permissions(&archived, permissions)
                    .with_context(|| format!("restoring permissions on {}", archived.display()))?;
                let root = nix::unistd::Uid::from_raw(0);
                nix::unistd::chown(&archived, Some(root), Some(nix::unistd::Gid::from_raw(0)))
                    .with_context(|| format!("setting ownership on {}", archived.display()))?;
                let mtime = FileTime::from_system_time(stat.modified);
                filetime::set_file_times(&archived, mtime, mtime)
                    .with_context(|| format!("restoring datestamps on {}", archived.display()))?;
            }
        }
        Ok(())
    }
}

fn mode_of(metadata: &fs::Metadata) -> u32 {
    std::os::unix::fs::MetadataExt::mode(metadata)
}

/// Where a container-rooted path lives on the host.
pub fn host_path(mountpoint: &Path, path: &str) -> PathBuf {
    mountpoint.join(path.trim_start_matches('/'))
}

/// Resolve symlinks in `path` without escaping `mountpoint`: absolute link
/// targets are re-rooted at the mountpoint rather than the host root.
pub fn resolve_symlink(mountpoint: &Path, path: &str) -> Result<String> {
    let mut resolved = PathBuf::from("/");
    let mut pending: Vec<String> = components_of(path);
    pending.reverse();
    let mut hops = 0;
    while let Some(part) = pending.pop() {
        if part == "." {
            continue;
        }
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let host = host_path(mountpoint, candidate.to_str().unwrap_or_default());
        let is_link = fs::symlink_metadata(&host)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            resolved = candidate;
            continue;
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            bail!("too many symbolic links resolving {path:?}");
        }
        let target = fs::read_link(&host)
            .with_context(|| format!("reading symbolic link {}", host.display()))?;
        let target_str = target.to_string_lossy().into_owned();
        if target.is_absolute() {
            resolved = PathBuf::from("/");
        }
        for part in components_of(&target_str).into_iter().rev() {
            pending.push(part);
        }
    }
    Ok(clean_path(resolved.to_str().unwrap_or("/")))
}

fn components_of(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
