//! Content-addressed package cache: a global store keyed by
//! `(package_id, revision)`, served to projects through links.

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache index at {0} is corrupt: {1}")]
    IndexCorrupt(PathBuf, String),
    #[error("entry ({package}, {revision}) is corrupt: digest mismatch")]
    CacheCorrupt { package: String, revision: String },
    #[error("a non-link path already exists at {0}")]
    LinkExists(PathBuf),
    #[error(transparent)]
    Fetch(#[from] paker_fetch::FetchError),
    #[error("no cache directory could be determined for this platform")]
    NoCacheDir,
}

fn io_err(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub package: String,
    pub revision: String,
    pub content_digest: String,
    pub absolute_path: PathBuf,
    pub refcount: u64,
    pub last_used: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: Vec<CacheEntry>,
}

pub struct GlobalCache {
    root: PathBuf,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl GlobalCache {
    pub fn open_at(root: PathBuf) -> Result<Self, CacheError> {
        fs::create_dir_all(root.join("packages")).map_err(|e| io_err(&root, e))?;
        fs::create_dir_all(root.join("locks")).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    /// Open the default cache, honoring `PAKER_CACHE_ROOT`.
    pub fn open_default() -> Result<Self, CacheError> {
        let root = match std::env::var_os("PAKER_CACHE_ROOT") {
            Some(p) => PathBuf::from(p),
            None => Self::default_cache_dir()?,
        };
        Self::open_at(root)
    }

    pub fn default_cache_dir() -> Result<PathBuf, CacheError> {
        directories::ProjectDirs::from("dev", "paker", "paker")
            .map(|d| d.cache_dir().to_path_buf())
            .ok_or(CacheError::NoCacheDir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, package: &str, revision: &str) -> PathBuf {
        self.root.join("packages").join(package).join(revision)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn root_lock_path(&self) -> PathBuf {
        self.root.join("locks").join("index.lock")
    }

    fn entry_lock_path(&self, package: &str, revision: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{package}-{revision}.lock"))
    }

    fn with_root_lock<T>(&self, f: impl FnOnce() -> Result<T, CacheError>) -> Result<T, CacheError> {
        let lock_path = self.root_lock_path();
        let lock_file = File::create(&lock_path).map_err(|e| io_err(&lock_path, e))?;
        lock_file.lock_exclusive().map_err(|e| io_err(&lock_path, e))?;
        let result = f();
        let _ = lock_file.unlock();
        result
    }

    fn load_index(&self) -> Result<CacheIndex, CacheError> {
        let path = self.index_path();
        if !path.is_file() {
            return Ok(CacheIndex::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        if content.trim().is_empty() {
            return Ok(CacheIndex::default());
        }
        serde_json::from_str(&content).map_err(|e| CacheError::IndexCorrupt(path, e.to_string()))
    }

    fn save_index(&self, index: &CacheIndex) -> Result<(), CacheError> {
        let path = self.index_path();
        let content = serde_json::to_string_pretty(index).expect("CacheIndex always serializes");
        let tmp = self.root.join(".index.json.tmp");
        fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))
    }

    /// All entries currently in the index.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.load_index()?.entries)
    }

    /// Return the path to a ready checkout of `(package, revision)`,
    /// fetching it from `source_url` if absent.
    pub fn acquire(
        &self,
        package: &str,
        revision: &str,
        source_url: &str,
    ) -> Result<PathBuf, CacheError> {
        let dir = self.entry_dir(package, revision);

        let entry_lock_path = self.entry_lock_path(package, revision);
        let entry_lock = File::create(&entry_lock_path).map_err(|e| io_err(&entry_lock_path, e))?;
        entry_lock
            .lock_exclusive()
            .map_err(|e| io_err(&entry_lock_path, e))?;

        let already_present = self.with_root_lock(|| {
            let index = self.load_index()?;
            Ok(index
                .entries
                .iter()
                .any(|e| e.package == package && e.revision == revision))
        })?;

        if !already_present {
            tracing::info!(package, revision, "fetching into cache");
            let outcome = paker_fetch::fetch(source_url, Some(revision), &dir)?;
            self.with_root_lock(|| {
                let mut index = self.load_index()?;
                index.entries.retain(|e| !(e.package == package && e.revision == revision));
                index.entries.push(CacheEntry {
                    package: package.to_string(),
                    revision: revision.to_string(),
                    content_digest: outcome.content_digest,
                    absolute_path: dir.clone(),
                    refcount: 0,
                    last_used: now_secs(),
                });
                self.save_index(&index)
            })?;
        }

        let _ = entry_lock.unlock();
        Ok(dir)
    }

    /// Atomically create `<project_dir>/.paker/links/<package>` pointing at
    /// `path`, incrementing the corresponding entry's refcount.
    pub fn link(&self, project_dir: &Path, package: &str, path: &Path) -> Result<(), CacheError> {
        let links_dir = project_dir.join(".paker").join("links");
        fs::create_dir_all(&links_dir).map_err(|e| io_err(&links_dir, e))?;
        let link_path = links_dir.join(package);

        if link_path.exists() || link_path.symlink_metadata().is_ok() {
            let meta = fs::symlink_metadata(&link_path).map_err(|e| io_err(&link_path, e))?;
            if !meta.file_type().is_symlink() {
                return Err(CacheError::LinkExists(link_path));
            }
            fs::remove_file(&link_path).map_err(|e| io_err(&link_path, e))?;
        }

        let tmp_link = links_dir.join(format!(".{package}.tmp"));
        let _ = fs::remove_file(&tmp_link);
        make_symlink(path, &tmp_link).map_err(|e| io_err(&tmp_link, e))?;
        fs::rename(&tmp_link, &link_path).map_err(|e| io_err(&link_path, e))?;

        self.with_root_lock(|| {
            let mut index = self.load_index()?;
            if let Some(entry) = index.entries.iter_mut().find(|e| e.absolute_path == path) {
                entry.refcount += 1;
                entry.last_used = now_secs();
            }
            self.save_index(&index)
        })
    }

    /// Reverse of [`Self::link`]: remove the project link and decrement the
    /// corresponding entry's refcount.
    pub fn unlink(&self, project_dir: &Path, package: &str) -> Result<(), CacheError> {
        let link_path = project_dir.join(".paker").join("links").join(package);
        let target = fs::read_link(&link_path).ok();
        if link_path.exists() || link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path).map_err(|e| io_err(&link_path, e))?;
        }
        if let Some(target) = target {
            self.with_root_lock(|| {
                let mut index = self.load_index()?;
                if let Some(entry) = index
                    .entries
                    .iter_mut()
                    .find(|e| e.absolute_path == target)
                {
                    entry.refcount = entry.refcount.saturating_sub(1);
                }
                self.save_index(&index)
            })?;
        }
        Ok(())
    }

    /// Evict entries with refcount 0 whose `last_used` is older than `ttl`
    /// seconds. Returns the evicted entries.
    pub fn gc(&self, ttl_secs: u64) -> Result<Vec<CacheEntry>, CacheError> {
        self.with_root_lock(|| {
            let mut index = self.load_index()?;
            let now = now_secs();
            let (evicted, kept): (Vec<_>, Vec<_>) = index.entries.into_iter().partition(|e| {
                e.refcount == 0 && now.saturating_sub(e.last_used) > ttl_secs
            });
            index.entries = kept;
            for entry in &evicted {
                if entry.absolute_path.exists() {
                    fs::remove_dir_all(&entry.absolute_path)
                        .map_err(|e| io_err(&entry.absolute_path, e))?;
                }
                let lock_path = self.entry_lock_path(&entry.package, &entry.revision);
                let _ = fs::remove_file(lock_path);
            }
            self.save_index(&index)?;
            Ok(evicted)
        })
    }

    /// Recompute the content digest of `(package, revision)` and compare it
    /// against the index. On mismatch the entry is quarantined (renamed
    /// aside) so a subsequent `acquire` refetches it.
    pub fn verify(&self, package: &str, revision: &str) -> Result<bool, CacheError> {
        let dir = self.entry_dir(package, revision);
        if !dir.is_dir() {
            return Ok(false);
        }
        let digest = paker_fetch::compute_dir_hash(&dir)?;
        let index = self.load_index()?;
        let Some(entry) = index
            .entries
            .iter()
            .find(|e| e.package == package && e.revision == revision)
        else {
            return Ok(false);
        };
        if entry.content_digest == digest {
            return Ok(true);
        }
        tracing::warn!(package, revision, "cache entry digest mismatch, quarantining");
        let quarantine = self
            .root
            .join("quarantine")
            .join(format!("{package}-{revision}-{}", now_secs()));
        if let Some(parent) = quarantine.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let _ = fs::rename(&dir, &quarantine);
        self.with_root_lock(|| {
            let mut index = self.load_index()?;
            index
                .entries
                .retain(|e| !(e.package == package && e.revision == revision));
            self.save_index(&index)
        })?;
        Err(CacheError::CacheCorrupt {
            package: package.to_string(),
            revision: revision.to_string(),
        })
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_entry(cache: &GlobalCache, package: &str, revision: &str) -> PathBuf {
        let dir = cache.entry_dir(package, revision);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("file.txt"), b"content").unwrap();
        let digest = paker_fetch::compute_dir_hash(&dir).unwrap();
        cache
            .with_root_lock(|| {
                let mut index = cache.load_index()?;
                index.entries.push(CacheEntry {
                    package: package.to_string(),
                    revision: revision.to_string(),
                    content_digest: digest,
                    absolute_path: dir.clone(),
                    refcount: 0,
                    last_used: now_secs(),
                });
                cache.save_index(&index)
            })
            .unwrap();
        dir
    }

    #[test]
    fn link_increments_refcount_and_unlink_decrements() {
        let tmp = TempDir::new().unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let entry_dir = fake_entry(&cache, "fmt", "10.0.0");

        cache.link(&project, "fmt", &entry_dir).unwrap();
        let entries = cache.entries().unwrap();
        assert_eq!(entries[0].refcount, 1);
        assert!(project.join(".paker/links/fmt").exists());

        cache.unlink(&project, "fmt").unwrap();
        let entries = cache.entries().unwrap();
        assert_eq!(entries[0].refcount, 0);
        assert!(!project.join(".paker/links/fmt").exists());
    }

    #[test]
    fn link_refuses_to_overwrite_non_link_path() {
        let tmp = TempDir::new().unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let project = tmp.path().join("project");
        let links_dir = project.join(".paker").join("links");
        fs::create_dir_all(&links_dir).unwrap();
        fs::write(links_dir.join("fmt"), b"not a link").unwrap();
        let entry_dir = fake_entry(&cache, "fmt", "10.0.0");

        let err = cache.link(&project, "fmt", &entry_dir).unwrap_err();
        assert!(matches!(err, CacheError::LinkExists(_)));
    }

    #[test]
    fn gc_evicts_only_unreferenced_expired_entries() {
        let tmp = TempDir::new().unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        fake_entry(&cache, "fmt", "10.0.0");
        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let entry_dir2 = fake_entry(&cache, "spdlog", "1.0.0");
        cache.link(&project, "spdlog", &entry_dir2).unwrap();

        let evicted = cache.gc(0).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].package, "fmt");
        let remaining = cache.entries().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].package, "spdlog");
    }

    #[test]
    fn verify_detects_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        let dir = fake_entry(&cache, "fmt", "10.0.0");
        fs::write(dir.join("file.txt"), b"tampered").unwrap();

        let err = cache.verify("fmt", "10.0.0").unwrap_err();
        assert!(matches!(err, CacheError::CacheCorrupt { .. }));
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn verify_passes_for_untouched_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = GlobalCache::open_at(tmp.path().join("cache")).unwrap();
        fake_entry(&cache, "fmt", "10.0.0");
        assert!(cache.verify("fmt", "10.0.0").unwrap());
    }
}
