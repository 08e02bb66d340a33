//! Source fetcher adapter: clone/checkout a revision into a
//! directory, idempotently, and compute a stable content digest.
//!
//! Fetching shells out to the `git` CLI rather than a pure-Rust
//! implementation — shallow clones of annotated tags are fiddlier to get
//! right against a library than against the reference client.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {message}")]
    NetworkError { url: String, message: String },
    #[error("revision `{revision}` not found for {url}")]
    RevisionNotFound { url: String, revision: String },
    #[error("checkout at {0} is corrupt: {1}")]
    CorruptCheckout(std::path::PathBuf, String),
    #[error("git error: {0}")]
    GitError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outcome of a successful fetch: the concrete ref that was checked
/// out (commit sha, tag, or branch name as git reports it) and the content
/// digest of the resulting tree.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub revision: String,
    pub content_digest: String,
}

/// Clone/checkout `source_url` at `revision` (or the default branch, if
/// `None`) into `target_dir`. Idempotent: if `target_dir` already holds a
/// checkout whose `HEAD` matches the requested revision, this is a no-op
/// beyond recomputing the digest.
pub fn fetch(
    source_url: &str,
    revision: Option<&str>,
    target_dir: &Path,
) -> Result<FetchOutcome, FetchError> {
    if is_valid_checkout_of(target_dir, revision) {
        let content_digest = compute_dir_hash(target_dir)?;
        let head = current_head(target_dir)?;
        return Ok(FetchOutcome {
            revision: head,
            content_digest,
        });
    }

    if target_dir.exists() {
        fs::remove_dir_all(target_dir)?;
    }
    if let Some(parent) = target_dir.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut args: Vec<String> = vec!["clone".into(), "--depth".into(), "1".into()];
    if let Some(rev) = revision {
        args.push("--branch".into());
        args.push(rev.into());
    }
    args.push(source_url.into());
    args.push(target_dir.to_string_lossy().into_owned());

    let output = Command::new("git")
        .args(&args)
        .output()
        .map_err(|e| FetchError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if revision.is_some() && stderr.contains("Remote branch") && stderr.contains("not found") {
            return Err(FetchError::RevisionNotFound {
                url: source_url.to_string(),
                revision: revision.unwrap().to_string(),
            });
        }
        if stderr.contains("Could not resolve host") || stderr.contains("unable to access") {
            return Err(FetchError::NetworkError {
                url: source_url.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        return Err(FetchError::GitError(format!("git clone failed: {}", stderr.trim())));
    }

    let head = current_head(target_dir)?;
    let content_digest = compute_dir_hash(target_dir)?;
    Ok(FetchOutcome {
        revision: head,
        content_digest,
    })
}

fn is_valid_checkout_of(target_dir: &Path, revision: Option<&str>) -> bool {
    if !target_dir.join(".git").exists() {
        return false;
    }
    let Ok(head) = current_head(target_dir) else {
        return false;
    };
    match revision {
        None => true,
        Some(rev) => head == rev || head.starts_with(rev),
    }
}

fn current_head(target_dir: &Path) -> Result<String, FetchError> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(target_dir)
        .output()
        .map_err(|e| FetchError::GitError(format!("failed to get revision: {e}")))?;
    if !output.status.success() {
        return Err(FetchError::CorruptCheckout(
            target_dir.to_path_buf(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Hash over the sorted file tree of `path`, excluding `.git`. Parallel
/// hashing via rayon; mmap for files over 4KiB.
pub fn compute_dir_hash(path: &Path) -> Result<String, FetchError> {
    use rayon::prelude::*;

    let mut files: Vec<(String, std::path::PathBuf)> = Vec::new();
    collect_files(path, "", &mut files)?;

    let file_hashes: Result<BTreeMap<String, String>, FetchError> = files
        .par_iter()
        .map(|(key, file_path)| {
            let file = fs::File::open(file_path)?;
            let metadata = file.metadata()?;
            let hash = if metadata.len() > 4096 {
                // SAFETY: read-only mapping of a file we just opened; not
                // mutated concurrently during resolution.
                let mmap = unsafe { memmap2::Mmap::map(&file)? };
                blake3::hash(&mmap).to_hex().to_string()
            } else {
                let content = fs::read(file_path)?;
                blake3::hash(&content).to_hex().to_string()
            };
            Ok((key.clone(), hash))
        })
        .collect();
    let file_hashes = file_hashes?;

    let combined: String = file_hashes
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(blake3::hash(combined.as_bytes()).to_hex().to_string())
}

fn collect_files(
    dir: &Path,
    prefix: &str,
    files: &mut Vec<(String, std::path::PathBuf)>,
) -> Result<(), FetchError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = path.file_name().unwrap().to_string_lossy();
        if name == ".git" {
            continue;
        }
        let key = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        if path.is_dir() {
            collect_files(&path, &key, files)?;
        } else {
            files.push((key, path));
        }
    }
    Ok(())
}

/// A remote git tag with its parsed version, if any.
#[derive(Debug, Clone)]
pub struct GitTag {
    pub name: String,
    pub version: Option<semver::Version>,
    pub sha: String,
}

/// `git ls-remote --tags --refs <url>` — no clone needed, used by the
/// resolver to discover available versions.
pub fn list_remote_tags(url: &str) -> Result<Vec<GitTag>, FetchError> {
    let output = Command::new("git")
        .args(["ls-remote", "--tags", "--refs", url])
        .output()
        .map_err(|e| FetchError::GitError(format!("failed to run git ls-remote: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FetchError::NetworkError {
            url: url.to_string(),
            message: stderr.trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut tags = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 2 {
            continue;
        }
        let sha = parts[0].to_string();
        let tag_name = parts[1].strip_prefix("refs/tags/").unwrap_or(parts[1]).to_string();
        let version_str = tag_name.strip_prefix('v').unwrap_or(&tag_name);
        let version = semver::Version::parse(version_str).ok();
        tags.push(GitTag { name: tag_name, version, sha });
    }
    tags.sort_by(|a, b| match (&b.version, &a.version) {
        (Some(v1), Some(v2)) => v1.cmp(v2),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.name.cmp(&a.name),
    });
    Ok(tags)
}

/// The remote's default branch name, via `git ls-remote --symref <url> HEAD`.
pub fn remote_default_branch(url: &str) -> Result<String, FetchError> {
    let output = Command::new("git")
        .args(["ls-remote", "--symref", url, "HEAD"])
        .output()
        .map_err(|e| FetchError::GitError(format!("failed to run git ls-remote: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FetchError::NetworkError {
            url: url.to_string(),
            message: stderr.trim().to_string(),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("ref: ") {
            if let Some((refname, _)) = rest.split_once('\t') {
                if let Some(branch) = refname.strip_prefix("refs/heads/") {
                    return Ok(branch.to_string());
                }
            }
        }
    }
    Ok("main".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn compute_dir_hash_ignores_git_dir_and_is_stable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("HEAD"), b"ref: refs/heads/main").unwrap();

        let h1 = compute_dir_hash(dir.path()).unwrap();
        let h2 = compute_dir_hash(dir.path()).unwrap();
        assert_eq!(h1, h2);

        fs::remove_dir_all(dir.path().join(".git")).unwrap();
        let h3 = compute_dir_hash(dir.path()).unwrap();
        assert_eq!(h1, h3, "digest must not depend on .git contents");
    }

    #[test]
    fn compute_dir_hash_changes_with_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let h1 = compute_dir_hash(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), b"world").unwrap();
        let h2 = compute_dir_hash(dir.path()).unwrap();
        assert_ne!(h1, h2);
    }
}
