//! Manifest store: load/save the project manifest and child
//! manifests found inside fetched packages.
//!
//! File layout polysemy in the original implementation (both `Paker.json`
//! and `paker.json` observed) is canonicalized here: child manifests are
//! written as `Paker.json`; `paker.json` is still read, never written.

use paker_types::Manifest;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest at {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest not found at {0}")]
    NotFound(PathBuf),
}

/// A non-fatal issue surfaced while loading a child manifest. Never
/// dropped silently.
#[derive(Debug, Clone)]
pub struct ManifestWarning {
    pub path: PathBuf,
    pub message: String,
}

/// The canonical project manifest filename for a project directory, derived
/// from the directory's own name, e.g. `widgets/` -> `widgets.json`.
pub fn project_manifest_path(project_dir: &Path) -> PathBuf {
    let name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "myproject".to_string());
    project_dir.join(format!("{name}.json"))
}

pub fn project_manifest_exists(project_dir: &Path) -> bool {
    project_manifest_path(project_dir).is_file()
}

pub fn load_project(project_dir: &Path) -> Result<Manifest, ManifestError> {
    load(&project_manifest_path(project_dir))
}

pub fn save_project(project_dir: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    save(&project_manifest_path(project_dir), manifest)
}

fn load(path: &Path) -> Result<Manifest, ManifestError> {
    if !path.is_file() {
        return Err(ManifestError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(|e| ManifestError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| ManifestError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write-to-temp + rename so a crash never leaves a half-written manifest.
pub fn save(path: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    let content = serde_json::to_string_pretty(manifest).expect("Manifest always serializes");
    atomic_write(path, content.as_bytes()).map_err(|e| ManifestError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("manifest")
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)
}

/// Locate a child manifest inside a fetched package directory. Canonical
/// name is `Paker.json`; `paker.json` is honored as a deprecated,
/// read-only alias.
pub fn find_child_manifest(package_dir: &Path) -> Option<PathBuf> {
    let canonical = package_dir.join("Paker.json");
    if canonical.is_file() {
        return Some(canonical);
    }
    let alias = package_dir.join("paker.json");
    if alias.is_file() {
        return Some(alias);
    }
    None
}

/// Load a child manifest, surfacing parse failures as a warning rather than
/// propagating an error: a malformed child manifest's dependencies are
/// treated as empty, but the caller must be told. A missing child
/// manifest is not a warning — plenty of fetched packages declare no
/// dependencies of their own.
pub fn load_child(package_dir: &Path) -> (Manifest, Option<ManifestWarning>) {
    let Some(path) = find_child_manifest(package_dir) else {
        return (Manifest::default(), None);
    };
    match load(&path) {
        Ok(manifest) => (manifest, None),
        Err(err) => (
            Manifest::default(),
            Some(ManifestWarning {
                path,
                message: err.to_string(),
            }),
        ),
    }
}

pub fn set_dependency(manifest: &mut Manifest, package: &str, constraint: &str) {
    manifest
        .dependencies
        .insert(package.to_string(), constraint.to_string());
}

pub fn remove_dependency(manifest: &mut Manifest, package: &str) -> bool {
    manifest.dependencies.remove(package).is_some()
}

pub fn set_description(manifest: &mut Manifest, description: &str) {
    manifest.description = description.to_string();
}

pub fn set_version(manifest: &mut Manifest, version: semver::Version) {
    manifest.version = version;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn project_manifest_name_follows_directory_name() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("widgets");
        fs::create_dir(&project_dir).unwrap();
        assert_eq!(
            project_manifest_path(&project_dir),
            project_dir.join("widgets.json")
        );
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        fs::create_dir(&project_dir).unwrap();
        let mut manifest = Manifest::default();
        manifest.name = "proj".into();
        set_dependency(&mut manifest, "fmt", "=10.0.0");

        save_project(&project_dir, &manifest).unwrap();
        let loaded = load_project(&project_dir).unwrap();
        assert_eq!(loaded.dependencies["fmt"], "=10.0.0");
    }

    #[test]
    fn missing_dependencies_field_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        fs::create_dir(&project_dir).unwrap();
        fs::write(
            project_manifest_path(&project_dir),
            r#"{"name":"proj","version":"0.1.0","description":""}"#,
        )
        .unwrap();
        let manifest = load_project(&project_dir).unwrap();
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn malformed_child_manifest_produces_warning_not_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Paker.json"), "not json").unwrap();
        let (manifest, warning) = load_child(dir.path());
        assert!(manifest.dependencies.is_empty());
        assert!(warning.is_some());
    }

    #[test]
    fn missing_child_manifest_is_not_a_warning() {
        let dir = TempDir::new().unwrap();
        let (manifest, warning) = load_child(dir.path());
        assert!(manifest.dependencies.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn lowercase_alias_is_read_as_fallback() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("paker.json"),
            r#"{"name":"x","version":"0.1.0","description":"","dependencies":{"a":"^1.0.0"}}"#,
        )
        .unwrap();
        let (manifest, warning) = load_child(dir.path());
        assert!(warning.is_none());
        assert_eq!(manifest.dependencies["a"], "^1.0.0");
    }
}
