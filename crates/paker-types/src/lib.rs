//! Core data model for the Paker package manager.
//!
//! This crate defines package identity, the version/constraint algebra, and
//! the project manifest shape shared by every other `paker-*` crate.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

pub use semver::Version;

/// An opaque package identifier, interned nowhere in particular (plain
/// `String` is fine at this scale).
pub type PackageId = String;

/// A concrete, chosen version: either a parsed semantic version or an
/// opaque revision tag (git branch/tag name) that only compares equal to
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChosenVersion {
    Semver(Version),
    Tag(String),
}

impl ChosenVersion {
    pub fn as_tag_str(&self) -> Option<&str> {
        match self {
            ChosenVersion::Tag(t) => Some(t),
            ChosenVersion::Semver(_) => None,
        }
    }
}

impl fmt::Display for ChosenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChosenVersion::Semver(v) => write!(f, "{v}"),
            ChosenVersion::Tag(t) => write!(f, "{t}"),
        }
    }
}

impl PartialEq for ChosenVersion {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ChosenVersion::Semver(a), ChosenVersion::Semver(b)) => a == b,
            (ChosenVersion::Tag(a), ChosenVersion::Tag(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for ChosenVersion {}

/// A single precedence comparison, only meaningful between two values of the
/// same kind. Cross-kind comparisons fall back to `Equal` so callers that
/// sort mixed vectors get a stable (if arbitrary) order rather than a panic.
impl PartialOrd for ChosenVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ChosenVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChosenVersion::Semver(a), ChosenVersion::Semver(b)) => a.cmp(b),
            (ChosenVersion::Tag(a), ChosenVersion::Tag(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (ChosenVersion::Semver(_), ChosenVersion::Tag(_)) => Ordering::Greater,
            (ChosenVersion::Tag(_), ChosenVersion::Semver(_)) => Ordering::Less,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid version `{0}`: {1}")]
    InvalidVersion(String, semver::Error),
    #[error("invalid constraint `{0}`")]
    InvalidConstraint(String),
    #[error("invalid range constraint `{0}`: {1}")]
    InvalidRange(String, String),
}

/// A predicate over versions. Constraints form a lattice under
/// [`Constraint::intersect`]; [`Constraint::Empty`] is the unsatisfiable
/// bottom element.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Any,
    Exact(Version),
    Caret(Version),
    Tilde(Version),
    Range {
        lower: Option<Version>,
        lower_inclusive: bool,
        upper: Option<Version>,
        upper_inclusive: bool,
    },
    Tag(String),
    /// The unsatisfiable bottom of the lattice; never produced by
    /// [`parse_constraint`], only by [`Constraint::intersect`].
    Empty,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Any => write!(f, "*"),
            Constraint::Exact(v) => write!(f, "={v}"),
            Constraint::Caret(v) => write!(f, "^{v}"),
            Constraint::Tilde(v) => write!(f, "~{v}"),
            Constraint::Range {
                lower,
                lower_inclusive,
                upper,
                upper_inclusive,
            } => {
                let mut parts = Vec::new();
                if let Some(l) = lower {
                    parts.push(format!("{}{l}", if *lower_inclusive { ">=" } else { ">" }));
                }
                if let Some(u) = upper {
                    parts.push(format!("{}{u}", if *upper_inclusive { "<=" } else { "<" }));
                }
                write!(f, "{}", parts.join(","))
            }
            Constraint::Tag(t) => write!(f, "{t}"),
            Constraint::Empty => write!(f, "<empty>"),
        }
    }
}

/// Parse a version string. `*` is rejected here; callers that accept `*`
/// should check for it before calling this.
pub fn parse_version(s: &str) -> Result<Version, ParseError> {
    Version::parse(s).map_err(|e| ParseError::InvalidVersion(s.to_string(), e))
}

/// Parse a constraint string: exact (`=V`), caret (`^V`), tilde
/// (`~V`), range (`>=A,<B`), any (`*`), or an opaque tag for anything that
/// does not parse as semver.
pub fn parse_constraint(s: &str) -> Result<Constraint, ParseError> {
    let s = s.trim();
    if s.is_empty() || s == "*" {
        return Ok(Constraint::Any);
    }
    if let Some(rest) = s.strip_prefix('=') {
        return Ok(Constraint::Exact(parse_version(rest)?));
    }
    if let Some(rest) = s.strip_prefix('^') {
        return Ok(Constraint::Caret(parse_version(rest)?));
    }
    if let Some(rest) = s.strip_prefix('~') {
        return Ok(Constraint::Tilde(parse_version(rest)?));
    }
    if s.contains(',') || s.starts_with(">=") || s.starts_with('>') || s.starts_with("<=") || s.starts_with('<') {
        return parse_range(s);
    }
    // Bare "1.2.3" behaves like caret, matching common package manager convention.
    if let Ok(v) = Version::parse(s) {
        return Ok(Constraint::Caret(v));
    }
    // Doesn't parse as semver at all: an opaque tag.
    Ok(Constraint::Tag(s.to_string()))
}

fn parse_range(s: &str) -> Result<Constraint, ParseError> {
    let mut lower = None;
    let mut lower_inclusive = false;
    let mut upper = None;
    let mut upper_inclusive = false;
    for part in s.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(">=") {
            lower = Some(parse_version(rest)?);
            lower_inclusive = true;
        } else if let Some(rest) = part.strip_prefix('>') {
            lower = Some(parse_version(rest)?);
            lower_inclusive = false;
        } else if let Some(rest) = part.strip_prefix("<=") {
            upper = Some(parse_version(rest)?);
            upper_inclusive = true;
        } else if let Some(rest) = part.strip_prefix('<') {
            upper = Some(parse_version(rest)?);
            upper_inclusive = false;
        } else {
            return Err(ParseError::InvalidRange(
                s.to_string(),
                format!("unrecognized clause `{part}`"),
            ));
        }
    }
    if lower.is_none() && upper.is_none() {
        return Err(ParseError::InvalidRange(s.to_string(), "empty range".into()));
    }
    Ok(Constraint::Range {
        lower,
        lower_inclusive,
        upper,
        upper_inclusive,
    })
}

fn caret_upper(v: &Version) -> Version {
    if v.major > 0 {
        Version::new(v.major + 1, 0, 0)
    } else if v.minor > 0 {
        Version::new(0, v.minor + 1, 0)
    } else {
        Version::new(0, 0, v.patch + 1)
    }
}

fn tilde_upper(v: &Version) -> Version {
    Version::new(v.major, v.minor + 1, 0)
}

/// Does `version` satisfy `constraint`?
pub fn satisfies(version: &Version, constraint: &Constraint) -> bool {
    match constraint {
        Constraint::Any => true,
        Constraint::Empty => false,
        Constraint::Exact(v) => version == v,
        Constraint::Caret(v) => version >= v && version < &caret_upper(v),
        Constraint::Tilde(v) => version >= v && version < &tilde_upper(v),
        Constraint::Tag(_) => false,
        Constraint::Range {
            lower,
            lower_inclusive,
            upper,
            upper_inclusive,
        } => {
            let lower_ok = match lower {
                None => true,
                Some(l) => {
                    if *lower_inclusive {
                        version >= l
                    } else {
                        version > l
                    }
                }
            };
            let upper_ok = match upper {
                None => true,
                Some(u) => {
                    if *upper_inclusive {
                        version <= u
                    } else {
                        version < u
                    }
                }
            };
            lower_ok && upper_ok
        }
    }
}

/// Does `tag` satisfy `constraint`? Opaque tags only ever satisfy `Any` or
/// an identical `Tag`.
pub fn satisfies_tag(tag: &str, constraint: &Constraint) -> bool {
    match constraint {
        Constraint::Any => true,
        Constraint::Tag(t) => t == tag,
        _ => false,
    }
}

fn range_bounds(c: &Constraint) -> Option<(Option<Version>, bool, Option<Version>, bool)> {
    match c {
        Constraint::Any => Some((None, true, None, true)),
        Constraint::Exact(v) => Some((Some(v.clone()), true, Some(v.clone()), true)),
        Constraint::Caret(v) => Some((Some(v.clone()), true, Some(caret_upper(v)), false)),
        Constraint::Tilde(v) => Some((Some(v.clone()), true, Some(tilde_upper(v)), false)),
        Constraint::Range {
            lower,
            lower_inclusive,
            upper,
            upper_inclusive,
        } => Some((lower.clone(), *lower_inclusive, upper.clone(), *upper_inclusive)),
        Constraint::Tag(_) | Constraint::Empty => None,
    }
}

/// Intersect two constraints, producing [`Constraint::Empty`] when no
/// version can satisfy both.
pub fn intersect(a: &Constraint, b: &Constraint) -> Constraint {
    if *a == Constraint::Empty || *b == Constraint::Empty {
        return Constraint::Empty;
    }
    if let Constraint::Tag(ta) = a {
        return match b {
            Constraint::Any => a.clone(),
            Constraint::Tag(tb) if ta == tb => a.clone(),
            _ => Constraint::Empty,
        };
    }
    if let Constraint::Tag(_) = b {
        return intersect(b, a);
    }

    let (al, ali, au, aui) = range_bounds(a).expect("non-tag constraint has range bounds");
    let (bl, bli, bu, bui) = range_bounds(b).expect("non-tag constraint has range bounds");

    let (lower, lower_inclusive) = tighter_lower(al, ali, bl, bli);
    let (upper, upper_inclusive) = tighter_upper(au, aui, bu, bui);

    if let (Some(l), Some(u)) = (&lower, &upper) {
        let empty = match l.cmp(u) {
            Ordering::Greater => true,
            Ordering::Equal => !(lower_inclusive && upper_inclusive),
            Ordering::Less => false,
        };
        if empty {
            return Constraint::Empty;
        }
        if l == u && lower_inclusive && upper_inclusive {
            return Constraint::Exact(l.clone());
        }
    }
    if lower.is_none() && upper.is_none() {
        return Constraint::Any;
    }
    Constraint::Range {
        lower,
        lower_inclusive,
        upper,
        upper_inclusive,
    }
}

fn tighter_lower(
    a: Option<Version>,
    ai: bool,
    b: Option<Version>,
    bi: bool,
) -> (Option<Version>, bool) {
    match (a, b) {
        (None, x) => (x, bi),
        (x, None) => (x, ai),
        (Some(a), Some(b)) => match a.cmp(&b) {
            Ordering::Greater => (Some(a), ai),
            Ordering::Less => (Some(b), bi),
            Ordering::Equal => (Some(a), ai && bi),
        },
    }
}

fn tighter_upper(
    a: Option<Version>,
    ai: bool,
    b: Option<Version>,
    bi: bool,
) -> (Option<Version>, bool) {
    match (a, b) {
        (None, x) => (x, bi),
        (x, None) => (x, ai),
        (Some(a), Some(b)) => match a.cmp(&b) {
            Ordering::Less => (Some(a), ai),
            Ordering::Greater => (Some(b), bi),
            Ordering::Equal => (Some(a), ai && bi),
        },
    }
}

/// Pick the greatest version in `available` that satisfies `constraint`.
pub fn max_satisfying<'a>(
    available: impl IntoIterator<Item = &'a Version>,
    constraint: &Constraint,
) -> Option<Version> {
    available
        .into_iter()
        .filter(|v| satisfies(v, constraint))
        .max()
        .cloned()
}

/// Project manifest, shared shape for both the top-level project file and
/// child package manifests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: HashMap<PackageId, String>,
    /// Project-level source url overrides/additions, supplementing the
    /// built-in repository table.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sources: HashMap<PackageId, String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: Version::new(0, 1, 0),
            description: String::new(),
            dependencies: HashMap::new(),
            sources: HashMap::new(),
        }
    }
}

/// The read-only built-in package-id -> source-url table, grounded on the
/// original implementation's hardcoded repository list.
pub fn builtin_repos() -> &'static HashMap<&'static str, &'static str> {
    use std::sync::OnceLock;
    static REPOS: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    REPOS.get_or_init(|| {
        HashMap::from([
            ("fmt", "https://github.com/fmtlib/fmt.git"),
            ("spdlog", "https://github.com/gabime/spdlog.git"),
            ("catch2", "https://github.com/catchorg/Catch2.git"),
            ("googletest", "https://github.com/google/googletest.git"),
            ("nlohmann_json", "https://github.com/nlohmann/json.git"),
            ("cpr", "https://github.com/libcpr/cpr.git"),
            ("gtest", "https://github.com/google/googletest.git"),
            ("tbb", "https://github.com/oneapi-src/oneTBB.git"),
            ("eigen", "https://gitlab.com/libeigen/eigen.git"),
            ("boost", "https://github.com/boostorg/boost.git"),
        ])
    })
}

/// Resolve a package id to a source url, preferring the manifest's own
/// `sources` override over the built-in table.
pub fn resolve_source_url(manifest: &Manifest, package: &str) -> Option<String> {
    manifest
        .sources
        .get(package)
        .cloned()
        .or_else(|| builtin_repos().get(package).map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caret_matches_same_major() {
        let c = parse_constraint("^1.2.0").unwrap();
        assert!(satisfies(&Version::new(1, 9, 9), &c));
        assert!(!satisfies(&Version::new(2, 0, 0), &c));
        assert!(!satisfies(&Version::new(1, 1, 9), &c));
    }

    #[test]
    fn caret_zero_major_pins_minor() {
        let c = parse_constraint("^0.2.0").unwrap();
        assert!(satisfies(&Version::new(0, 2, 5), &c));
        assert!(!satisfies(&Version::new(0, 3, 0), &c));
    }

    #[test]
    fn tilde_pins_minor() {
        let c = parse_constraint("~1.2.0").unwrap();
        assert!(satisfies(&Version::new(1, 2, 9), &c));
        assert!(!satisfies(&Version::new(1, 3, 0), &c));
    }

    #[test]
    fn exact_matches_only_itself() {
        let c = parse_constraint("=1.2.3").unwrap();
        assert!(satisfies(&Version::new(1, 2, 3), &c));
        assert!(!satisfies(&Version::new(1, 2, 4), &c));
    }

    #[test]
    fn range_parses_and_matches() {
        let c = parse_constraint(">=1.0.0,<2.0.0").unwrap();
        assert!(satisfies(&Version::new(1, 5, 0), &c));
        assert!(!satisfies(&Version::new(2, 0, 0), &c));
        assert!(!satisfies(&Version::new(0, 9, 0), &c));
    }

    #[test]
    fn any_matches_everything() {
        let c = parse_constraint("*").unwrap();
        assert!(satisfies(&Version::new(0, 0, 1), &c));
    }

    #[test]
    fn non_semver_is_opaque_tag() {
        let c = parse_constraint("main").unwrap();
        assert_eq!(c, Constraint::Tag("main".into()));
        assert!(satisfies_tag("main", &c));
        assert!(!satisfies_tag("dev", &c));
    }

    #[test]
    fn disjoint_caret_ranges_intersect_to_empty() {
        let a = parse_constraint("^1.0.0").unwrap();
        let b = parse_constraint("^2.0.0").unwrap();
        assert_eq!(intersect(&a, &b), Constraint::Empty);
    }

    #[test]
    fn overlapping_ranges_intersect() {
        let a = parse_constraint(">=1.0.0,<3.0.0").unwrap();
        let b = parse_constraint(">=2.0.0,<4.0.0").unwrap();
        let i = intersect(&a, &b);
        assert!(satisfies(&Version::new(2, 5, 0), &i));
        assert!(!satisfies(&Version::new(1, 5, 0), &i));
        assert!(!satisfies(&Version::new(3, 5, 0), &i));
    }

    #[test]
    fn any_is_identity_for_intersection() {
        let a = parse_constraint("^1.0.0").unwrap();
        let any = Constraint::Any;
        assert_eq!(intersect(&a, &any), a);
    }

    #[test]
    fn max_satisfying_picks_greatest() {
        let versions = vec![
            Version::new(1, 0, 0),
            Version::new(1, 5, 0),
            Version::new(1, 2, 0),
        ];
        let c = parse_constraint("^1.0.0").unwrap();
        assert_eq!(max_satisfying(&versions, &c), Some(Version::new(1, 5, 0)));
    }

    #[test]
    fn builtin_repos_has_fmt() {
        assert_eq!(
            builtin_repos().get("fmt"),
            Some(&"https://github.com/fmtlib/fmt.git")
        );
    }

    #[test]
    fn manifest_default_has_empty_dependencies() {
        let m = Manifest::default();
        assert!(m.dependencies.is_empty());
        assert_eq!(m.version, Version::new(0, 1, 0));
    }
}
