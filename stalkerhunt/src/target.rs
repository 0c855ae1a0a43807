//! # Targets
//!
//! A [`Target`] names one unit of work, normally a host. The engine never
//! looks inside it: duplicates are allowed and each one is processed on its own.
//!
//! Targets come from a [`TargetSource`]:
//! - [`TargetList`] - a literal list (also parsed from `"a, b, c"`)
//! - [`TargetFile`] - one target per line, `#` comments and blank lines skipped
//! - [`FnSource`] - any closure, e.g. a directory query living elsewhere
//!
//! Before dispatch the supplied list is permuted with [`shuffle_targets`] so
//! hosts are never walked in a predictable (alphabetical, directory) order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stalkerhunt::target::{TargetList, TargetSource};
//!
//! let list: TargetList = "dc01.corp.local, 10.0.0.5, [::1]".parse().unwrap();
//! let targets = list.supply().unwrap();
//! assert_eq!(targets.len(), 3);
//! ```
use std::{
    convert::Infallible,
    fmt::Display,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use rand::{Rng, seq::SliceRandom};
use serde::{Serialize, Serializer};

use crate::error::EngineError;

/// Opaque identifier of one unit of work.
///
/// Cloning is cheap, the name is shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target(Arc<str>);

impl Target {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Classifies the target as a host name or address.
    ///
    /// Returns `None` when the string is none of them; the engine still
    /// dispatches such targets, only network collaborators care.
    pub fn kind(&self) -> Option<HostKind> {
        HostKind::classify(&self.0)
    }

    /// Host part usable for socket APIs (`[::1]` becomes `::1`).
    pub fn host(&self) -> &str {
        match self.kind() {
            Some(HostKind::IPv6) => self.0.trim_matches(['[', ']'].as_ref()),
            _ => &self.0,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Represents the type of a host.
///
/// Can be:
/// - `Dns`
/// - `IPv4`
/// - `IPv6`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostKind {
    Dns,
    IPv4,
    IPv6,
}

impl Display for HostKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns => write!(f, "dns"),
            Self::IPv4 => write!(f, "ipv4"),
            Self::IPv6 => write!(f, "ipv6"),
        }
    }
}

impl HostKind {
    /// Tries IPv4, then IPv6, then DNS.
    pub fn classify(host: &str) -> Option<HostKind> {
        if Self::is_ipv4(host) {
            Some(HostKind::IPv4)
        } else if Self::is_ipv6(host) {
            Some(HostKind::IPv6)
        } else if Self::is_dns(host) {
            Some(HostKind::Dns)
        } else {
            None
        }
    }

    /// Checks if the provided string is a valid DNS name.
    ///
    /// # Rules
    /// - Maximum length: 253 characters
    /// - Each label <= 63 characters
    /// - Cannot start or end with `-`
    /// - Only ASCII alphanumeric characters and `-` allowed
    pub fn is_dns(host: &str) -> bool {
        if host.is_empty() || host.len() > 253 {
            return false;
        }

        host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
    }

    pub fn is_ipv4(host: &str) -> bool {
        Ipv4Addr::from_str(host).is_ok()
    }

    /// Accepts both `::1` and `[::1]`.
    pub fn is_ipv6(host: &str) -> bool {
        let clean_ip = host.trim_matches(['[', ']'].as_ref());
        Ipv6Addr::from_str(clean_ip).is_ok()
    }
}

/// Produces the targets of one run.
///
/// Implementors are read once, before the execution pool is built. A failing
/// source aborts the run before any task exists.
pub trait TargetSource {
    fn supply(&self) -> Result<Vec<Target>, EngineError>;
}

/// A literal list of targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetList(Vec<Target>);

impl TargetList {
    pub fn new<I, T>(targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Target>,
    {
        Self(targets.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for TargetList {
    type Err = Infallible;

    /// Parses a comma-separated list (e.g. `"dc01, 10.0.0.1, fs02"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(Target::new)
                .collect(),
        ))
    }
}

impl TargetSource for TargetList {
    fn supply(&self) -> Result<Vec<Target>, EngineError> {
        Ok(self.0.clone())
    }
}

/// A file with one target per line.
#[derive(Debug, Clone)]
pub struct TargetFile {
    path: PathBuf,
}

impl TargetFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TargetSource for TargetFile {
    fn supply(&self) -> Result<Vec<Target>, EngineError> {
        if !self.path.exists() {
            return Err(EngineError::TargetFileMissing {
                path: self.path.clone(),
            });
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|source| EngineError::TargetFile {
            path: self.path.clone(),
            source,
        })?;

        Ok(parse_lines(&raw))
    }
}

fn parse_lines(raw: &str) -> Vec<Target> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Target::new)
        .collect()
}

/// Adapts a closure into a [`TargetSource`].
///
/// This is the seam for suppliers that live outside the engine, such as a
/// directory query returning computer names.
pub struct FnSource<F>(pub F);

impl<F> TargetSource for FnSource<F>
where
    F: Fn() -> anyhow::Result<Vec<Target>>,
{
    fn supply(&self) -> Result<Vec<Target>, EngineError> {
        (self.0)().map_err(EngineError::Supplier)
    }
}

/// Uniformly permutes `targets` in place (Fisher-Yates).
pub fn shuffle_targets<R: Rng + ?Sized>(targets: &mut [Target], rng: &mut R) {
    targets.shuffle(rng);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};
    use std::collections::HashSet;

    #[test]
    fn test_host_kind_classify() {
        assert_eq!(HostKind::classify("127.0.0.1"), Some(HostKind::IPv4));
        assert_eq!(HostKind::classify("::1"), Some(HostKind::IPv6));
        assert_eq!(HostKind::classify("[fe80::1]"), Some(HostKind::IPv6));
        assert_eq!(HostKind::classify("dc01.corp.local"), Some(HostKind::Dns));
        assert_eq!(HostKind::classify("WS-042"), Some(HostKind::Dns));
        assert_eq!(HostKind::classify("exa$mple.com"), None);
        assert_eq!(HostKind::classify("-bad.example.com"), None);
        assert_eq!(HostKind::classify(""), None);
    }

    #[test]
    fn test_host_kind_dns_length_limits() {
        let label = "a".repeat(64);
        assert!(!HostKind::is_dns(&label));
        assert!(HostKind::is_dns(&"a".repeat(63)));

        let long = vec!["abc"; 64].join(".");
        assert!(long.len() > 253);
        assert!(!HostKind::is_dns(&long));
    }

    #[test]
    fn test_target_host_strips_ipv6_brackets() {
        assert_eq!(Target::new("[::1]").host(), "::1");
        assert_eq!(Target::new("fs01").host(), "fs01");
        assert_eq!(Target::new("10.1.1.1").to_string(), "10.1.1.1");
    }

    #[test]
    fn test_target_list_from_str() {
        let list: TargetList = " dc01 , 10.0.0.1,,fs02, dc01 ".parse().unwrap();
        let targets = list.supply().unwrap();
        let names: Vec<&str> = targets.iter().map(Target::as_str).collect();
        // Duplicates survive, each one is its own unit of work.
        assert_eq!(names, vec!["dc01", "10.0.0.1", "fs02", "dc01"]);
    }

    #[test]
    fn test_target_file_missing_fails_fast() {
        let file = TargetFile::new("/definitely/not/here/targets.txt");
        let res = file.supply();
        assert!(matches!(res, Err(EngineError::TargetFileMissing { .. })));
    }

    #[test]
    fn test_target_file_skips_comments_and_blanks() {
        let path = std::env::temp_dir().join(format!("stalkerhunt-targets-{}.txt", std::process::id()));
        std::fs::write(&path, "# lab hosts\n\nws01\n  ws02  \n#ws03\n10.0.0.9\n").unwrap();

        let targets = TargetFile::new(&path).supply().unwrap();
        std::fs::remove_file(&path).ok();

        let names: Vec<&str> = targets.iter().map(Target::as_str).collect();
        assert_eq!(names, vec!["ws01", "ws02", "10.0.0.9"]);
    }

    #[test]
    fn test_fn_source_maps_errors() {
        let ok = FnSource(|| -> anyhow::Result<Vec<Target>> {
            Ok(vec![Target::new("a"), Target::new("b")])
        });
        assert_eq!(ok.supply().unwrap().len(), 2);

        let failing = FnSource(|| -> anyhow::Result<Vec<Target>> { anyhow::bail!("ldap bind refused") });
        assert!(matches!(failing.supply(), Err(EngineError::Supplier(_))));
    }

    #[test]
    fn test_shuffle_keeps_every_target() {
        let mut rng = SmallRng::seed_from_u64(7);
        let original: Vec<Target> = (0..50).map(|i| Target::new(format!("host{i}"))).collect();
        let mut shuffled = original.clone();
        shuffle_targets(&mut shuffled, &mut rng);

        let mut sorted = shuffled.clone();
        sorted.sort();
        let mut expected = original.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_shuffle_reaches_every_permutation() {
        let mut rng = SmallRng::seed_from_u64(42);
        let base: Vec<Target> = ["a", "b", "c"].into_iter().map(Target::new).collect();
        let mut seen = HashSet::new();
        let mut counts = std::collections::HashMap::new();

        for _ in 0..6_000 {
            let mut run = base.clone();
            shuffle_targets(&mut run, &mut rng);
            let key: String = run.iter().map(Target::as_str).collect();
            *counts.entry(key.clone()).or_insert(0usize) += 1;
            seen.insert(key);
        }

        assert_eq!(seen.len(), 6);
        // Each of the 6 orders should land near 1000 hits.
        for (order, hits) in counts {
            assert!((800..=1200).contains(&hits), "{order} drawn {hits} times");
        }
    }
}
