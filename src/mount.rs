//! Mountpoint discovery.
//!
//! A runtime's recording area is a set of directories ("mountpoints")
//! described by a list of patterns: shell globs (`/mnt/disk*`) or anchored
//! regexes (`^/mnt/disk[0-9]+$`). Expansion keeps only existing, readable
//! directories and drops anything living on the root filesystem. Patterns
//! expand in parallel, one worker per pattern, merging into one sorted
//! set.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pattern `{0}': only absolute paths are supported")]
    NotAbsolute(String),
    #[error("invalid pattern `{0}': {1}")]
    BadPattern(String, String),
    #[error("no mountpoints match the configured patterns")]
    NoMountpoints,
}

type Result<T, E = Error> = std::result::Result<T, E>;

enum Matcher {
    Glob(glob::Pattern),
    Anchored(Regex),
}

impl Matcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Glob(p) => p.matches(path),
            Matcher::Anchored(re) => re.is_match(path),
        }
    }
}

/// A single mountpoint pattern; regex patterns are marked by a leading `^`.
pub struct MountPattern {
    raw: String,
    matcher: Matcher,
    /// longest pattern-free path prefix to start the walk from
    prefix: PathBuf,
    /// path depth (component count) of a full match
    depth: usize,
}

impl MountPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let is_regex = raw.starts_with('^');
        let body = if is_regex { &raw[1..] } else { raw };
        if !body.starts_with('/') {
            return Err(Error::NotAbsolute(raw.to_owned()));
        }
        let matcher = if is_regex {
            let anchored = format!("^{}$", body.trim_end_matches('$'));
            Matcher::Anchored(
                Regex::new(&anchored)
                    .map_err(|e| Error::BadPattern(raw.to_owned(), e.to_string()))?,
            )
        } else {
            Matcher::Glob(
                glob::Pattern::new(body)
                    .map_err(|e| Error::BadPattern(raw.to_owned(), e.to_string()))?,
            )
        };
        let components: Vec<&str> = body.split('/').filter(|c| !c.is_empty()).collect();
        let meta = |c: &str| c.contains(|ch| "*?[](){}|.+\\".contains(ch));
        let mut prefix = PathBuf::from("/");
        for c in &components {
            if meta(c) {
                break;
            }
            prefix.push(c);
        }
        Ok(MountPattern {
            raw: raw.to_owned(),
            matcher,
            prefix,
            depth: components.len(),
        })
    }

    /// Directories under the prefix, at the pattern's depth, matching the
    /// pattern.
    fn expand(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let start_depth = self.prefix.components().count() - 1; // minus root
        self.walk(&self.prefix, start_depth, &mut found);
        found
    }

    fn walk(&self, dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
        if depth == self.depth {
            if self.matcher.matches(&dir.to_string_lossy()) {
                found.push(dir.to_owned());
            }
            return;
        }
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                log::debug!("skipping {}: {}", dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, depth + 1, found);
            }
        }
    }
}

fn on_root_filesystem(path: &Path) -> bool {
    let root_dev = match fs::metadata("/") {
        Ok(m) => m.dev(),
        Err(_) => return false,
    };
    fs::metadata(path).map(|m| m.dev() == root_dev).unwrap_or(true)
}

fn usable(path: &Path, allow_root_fs: bool) -> bool {
    if !path.is_dir() || fs::read_dir(path).is_err() {
        return false;
    }
    allow_root_fs || !on_root_filesystem(path)
}

/// Expands `patterns` to the usable mountpoint set: existing readable
/// directories, never on the root filesystem.
pub fn find_mountpoints(patterns: &[String]) -> Result<Vec<PathBuf>> {
    find_mountpoints_opts(patterns, false)
}

/// Like [`find_mountpoints`], with the root-filesystem guard switchable
/// (integration tests record into temp directories).
pub fn find_mountpoints_opts(patterns: &[String], allow_root_fs: bool) -> Result<Vec<PathBuf>> {
    let parsed: Vec<MountPattern> = patterns
        .iter()
        .map(|p| MountPattern::parse(p))
        .collect::<Result<_>>()?;
    let merged: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());
    crossbeam::thread::scope(|s| {
        for pat in &parsed {
            let merged = &merged;
            s.spawn(move |_| {
                let hits = pat.expand();
                log::debug!("pattern {} matched {} dirs", pat.raw, hits.len());
                let mut set = merged.lock().expect("mountpoint merge lock");
                set.extend(hits.into_iter().filter(|p| usable(p, allow_root_fs)));
            });
        }
    })
    .expect("mountpoint scan worker panicked");
    let set = merged.into_inner().expect("mountpoint merge lock");
    Ok(set.into_iter().collect())
}

lazy_static! {
    static ref CACHE: RwLock<HashMap<Vec<String>, Vec<PathBuf>>> = RwLock::new(HashMap::new());
}

/// Cached variant; `refresh` forces a rescan of the pattern list.
pub fn cached_mountpoints(patterns: &[String], refresh: bool) -> Result<Vec<PathBuf>> {
    let key: Vec<String> = patterns.to_vec();
    if !refresh {
        if let Some(hit) = CACHE.read().expect("mountpoint cache lock").get(&key) {
            return Ok(hit.clone());
        }
    }
    let fresh = find_mountpoints(patterns)?;
    CACHE
        .write()
        .expect("mountpoint cache lock")
        .insert(key, fresh.clone());
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::create_dir_all;
    use tempdir::TempDir;

    #[test]
    fn relative_patterns_are_rejected() {
        assert!(matches!(
            MountPattern::parse("mnt/disk*"),
            Err(Error::NotAbsolute(_))
        ));
        assert!(matches!(
            MountPattern::parse("^mnt/disk[0-9]"),
            Err(Error::NotAbsolute(_))
        ));
    }

    #[test]
    fn glob_pattern_expands_to_matching_dirs() {
        let tmp = TempDir::new("mounts").unwrap();
        for name in &["disk0", "disk1", "data9", "disk2-broken.file"] {
            create_dir_all(tmp.path().join(name)).unwrap();
        }
        fs::write(tmp.path().join("disk3"), b"a file, not a dir").unwrap();
        let pattern = format!("{}/disk*", tmp.path().display());
        let got = find_mountpoints_opts(&[pattern], true).unwrap();
        let names: Vec<_> = got
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["disk0", "disk1", "disk2-broken.file"]);
    }

    #[test]
    fn regex_pattern_is_anchored() {
        let tmp = TempDir::new("mounts").unwrap();
        for name in &["disk0", "disk1", "disk10", "olddisk1"] {
            create_dir_all(tmp.path().join(name)).unwrap();
        }
        let pattern = format!("^{}/disk[0-9]", tmp.path().display());
        let got = find_mountpoints_opts(&[pattern], true).unwrap();
        let names: Vec<_> = got
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        // anchored on both sides: disk10 has a trailing digit too many
        assert_eq!(names, vec!["disk0", "disk1"]);
    }

    #[test]
    fn multiple_patterns_merge_sorted_and_deduped() {
        let tmp = TempDir::new("mounts").unwrap();
        for name in &["a1", "a2", "b1"] {
            create_dir_all(tmp.path().join(name)).unwrap();
        }
        let p1 = format!("{}/a*", tmp.path().display());
        let p2 = format!("{}/*1", tmp.path().display());
        let got = find_mountpoints_opts(&[p1, p2], true).unwrap();
        let names: Vec<_> = got
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn missing_prefix_yields_empty() {
        let got = find_mountpoints_opts(&["/no/such/prefix/disk*".to_owned()], true).unwrap();
        assert!(got.is_empty());
    }
}
