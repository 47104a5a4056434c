//! Repository paths and recursion depth
//!
//! Every path handled by the engine is repository-rooted and normalized:
//! it starts with `/`, never ends with `/` (except the root itself) and
//! contains no empty, `.` or `..` components.

use std::fmt;

/// Recursion bound for a path operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Depth {
    /// The path itself only
    Empty,
    /// The path and its immediate non-directory children
    Files,
    /// The path and all of its immediate children
    Immediates,
    /// The whole subtree
    Infinity,
}

impl Depth {
    /// Parse the wire word for a depth
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "empty" => Some(Self::Empty),
            "files" => Some(Self::Files),
            "immediates" => Some(Self::Immediates),
            "infinity" => Some(Self::Infinity),
            _ => None,
        }
    }

    /// Wire word for this depth
    pub fn as_word(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Files => "files",
            Self::Immediates => "immediates",
            Self::Infinity => "infinity",
        }
    }

    /// Partial order: Empty < Files/Immediates < Infinity.
    ///
    /// Files and Immediates are not comparable with each other.
    pub fn partial_cmp_depth(&self, other: &Depth) -> Option<std::cmp::Ordering> {
        let rank = |d: &Depth| match d {
            Depth::Empty => 0,
            Depth::Files | Depth::Immediates => 1,
            Depth::Infinity => 2,
        };
        match (self, other) {
            (Depth::Files, Depth::Immediates) | (Depth::Immediates, Depth::Files) => None,
            _ => Some(rank(self).cmp(&rank(other))),
        }
    }

    /// Whether `candidate` lies within this depth below `base`.
    ///
    /// `is_dir` reports whether `candidate` is a directory; it only matters
    /// for [`Depth::Files`].
    pub fn covers(&self, base: &str, candidate: &str, is_dir: bool) -> bool {
        let Some(rest) = relative_to(base, candidate) else {
            return false;
        };
        if rest.is_empty() {
            return true;
        }
        match self {
            Depth::Empty => false,
            Depth::Files => !rest.contains('/') && !is_dir,
            Depth::Immediates => !rest.contains('/'),
            Depth::Infinity => true,
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_word())
    }
}

/// Error for paths that cannot be normalized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid path: {0}")]
pub struct PathError(pub String);

/// Normalize a repository path.
///
/// Accepts both relative (`trunk/a`) and absolute (`/trunk/a`) input;
/// `..` that would escape the root is rejected.
pub fn normalize(path: &str) -> Result<String, PathError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathError(path.to_string()));
                }
            }
            p => {
                if p.contains('\0') {
                    return Err(PathError(path.to_string()));
                }
                parts.push(p);
            }
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Join a relative path onto a normalized base
pub fn join(base: &str, relative: &str) -> Result<String, PathError> {
    if relative.is_empty() {
        return normalize(base);
    }
    normalize(&format!("{}/{}", base, relative))
}

/// Path of `candidate` relative to `base`, or `None` when it is outside.
///
/// Both inputs must be normalized. The result is empty when they are equal.
pub fn relative_to<'a>(base: &str, candidate: &'a str) -> Option<&'a str> {
    if base == "/" {
        return Some(candidate.trim_start_matches('/'));
    }
    let rest = candidate.strip_prefix(base)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Parent of a normalized path (the root is its own parent)
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Last component of a normalized path (empty for the root)
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}
