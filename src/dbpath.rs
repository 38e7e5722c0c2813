//! Database path parsing.
//!
//! Paths address nested maps: `"users/alice/avatar"` names the entry
//! `avatar` inside the map `alice` inside the map `users` at the root. The
//! empty path names the root map itself. Segments must be non-empty, so
//! leading, trailing, and doubled slashes are rejected.

use thiserror::Error;

/// Errors returned when parsing or applying database paths.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// The path contains an empty segment (`"a//b"`, `"/a"`, `"a/"`).
    #[error("path {0:?} contains an empty segment")]
    EmptySegment(String),

    /// The operation needs at least one path segment.
    #[error("cannot modify the parent of the root")]
    EmptyPath,
}

/// Splits `path` into its segments; the empty path has none.
pub fn split(path: &str) -> Result<Vec<&str>, PathError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_paths() {
        assert_eq!(split("abc").unwrap(), vec!["abc"]);
        assert_eq!(split("a/b/c").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_path_has_no_segments() {
        assert_eq!(split("").unwrap(), Vec::<&str>::new());
    }

    #[test]
    fn rejects_empty_segments() {
        for path in ["/", "/a", "a/", "a//b"] {
            assert_eq!(
                split(path).unwrap_err(),
                PathError::EmptySegment(path.to_string())
            );
        }
    }
}
