//! Path helpers for the namespace tree.
//!
//! Namespace paths are absolute, '/'-separated, and normalized (no
//! trailing slash except the root itself).

/// Split a path into a parent and basename. For example:
///
///   /A/B/C -> ("/A/B", "C")
///   /A     -> ("/", "A")
///   /      -> ("", "/")
///
/// The root is the anomalous case: its parent is the empty string, which
/// is how the namespace table keys it.
pub fn split_path(full_path: &str) -> (&str, &str) {
    if full_path == "/" {
        return ("", "/");
    }
    match full_path.rfind('/') {
        Some(0) => ("/", &full_path[1..]),
        Some(idx) => (&full_path[..idx], &full_path[idx + 1..]),
        None => ("", full_path),
    }
}

/// Join a parent directory and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// All proper ancestors of an absolute path, nearest the root first,
/// excluding the root itself. `/a/b/c` yields `["/a", "/a/b"]`.
pub fn ancestors(full_path: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut end: usize = 0;
    for (idx, ch) in full_path.char_indices().skip(1) {
        if ch == '/' {
            end = idx;
            result.push(full_path[..end].to_string());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/"), ("", "/"));
        assert_eq!(split_path("/A"), ("/", "A"));
        assert_eq!(split_path("/A/B/C"), ("/A/B", "C"));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "A"), "/A");
        assert_eq!(join_path("/A", "B"), "/A/B");
    }

    #[test]
    fn test_ancestors() {
        assert!(ancestors("/").is_empty());
        assert!(ancestors("/a").is_empty());
        assert_eq!(ancestors("/a/b"), vec!["/a"]);
        assert_eq!(ancestors("/a/b/c"), vec!["/a", "/a/b"]);
    }

    #[test]
    fn test_split_join_round_trip() {
        for path in ["/x", "/x/y", "/deep/er/path"] {
            let (parent, name) = split_path(path);
            assert_eq!(join_path(parent, name), path);
        }
    }
}
