//! Lexical path helpers. Nothing here touches the filesystem.

use std::path::{Component, Path, PathBuf};

/// Collapse `.` and `..` components without resolving symlinks.
///
/// Leading `..` components of a relative path are kept; `..` directly
/// below the root is dropped. An empty result becomes `.`.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut components = path.as_ref().components().peekable();

    let mut ret = if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        PathBuf::from(c.as_os_str())
    } else {
        PathBuf::new()
    };

    for component in components {
        match component {
            Component::Prefix(..) => {}
            Component::RootDir => ret.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match ret.components().next_back() {
                Some(Component::Normal(_)) => {
                    ret.pop();
                }
                Some(Component::RootDir | Component::Prefix(..)) => {}
                _ => ret.push(".."),
            },
            Component::Normal(c) => ret.push(c),
        }
    }

    if ret.as_os_str().is_empty() {
        ret.push(".");
    }
    ret
}

/// The root of a path: its drive prefix and root directory, if any.
fn root_of(path: &Path) -> PathBuf {
    path.components()
        .take_while(|c| matches!(c, Component::Prefix(..) | Component::RootDir))
        .collect()
}

/// Express `path` relative to `base`.
///
/// Both paths are normalized first. Returns `None` when they do not share a
/// root (different drives, or one absolute and one relative).
pub fn relative_path(path: &Path, base: &Path) -> Option<PathBuf> {
    let path = normalize_path(path);
    let base = normalize_path(base);
    if root_of(&path) != root_of(&base) {
        return None;
    }

    let path_parts: Vec<Component<'_>> = path.components().collect();
    let base_parts: Vec<Component<'_>> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for part in &base_parts[common..] {
        if !matches!(part, Component::CurDir) {
            rel.push("..");
        }
    }
    for part in &path_parts[common..] {
        if !matches!(part, Component::CurDir) {
            rel.push(part.as_os_str());
        }
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Some(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("foo/./bar/../baz"), Path::new("foo/baz"));
        assert_eq!(normalize_path("/a/b/../../c"), Path::new("/c"));
        assert_eq!(normalize_path("a/../../b"), Path::new("../b"));
        assert_eq!(normalize_path("/../x"), Path::new("/x"));
        assert_eq!(normalize_path("./"), Path::new("."));
        assert_eq!(normalize_path("a/.."), Path::new("."));
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/src/include"), Path::new("/src/build/app")),
            Some(PathBuf::from("../../include"))
        );
        assert_eq!(
            relative_path(Path::new("/src/build/app/gen"), Path::new("/src/build/app")),
            Some(PathBuf::from("gen"))
        );
        assert_eq!(
            relative_path(Path::new("/src"), Path::new("/src/")),
            Some(PathBuf::from("."))
        );
        assert_eq!(relative_path(Path::new("include"), Path::new("/build")), None);
    }
}
