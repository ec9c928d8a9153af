//! Logical changelog paths.
//!
//! Paths are `/`-separated strings relative to the source root. They become
//! part of change set identities, so they are normalized the same way on
//! every platform.

/// Normalize a path: unify separators, drop `.` segments, fold `..`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Directory part of a path, empty for top-level files.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[..index],
        None => "",
    }
}

/// Resolve `target` as referenced from `from`.
pub fn resolve(from: &str, target: &str, relative_to_from: bool) -> String {
    if relative_to_from {
        let base = parent(from);
        if base.is_empty() {
            normalize(target)
        } else {
            normalize(&format!("{}/{}", base, target))
        }
    } else {
        normalize(target)
    }
}

/// Lowercase file extension.
pub fn extension(path: &str) -> Option<String> {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.rfind('.')
        .filter(|index| *index > 0)
        .map(|index| file[index + 1..].to_ascii_lowercase())
}
