//! Folder-relative path helpers.
//!
//! Index paths are `/`-separated, relative to the folder root, with the
//! empty string naming the root itself.

/// Path of the folder root.
pub const ROOT_PATH: &str = "";
/// Path separator used on the wire and in the index.
pub const PATH_SEPARATOR: char = '/';
/// Navigation sentinel for the parent directory.
pub const PARENT_PATH: &str = "..";

/// Collapses `.`/`..` segments, duplicate and leading separators.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(PATH_SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Returns true for the folder root.
pub fn is_root(path: &str) -> bool {
    path.is_empty()
}

/// Returns true for the parent sentinel.
pub fn is_parent(path: &str) -> bool {
    path == PARENT_PATH
}

/// Returns the parent directory of `path`; the root is its own parent.
pub fn parent_path(path: &str) -> String {
    normalize(&format!("{path}/{PARENT_PATH}"))
}

/// Returns the last segment of `path`.
pub fn file_name(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}

/// Joins a directory path and a name.
pub fn build_path(dir: &str, file: &str) -> String {
    normalize(&format!("{dir}/{file}"))
}
