//! `/tree`: a depth-bounded listing of part of the working directory.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::tools::{DeleteError, delete::resolve_in_working_dir};

/// Levels below the starting directory that are expanded.
pub const MAX_TREE_DEPTH: usize = 3;

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("{0}")]
    Path(#[from] DeleteError),

    #[error("path does not exist: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("cannot read working directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),
}

/// Human-readable size: `0 B`, `512.0 B`, `1.5 KB`, ...
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    #[allow(clippy::cast_precision_loss)]
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", SIZE_UNITS[unit])
}

/// Render `relative` (inside `working_dir`) as a tree, `max_depth` levels deep.
///
/// Hidden entries are skipped, directories come first, names sort
/// case-insensitively. Symlinks are listed but never followed. Unreadable
/// directories and files are marked `(access denied)`.
pub fn render_tree(
    working_dir: &Path,
    relative: &str,
    max_depth: usize,
) -> Result<String, TreeError> {
    let root = fs::canonicalize(working_dir).map_err(TreeError::WorkingDirectory)?;
    let start = resolve_in_working_dir(&root, relative)?;

    let meta =
        fs::symlink_metadata(&start).map_err(|_| TreeError::NotFound(relative.to_string()))?;
    if !meta.is_dir() {
        return Err(TreeError::NotADirectory(relative.to_string()));
    }

    let label = start
        .file_name()
        .map_or_else(|| start.display().to_string(), |n| n.to_string_lossy().into_owned());
    let mut out = format!("📂 {label}\n");
    walk(&start, "", 0, max_depth, &mut out);
    Ok(out.trim_end().to_string())
}

fn walk(dir: &Path, prefix: &str, depth: usize, max_depth: usize, out: &mut String) {
    if depth >= max_depth {
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            let _ = writeln!(out, "{prefix}└── ❌ (access denied)");
            return;
        }
    };

    let mut items: Vec<(String, PathBuf, Option<fs::Metadata>)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            (!name.starts_with('.')).then(|| (name, e.path(), fs::symlink_metadata(e.path()).ok()))
        })
        .collect();
    items.sort_by_key(|(name, _, meta)| {
        let is_dir = meta.as_ref().is_some_and(fs::Metadata::is_dir);
        (!is_dir, name.to_lowercase())
    });

    let last = items.len().saturating_sub(1);
    for (i, (name, path, meta)) in items.into_iter().enumerate() {
        let (branch, indent) = if i == last { ("└── ", "    ") } else { ("├── ", "│   ") };
        match meta {
            Some(m) if m.is_dir() => {
                let _ = writeln!(out, "{prefix}{branch}📁 {name}/");
                walk(&path, &format!("{prefix}{indent}"), depth + 1, max_depth, out);
            }
            Some(m) if m.file_type().is_symlink() => {
                let _ = writeln!(out, "{prefix}{branch}🔗 {name}");
            }
            Some(m) => {
                let _ = writeln!(out, "{prefix}{branch}📄 {name} ({})", format_size(m.len()));
            }
            None => {
                let _ = writeln!(out, "{prefix}{branch}📄 {name} (access denied)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/deep/deeper/deepest")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("src/deep/deeper/deepest/hidden_by_depth.txt"), "x").unwrap();
        fs::write(root.join("README.md"), vec![b'a'; 2048]).unwrap();
        fs::write(root.join(".env"), "SECRET=1").unwrap();
        dir
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_tree_lists_dirs_first_and_skips_hidden() {
        let dir = setup();
        let tree = render_tree(dir.path(), ".", MAX_TREE_DEPTH).unwrap();
        let lines: Vec<&str> = tree.lines().collect();

        assert!(lines[0].starts_with("📂 "));
        assert_eq!(lines[1], "├── 📁 src/");
        assert!(tree.contains("└── 📄 README.md (2.0 KB)"));
        assert!(tree.contains("📄 main.rs (12.0 B)"));
        assert!(tree.contains("📁 deeper/"));
        assert!(!tree.contains("deepest"));
        assert!(!tree.contains(".env"));
    }

    #[test]
    fn test_tree_of_subdirectory_and_depth() {
        let dir = setup();
        let tree = render_tree(dir.path(), "src/deep", 1).unwrap();
        assert_eq!(tree, "📂 deep\n└── 📁 deeper/");
    }

    #[test]
    fn test_tree_stays_inside_working_dir() {
        let dir = setup();
        assert!(matches!(
            render_tree(dir.path(), "../..", MAX_TREE_DEPTH),
            Err(TreeError::Path(DeleteError::OutsideWorkingDir(_)))
        ));
        assert!(matches!(
            render_tree(dir.path(), "missing", MAX_TREE_DEPTH),
            Err(TreeError::NotFound(_))
        ));
        assert!(matches!(
            render_tree(dir.path(), "README.md", MAX_TREE_DEPTH),
            Err(TreeError::NotADirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_tree_does_not_follow_symlinks() {
        let dir = setup();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let tree = render_tree(dir.path(), ".", MAX_TREE_DEPTH).unwrap();
        assert!(tree.contains("🔗 link"));
        assert!(!tree.contains("secret.txt"));
        assert!(matches!(
            render_tree(dir.path(), "link", MAX_TREE_DEPTH),
            Err(TreeError::NotADirectory(_))
        ));
    }
}
