use std::path::{Path, PathBuf};

use crate::{error::Result, registry::FormatRegistry};

/// A discovered source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the source root.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

/// Recursively walk a directory and collect every file the registry can
/// load.
///
/// Skips hidden files/directories (names starting with `.`). Results are
/// sorted by relative path so batch partitioning is deterministic.
pub fn discover_files(
    root: &Path,
    registry: &FormatRegistry,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, registry, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    registry: &FormatRegistry,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk_dir(root, &path, registry, results)?;
        } else if file_type.is_symlink() {
            // Broken symlinks are skipped.
            let Ok(resolved) = path.canonicalize() else {
                continue;
            };
            // Directory links back into the tree would loop.
            if resolved.starts_with(root) && resolved.is_dir() {
                continue;
            }
            if resolved.is_file() && registry.supports(&path) {
                results.push(discovered(root, &path, resolved));
            }
        } else if file_type.is_file() && registry.supports(&path) {
            let abs = path.canonicalize()?;
            results.push(discovered(root, &path, abs));
        }
    }

    Ok(())
}

fn discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    DiscoveredFile {
        relative_path,
        absolute_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(files: &[DiscoveredFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn keeps_only_registered_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("readme.txt"), "Hello").unwrap();
        std::fs::write(tmp.path().join("report.PDF"), "%PDF").unwrap();
        std::fs::write(tmp.path().join("archive.zip"), "binary").unwrap();

        let files =
            discover_files(tmp.path(), &FormatRegistry::standard()).unwrap();
        assert_eq!(names(&files), vec!["note.md", "readme.txt", "report.PDF"]);
    }

    #[test]
    fn respects_a_narrower_registry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("photo.png"), "png").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "text").unwrap();

        let files =
            discover_files(tmp.path(), &FormatRegistry::for_vision_model("none"))
                .unwrap();
        assert_eq!(names(&files), vec!["notes.txt"]);
    }

    #[test]
    fn skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.md"), "git config").unwrap();
        std::fs::write(tmp.path().join(".secret.txt"), "secret").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "notes").unwrap();

        let files =
            discover_files(tmp.path(), &FormatRegistry::standard()).unwrap();
        assert_eq!(names(&files), vec!["notes.md"]);
    }

    #[test]
    fn recurses_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("deep.md"), "deep").unwrap();
        std::fs::write(tmp.path().join("z.md"), "z").unwrap();
        std::fs::write(tmp.path().join("a.md"), "a").unwrap();

        let files =
            discover_files(tmp.path(), &FormatRegistry::standard()).unwrap();
        assert_eq!(names(&files), vec!["a.md", "sub/deep.md", "z.md"]);
        assert!(files.iter().all(|f| f.absolute_path.is_absolute()));
    }

    #[cfg(unix)]
    #[test]
    fn follows_file_symlinks_but_not_directory_loops() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("shared.txt");
        std::fs::write(&target, "shared").unwrap();

        std::os::unix::fs::symlink(&target, tmp.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("loop"))
            .unwrap();

        let files =
            discover_files(tmp.path(), &FormatRegistry::standard()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].absolute_path, target.canonicalize().unwrap());
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let files =
            discover_files(tmp.path(), &FormatRegistry::standard()).unwrap();
        assert!(files.is_empty());
    }
}
