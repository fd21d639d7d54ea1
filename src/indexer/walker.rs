use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::extractor::FileKind;

/// Supported files under `dir`, sorted by path. Hidden directories are
/// skipped.
pub fn walk_directory(dir: &Path) -> Vec<(PathBuf, FileKind)> {
    let mut files: Vec<(PathBuf, FileKind)> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            let ext = path.extension()?.to_str()?;
            let kind = FileKind::from_extension(ext)?;
            Some((path, kind))
        })
        .collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_supported_files_and_skips_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::create_dir_all(root.join(".cache")).unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::write(root.join("nested/b.pdf"), "b").unwrap();
        std::fs::write(root.join("nested/c.png"), "c").unwrap();
        std::fs::write(root.join(".cache/d.txt"), "d").unwrap();

        let files = walk_directory(root);
        let names: Vec<String> = files
            .iter()
            .map(|(p, _)| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["a.txt", "nested/b.pdf"]);
        assert_eq!(files[1].1, FileKind::Pdf);
    }
}
