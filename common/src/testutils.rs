//! Helpers for building scratch file trees in tests.
//!
//! Scratch directories themselves come from `tempfile::tempdir()` at the
//! call sites; these helpers only fill and compare them.

use anyhow::Result;

/// Write a tree of files under `root`. Each entry is a relative path plus
/// the file's byte length; content is the path repeated to size so trees
/// can be compared byte-for-byte after a transfer.
pub async fn write_tree(root: &std::path::Path, entries: &[(&str, usize)]) -> Result<()> {
    for (rel, size) in entries {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = rel.as_bytes().iter().copied().cycle();
        let bytes: Vec<u8> = (&mut content).take(*size).collect();
        tokio::fs::write(&path, bytes).await?;
    }
    Ok(())
}

/// Assert two directories have identical regular-file contents at the same
/// relative paths.
pub fn assert_trees_identical(src: &std::path::Path, dst: &std::path::Path) {
    fn walk(root: &std::path::Path, base: &std::path::Path, out: &mut Vec<std::path::PathBuf>) {
        for entry in std::fs::read_dir(root).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, base, out);
            } else {
                out.push(path.strip_prefix(base).unwrap().to_path_buf());
            }
        }
    }
    let mut src_files = Vec::new();
    walk(src, src, &mut src_files);
    src_files.sort();
    let mut dst_files = Vec::new();
    walk(dst, dst, &mut dst_files);
    dst_files.sort();
    assert_eq!(src_files, dst_files, "file sets differ");
    for rel in &src_files {
        let src_content = std::fs::read(src.join(rel)).unwrap();
        let dst_content = std::fs::read(dst.join(rel)).unwrap();
        assert_eq!(src_content, dst_content, "content differs for {:?}", rel);
    }
}
