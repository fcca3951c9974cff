//! On-disk layout of a volume root.
//!
//! ```text
//! root/my.db                 embedded index database
//! root/file/ab/cd/.../ij     content files, sharded by signature
//! root/tmps/<uuid>           in-flight writes
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Name of the content directory under a volume root.
pub const FILE_DIR: &str = "file";
/// Name of the in-flight write directory under a volume root.
pub const TMP_DIR: &str = "tmps";
/// File name of the embedded database under a volume root.
pub const DB_FILE: &str = "my.db";

/// Width of one directory segment of a sharded content path.
const SEGMENT_LEN: usize = 2;

/// Builds the sharded content path of `signature` under `base`.
///
/// The signature is cut into consecutive two-character segments, each one a
/// directory level, so a 40-character SHA-1 yields 20 levels.
pub fn signature_path(base: &Path, signature: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    let bytes = signature.as_bytes();
    for segment in bytes.chunks(SEGMENT_LEN) {
        // signatures are ASCII hex, so chunking never splits a character
        path.push(String::from_utf8_lossy(segment).as_ref());
    }
    path
}

/// Resolved paths of one volume root.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    root: PathBuf,
    file_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl VolumeLayout {
    /// Creates the layout for a volume rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            file_dir: root.join(FILE_DIR),
            tmp_dir: root.join(TMP_DIR),
            root,
        }
    }

    /// The volume root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding sharded content files.
    pub fn file_dir(&self) -> &Path {
        &self.file_dir
    }

    /// Directory holding in-flight writes.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Path of the embedded database.
    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    /// Final content path of `signature`.
    pub fn file_path(&self, signature: &str) -> PathBuf {
        signature_path(&self.file_dir, signature)
    }

    /// A fresh in-flight path.
    pub fn tmp_path(&self) -> PathBuf {
        self.tmp_dir.join(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_path_segments() {
        let sig = "e0ffb1d5d3a0ee3e3a19d8c3d2bd4b2f2a1c7a6f";
        let path = signature_path(Path::new("/vol/file"), sig);
        let segments: Vec<_> = path
            .strip_prefix("/vol/file")
            .unwrap()
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        assert_eq!(segments.len(), 20);
        assert_eq!(segments[0], "e0");
        assert_eq!(segments[1], "ff");
        assert_eq!(segments[19], "6f");
        assert_eq!(segments.concat(), sig);
    }

    #[test]
    fn test_odd_length_keeps_tail() {
        let path = signature_path(Path::new("base"), "abc");
        assert_eq!(path, PathBuf::from("base/ab/c"));
    }

    #[test]
    fn test_layout_paths() {
        let layout = VolumeLayout::new("/data/v1");
        assert_eq!(layout.file_dir(), Path::new("/data/v1/file"));
        assert_eq!(layout.tmp_dir(), Path::new("/data/v1/tmps"));
        assert_eq!(layout.db_path(), PathBuf::from("/data/v1/my.db"));
        assert!(layout.file_path("aabb").starts_with("/data/v1/file/aa"));
    }

    #[test]
    fn test_tmp_paths_are_unique() {
        let layout = VolumeLayout::new("/data/v1");
        let a = layout.tmp_path();
        let b = layout.tmp_path();
        assert_ne!(a, b);
        assert!(a.starts_with(layout.tmp_dir()));
    }
}
