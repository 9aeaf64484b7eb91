//! Translation between local paths and object keys.
//!
//! A file at `<root>/<relative>` is stored under `<root name>/<relative>`,
//! with `/` separators regardless of platform. Restoring into a target
//! reverses that, dropping the leading root name when the target already
//! carries it so files don't land in `<target>/<name>/<name>/...`.

use crate::error::{ErrorKind, Result};
use coffer_storage::ObjectKey;
use exn::ResultExt;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Map `path`, a file somewhere below `root`, onto its object key.
///
/// Fails with [`PathMapping`](ErrorKind::PathMapping) if `path` is not under
/// `root`, if `root` has no final component, or if any component is not
/// valid UTF-8 or not a plain name.
pub fn to_key(root: &Path, path: &Path) -> Result<ObjectKey> {
    let unmappable = || ErrorKind::PathMapping(path.display().to_string());
    let root_name = root.file_name().and_then(OsStr::to_str).ok_or_else(unmappable)?;
    let relative = path.strip_prefix(root).or_raise(unmappable)?;

    let mut segments = vec![root_name];
    for component in relative.components() {
        match component {
            Component::Normal(name) => segments.push(name.to_str().ok_or_else(unmappable)?),
            _ => exn::bail!(unmappable()),
        }
    }
    if segments.len() < 2 {
        exn::bail!(unmappable());
    }
    ObjectKey::from_segments(segments).or_raise(unmappable)
}

/// Map `key` onto a local path below `target`.
///
/// When the key's root segment equals `target`'s own name, that segment is
/// not repeated, and a `target` ending in that name twice is collapsed to a
/// single occurrence. Only whole segments are compared; repeated folder names
/// deeper in the key are left alone.
///
/// # Examples
///
/// ```
/// use coffer_storage::ObjectKey;
/// use coffer_sync::keymap::to_path;
/// use std::path::{Path, PathBuf};
///
/// let key = ObjectKey::parse("photos/2020/beach.jpg").unwrap();
/// assert_eq!(to_path(Path::new("/restore"), &key), PathBuf::from("/restore/photos/2020/beach.jpg"));
/// assert_eq!(to_path(Path::new("/restore/photos"), &key), PathBuf::from("/restore/photos/2020/beach.jpg"));
/// assert_eq!(to_path(Path::new("/restore/photos/photos"), &key), PathBuf::from("/restore/photos/2020/beach.jpg"));
/// ```
pub fn to_path(target: &Path, key: &ObjectKey) -> PathBuf {
    let mut segments = key.segments();
    let mut base = target.to_path_buf();
    let root = OsStr::new(key.root_segment());

    if target.file_name() == Some(root) {
        segments.next();
        while base.file_name() == Some(root) && base.parent().and_then(Path::file_name) == Some(root) {
            base.pop();
        }
    }
    base.extend(segments);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn key(k: &str) -> ObjectKey {
        ObjectKey::parse(k).unwrap()
    }

    #[rstest]
    #[case("/srv/photos", "/srv/photos/a.jpg", "photos/a.jpg")]
    #[case("/srv/photos", "/srv/photos/2020/summer/b.jpg", "photos/2020/summer/b.jpg")]
    #[case("/srv/photos/", "/srv/photos/c.jpg", "photos/c.jpg")]
    #[case("/photos", "/photos/photos/photos.jpg", "photos/photos/photos.jpg")]
    fn test_to_key(#[case] root: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(to_key(Path::new(root), Path::new(path)).unwrap(), key(expected));
    }

    #[rstest]
    #[case::outside_root("/srv/photos", "/srv/documents/a.txt")]
    #[case::root_itself("/srv/photos", "/srv/photos")]
    #[case::no_root_name("/", "/a.txt")]
    #[case::traversal("/srv/photos", "/srv/photos/../documents/a.txt")]
    fn test_to_key_rejects(#[case] root: &str, #[case] path: &str) {
        let err = to_key(Path::new(root), Path::new(path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::PathMapping(_)));
    }

    #[rstest]
    #[case("/restore", "photos/a.jpg", "/restore/photos/a.jpg")]
    #[case("/restore/photos", "photos/a.jpg", "/restore/photos/a.jpg")]
    #[case("/backup/backup", "backup/file.txt", "/backup/file.txt")]
    #[case("/x/backup/backup", "backup/file.txt", "/x/backup/file.txt")]
    #[case("/restore/photos", "photos/photos/a.jpg", "/restore/photos/photos/a.jpg")]
    #[case("/restore/other", "photos/photos/a.jpg", "/restore/other/photos/photos/a.jpg")]
    fn test_to_path(#[case] target: &str, #[case] key_str: &str, #[case] expected: &str) {
        assert_eq!(to_path(Path::new(target), &key(key_str)), PathBuf::from(expected));
    }

    #[rstest]
    #[case("/srv/photos", "/srv/photos/a.jpg")]
    #[case("/srv/photos", "/srv/photos/deep/er/still/a.jpg")]
    #[case("/home/me/backup", "/home/me/backup/backup/notes.txt")]
    #[case("/data", "/data/data.bin")]
    fn test_round_trip(#[case] root: &str, #[case] path: &str) {
        let root = Path::new(root);
        let path = Path::new(path);
        assert_eq!(to_path(root, &to_key(root, path).unwrap()), path);
    }
}
