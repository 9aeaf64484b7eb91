//! Object key validation.
//!
//! Keys are flat strings, but the sync engine treats `/` as a hierarchy
//! separator and maps each segment onto a local path component. A key is
//! only accepted if that mapping can never escape the restore target.

use crate::error::{ErrorKind, Result};
use std::fmt;

/// A validated, `/`-segmented object key.
///
/// Every segment is non-empty and none is `.` or `..`; the key never starts
/// or ends with a separator and contains no null bytes or backslashes.
///
/// # Examples
///
/// ```
/// use coffer_storage::ObjectKey;
/// // Valid keys
/// assert!(ObjectKey::parse("photos/2020/beach.jpg").is_ok());
/// assert!(ObjectKey::parse("notes.txt").is_ok());
/// // Invalid keys
/// assert!(ObjectKey::parse("../etc/passwd").is_err());
/// assert!(ObjectKey::parse("a//b").is_err());
/// assert!(ObjectKey::parse("/rooted").is_err());
/// assert!(ObjectKey::parse("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn parse(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.split('/').any(|segment| !Self::valid_segment(segment)) {
            exn::bail!(ErrorKind::InvalidKey(key));
        }
        Ok(Self(key))
    }

    /// Build a key from individual segments, validating each one.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments.into_iter().map(|s| s.as_ref().to_string()).collect::<Vec<_>>().join("/");
        Self::parse(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// First segment of the key, which is the name of the backed-up root.
    pub fn root_segment(&self) -> &str {
        self.segments().next().unwrap_or(&self.0)
    }

    fn valid_segment(segment: &str) -> bool {
        !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['\0', '\\'])
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a.txt")]
    #[case("root/a.txt")]
    #[case("root/deep/er/file.tar.gz")]
    #[case("with space/and-dash_under.score")]
    #[case("..hidden/file..name")]
    fn test_valid_keys(#[case] key: &str) {
        assert_eq!(ObjectKey::parse(key).unwrap().as_str(), key);
    }

    #[rstest]
    #[case("")]
    #[case("..")]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("a/./b")]
    #[case("a//b")]
    #[case("/rooted")]
    #[case("trailing/")]
    #[case("a\0b")]
    #[case("windows\\style")]
    fn test_invalid_keys(#[case] key: &str) {
        let err = ObjectKey::parse(key).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(k) if k == key));
    }

    #[test]
    fn test_segments() {
        let key = ObjectKey::from_segments(["root", "sub", "file.txt"]).unwrap();
        assert_eq!(key.as_str(), "root/sub/file.txt");
        assert_eq!(key.root_segment(), "root");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["root", "sub", "file.txt"]);
    }

    #[test]
    fn test_from_segments_rejects_traversal() {
        assert!(ObjectKey::from_segments(["root", "..", "file.txt"]).is_err());
        assert!(ObjectKey::from_segments(Vec::<&str>::new()).is_err());
    }
}
