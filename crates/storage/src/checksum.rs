//! SHA-256 content checksums, in the form S3 reports them.
//!
//! A whole-object checksum is the base64 SHA-256 digest of the bytes. An
//! object uploaded in parts carries a composite checksum instead: the base64
//! SHA-256 of the concatenated raw part digests, suffixed with `-<parts>`.
//! Computing a comparable local value therefore needs to know how the object
//! was split, which is what [`ChecksumLayout`] describes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

/// How an object's bytes were split when it was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumLayout {
    /// Stored in one piece.
    Whole,
    /// Stored in parts of this many bytes (the last one may be shorter).
    Parts(u64),
}

/// Base64 SHA-256 of a single buffer.
///
/// # Examples
///
/// ```
/// use coffer_storage::checksum::sha256;
///
/// assert_eq!(sha256(b""), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
/// ```
pub fn sha256(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes).as_slice())
}

/// Composite checksum of an object from its part digests, in part order.
pub fn composite<D: AsRef<[u8]>>(part_digests: &[D]) -> String {
    let mut hasher = Sha256::new();
    for digest in part_digests {
        hasher.update(digest.as_ref());
    }
    format!("{}-{}", STANDARD.encode(hasher.finalize().as_slice()), part_digests.len())
}

/// Number of parts in a composite checksum, `None` for a whole-object one.
pub fn part_count(checksum: &str) -> Option<u64> {
    checksum.rsplit_once('-').and_then(|(_, count)| count.parse().ok())
}

/// Incremental checksum that splits its input the same way an upload did.
pub struct ChecksumHasher {
    layout: ChecksumLayout,
    current: Sha256,
    filled: u64,
    parts: Vec<Vec<u8>>,
}

impl ChecksumHasher {
    pub fn new(layout: ChecksumLayout) -> Self {
        let layout = match layout {
            ChecksumLayout::Parts(size) => ChecksumLayout::Parts(size.max(1)),
            whole => whole,
        };
        Self { layout, current: Sha256::new(), filled: 0, parts: Vec::new() }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        let ChecksumLayout::Parts(part_size) = self.layout else {
            self.current.update(data);
            return;
        };
        while !data.is_empty() {
            let room = usize::try_from(part_size - self.filled).unwrap_or(usize::MAX);
            let (head, tail) = data.split_at(room.min(data.len()));
            self.current.update(head);
            self.filled += head.len() as u64;
            data = tail;
            if self.filled == part_size {
                self.close_part();
            }
        }
    }

    fn close_part(&mut self) {
        let digest = std::mem::take(&mut self.current).finalize();
        self.parts.push(digest.as_slice().to_vec());
        self.filled = 0;
    }

    pub fn finalize(mut self) -> String {
        match self.layout {
            ChecksumLayout::Whole => STANDARD.encode(self.current.finalize().as_slice()),
            ChecksumLayout::Parts(_) => {
                if self.filled > 0 || self.parts.is_empty() {
                    self.close_part();
                }
                composite(&self.parts)
            },
        }
    }
}
