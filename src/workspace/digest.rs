//! Content digests for files and filtered directory trees
//!
//! A file digest covers its raw bytes. A tree digest covers the sorted
//! `(relative-name, kind, content)` records of every selected entry, so
//! two selections with the same matched set and the same bytes always
//! agree no matter what else lives in the tree.

use crate::error::{CairnError, CairnResult};
use crate::workspace::selector::SelectorMatcher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use walkdir::WalkDir;

const READ_BUF_SIZE: usize = 64 * 1024;

/// `sha256:<64 hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex part without the algorithm prefix
    pub fn hex(&self) -> &str {
        self.0.trim_start_matches("sha256:")
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Summary of a digested tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub digest: ContentDigest,
    pub files: usize,
    pub bytes: u64,
}

/// Digest a byte slice
pub fn digest_bytes(bytes: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentDigest::from_hasher(hasher)
}

/// Digest everything readable from `reader`, returning the byte count too
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<(ContentDigest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((ContentDigest::from_hasher(hasher), total))
}

/// Digest a file's raw bytes
pub fn digest_file(path: &Path) -> CairnResult<(ContentDigest, u64)> {
    let file = File::open(path)
        .map_err(|e| CairnError::io(format!("opening {}", path.display()), e))?;
    digest_reader(file).map_err(|e| CairnError::io(format!("reading {}", path.display()), e))
}

enum Record {
    File { digest: ContentDigest, size: u64 },
    Link { target: String },
    /// FIFOs, sockets and devices; only their presence is recorded
    Special,
}

fn relative(dir: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(dir)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

/// Digest the entries under `dir` selected by `matcher`. Symlinks are not
/// followed; they contribute their target text. Special files are never
/// opened. Subtrees an exclude fully covers are not walked, and walk
/// errors inside them are ignored.
pub fn digest_tree(dir: &Path, matcher: &SelectorMatcher) -> CairnResult<TreeDigest> {
    let mut records: Vec<(String, Record)> = Vec::new();

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            !entry.file_type().is_dir()
                || relative(dir, entry.path()).is_none_or(|rel| !matcher.prunes_dir(&rel))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let rel = e.path().and_then(|p| relative(dir, p));
                if rel.is_some_and(|rel| !rel.is_empty() && matcher.prunes_dir(&rel)) {
                    continue;
                }
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| dir.display().to_string());
                return Err(CairnError::io(format!("walking {}", path), e.into()));
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let Some(rel) = relative(dir, entry.path()) else {
            continue;
        };
        if !matcher.matches(&rel) {
            continue;
        }

        let record = if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| {
                CairnError::io(format!("reading link {}", entry.path().display()), e)
            })?;
            Record::Link {
                target: target.to_string_lossy().into_owned(),
            }
        } else if file_type.is_file() {
            let (digest, size) = digest_file(entry.path())?;
            Record::File { digest, size }
        } else {
            Record::Special
        };
        records.push((rel, record));
    }

    records.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    for (rel, record) in &records {
        match record {
            Record::File { digest, size } => {
                hasher.update(b"file\0");
                hasher.update(rel.as_bytes());
                hasher.update(b"\0");
                hasher.update(size.to_string().as_bytes());
                hasher.update(b"\0");
                hasher.update(digest.as_str().as_bytes());
                bytes += size;
            }
            Record::Link { target } => {
                hasher.update(b"link\0");
                hasher.update(rel.as_bytes());
                hasher.update(b"\0");
                hasher.update(target.as_bytes());
            }
            Record::Special => {
                hasher.update(b"special\0");
                hasher.update(rel.as_bytes());
            }
        }
        hasher.update(b"\n");
    }

    Ok(TreeDigest {
        digest: ContentDigest::from_hasher(hasher),
        files: records.len(),
        bytes,
    })
}
