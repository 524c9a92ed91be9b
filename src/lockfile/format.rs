//! On-disk lockfile format
//!
//! ```text
//! [["version","1"]]
//! ["core","container.from",["alpine:3.18","linux/amd64"],"sha256:..."]
//! ["core","http.get",["https://example.com/a.tar.gz"],"sha256:..."]
//! ```
//!
//! Line 0 is the version header. Every following line is one entry, sorted
//! by `(module, function, inputs)`. Every line ends with `\n`, so the same
//! logical set always renders to the same bytes.

use crate::error::{CairnError, CairnResult};
use crate::lockfile::entry::{LockfileEntry, ResolverCall};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Current lockfile format version
pub const FORMAT_VERSION: &str = "1";

/// Canonical header line
pub const VERSION_HEADER: &str = r#"[["version","1"]]"#;

/// In-memory form of a lockfile: sorted key -> output
pub type LockMap = BTreeMap<ResolverCall, String>;

/// Parse lockfile content. Empty content is an empty lockfile.
pub fn parse(path: &Path, content: &str) -> CairnResult<LockMap> {
    let corrupt = |line: usize, reason: String| CairnError::CorruptLockfile {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());

    let Some((header_idx, header)) = lines.next() else {
        return Ok(LockMap::new());
    };
    check_header(header).map_err(|reason| corrupt(header_idx + 1, reason))?;

    let mut map = LockMap::new();
    for (idx, line) in lines {
        let entry = LockfileEntry::decode_line(line).map_err(|reason| corrupt(idx + 1, reason))?;
        let output = entry.output.clone();
        map.insert(entry.call(), output);
    }
    Ok(map)
}

/// Render a lock map to its canonical bytes
pub fn render(map: &LockMap) -> String {
    let mut out = String::with_capacity(VERSION_HEADER.len() + 1 + map.len() * 96);
    out.push_str(VERSION_HEADER);
    out.push('\n');
    for (call, output) in map {
        out.push_str(&LockfileEntry::new(call.clone(), output.clone()).encode_line());
        out.push('\n');
    }
    out
}

fn check_header(line: &str) -> Result<(), String> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| format!("invalid version header: {}", e))?;
    let pairs = value
        .as_array()
        .ok_or_else(|| "version header must be an array of pairs".to_string())?;

    let version = pairs.iter().find_map(|pair| match pair.as_array() {
        Some(kv) if kv.len() == 2 && kv[0] == "version" => kv[1].as_str(),
        _ => None,
    });

    match version {
        Some(FORMAT_VERSION) => Ok(()),
        Some(other) => Err(format!("unsupported lockfile version '{}'", other)),
        None => Err("missing version header".to_string()),
    }
}
