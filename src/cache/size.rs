//! Disk budget parsing and reporting
//!
//! `keep_bytes` accepts an absolute byte count, a size with a binary unit
//! (`"512MB"`, `"10GB"`), or a percentage of the filesystem holding the
//! cache (`"5%"`). Percentages are evaluated when a GC pass runs, not when
//! the configuration is read, and are rounded up to a whole GiB.

use crate::error::{CairnError, CairnResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.1} TB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Round up to the next whole GiB
pub fn round_up_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB).saturating_mul(GIB)
}

/// Parse `"1024"`, `"512K"`, `"10GB"`, `"2TiB"` (binary units, case-insensitive)
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("'{}' does not start with a number", raw));
    }

    let value: u64 = digits
        .parse()
        .map_err(|e| format!("'{}': {}", raw, e))?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        other => return Err(format!("unknown size unit '{}' in '{}'", other, raw)),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("'{}' overflows a 64-bit byte count", raw))
}

/// Configured disk budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "KeepBytesRepr", into = "KeepBytesRepr")]
pub enum KeepBytes {
    /// Fixed byte count
    Absolute(u64),
    /// Percentage (0, 100] of the cache filesystem's total size
    Percent(f64),
}

impl Default for KeepBytes {
    fn default() -> Self {
        Self::Percent(10.0)
    }
}

impl KeepBytes {
    /// Resolve to an absolute byte count for the filesystem at `storage_root`
    pub fn resolve(&self, storage_root: &Path) -> CairnResult<u64> {
        match *self {
            Self::Absolute(bytes) => Ok(bytes),
            Self::Percent(pct) => {
                let total = filesystem_total_bytes(storage_root)?;
                Ok(percent_of(total, pct))
            }
        }
    }
}

fn percent_of(total: u64, pct: f64) -> u64 {
    let raw = (total as f64 * pct / 100.0).ceil() as u64;
    round_up_gib(raw)
}

impl FromStr for KeepBytes {
    type Err = CairnError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct.trim().parse().map_err(|_| {
                CairnError::InvalidGcConfig(format!("keep_bytes '{}' is not a percentage", raw))
            })?;
            if !(value > 0.0 && value <= 100.0) {
                return Err(CairnError::InvalidGcConfig(format!(
                    "keep_bytes percentage must be in (0, 100], got '{}'",
                    raw
                )));
            }
            return Ok(Self::Percent(value));
        }

        parse_size(s)
            .map(Self::Absolute)
            .map_err(|reason| CairnError::InvalidGcConfig(format!("keep_bytes {}", reason)))
    }
}

impl fmt::Display for KeepBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(bytes) => write!(f, "{}", bytes),
            Self::Percent(pct) => write!(f, "{}%", pct),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum KeepBytesRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<KeepBytesRepr> for KeepBytes {
    type Error = CairnError;

    fn try_from(repr: KeepBytesRepr) -> Result<Self, Self::Error> {
        match repr {
            KeepBytesRepr::Bytes(bytes) => Ok(Self::Absolute(bytes)),
            KeepBytesRepr::Text(text) => text.parse(),
        }
    }
}

impl From<KeepBytes> for KeepBytesRepr {
    fn from(keep: KeepBytes) -> Self {
        match keep {
            KeepBytes::Absolute(bytes) => Self::Bytes(bytes),
            KeepBytes::Percent(_) => Self::Text(keep.to_string()),
        }
    }
}

/// Total size of the filesystem containing `path`
#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
pub fn filesystem_total_bytes(path: &Path) -> CairnResult<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| CairnError::StorageStat {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"),
    })?;

    // SAFETY: statvfs only writes into the zeroed struct we own, and
    // c_path is a valid NUL-terminated string for the duration of the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(CairnError::StorageStat {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }

    Ok((stat.f_blocks as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn filesystem_total_bytes(path: &Path) -> CairnResult<u64> {
    Err(CairnError::StorageStat {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "filesystem size is only available on unix",
        ),
    })
}

/// Cache size status relative to the enforced budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSizeStatus {
    /// Under 80% of budget
    Ok,
    /// Between 80% and 100% of budget
    Warning,
    /// Over budget; the next GC pass will evict
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current size and budget
    pub fn from_usage(current_bytes: u64, limit_bytes: u64) -> Self {
        if current_bytes > limit_bytes {
            return Self::Exceeded;
        }
        if Self::percentage(current_bytes, limit_bytes) >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of budget used
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}
