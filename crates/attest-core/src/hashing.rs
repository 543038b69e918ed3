//! Canonical JSON and SHA-256 helpers shared by the ledger and pack store.
//!
//! The canonical form is `serde_json::Value` rendered compactly: object keys
//! are sorted (the default `Map` is a `BTreeMap`) with no whitespace.
//! Non-ASCII characters are written as `\uXXXX` escapes, so the hash input is
//! pure ASCII.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::io::Read;
use std::path::Path;

/// 64 hex zeros, the `previous_entry_hash` of the first ledger entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn canonical_json(value: &Value) -> String {
    // Serializing a Value cannot fail: keys are strings and numbers are finite.
    let compact = serde_json::to_string(value).unwrap_or_default();
    if compact.is_ascii() {
        return compact;
    }
    // Outside string literals JSON text is ASCII, so every char escaped here
    // sits inside a string.
    let mut out = String::with_capacity(compact.len() + 16);
    let mut units = [0u16; 2];
    for c in compact.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{unit:04x}");
            }
        }
    }
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash of `value` in canonical form with the top-level `exclude` key removed.
pub fn canonical_hash_excluding(value: &Value, exclude: &str) -> String {
    let mut copy = value.clone();
    if let Value::Object(map) = &mut copy {
        map.remove(exclude);
    }
    sha256_hex(canonical_json(&copy).as_bytes())
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Current UTC time as `2026-01-01T12:00:00Z`.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Microsecond timestamp for records that are ordered by creation time.
pub fn utc_timestamp_precise() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
