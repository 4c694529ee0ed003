//! On-disk names for cached and staged blobs.
//!
//! Keys are percent-encoded before they become file names, so a key such as
//! `photos/2024/a.jpg` or `../x` always maps to a single file directly inside
//! the owning directory.

use std::path::{Path, PathBuf};

/// Prefix for files still being written; swept at startup
pub const TEMP_PREFIX: &str = "temp-";
/// Prefix for cached blocks
pub const BLOCK_PREFIX: &str = "block-";
/// Prefix for staged blobs committed locally but not yet durable upstream
pub const PENDING_PREFIX: &str = "pending-";
/// Prefix for staged blobs confirmed durable upstream
pub const COMPLETED_PREFIX: &str = "completed-";

/// Encode a blob key into a single path component
pub fn encode_key(key: &str) -> String {
    let encoded = urlencoding::encode(key).into_owned();
    // `.` and `..` survive percent-encoding untouched
    match encoded.as_str() {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => encoded,
    }
}

/// Inverse of [`encode_key`]
pub fn decode_key(name: &str) -> Option<String> {
    urlencoding::decode(name).ok().map(|key| key.into_owned())
}

/// File name of the block of `key` starting at `offset`, as of write `epoch`
pub fn block_file_name(key: &str, epoch: u64, offset: u64) -> String {
    format!("{}{}-{}-{}", BLOCK_PREFIX, encode_key(key), epoch, offset)
}

/// Parse a block file name back into `(key, epoch, offset)`
pub fn parse_block_file_name(name: &str) -> Option<(String, u64, u64)> {
    // Encoded keys may contain '-', the numbers always follow the last two
    let (rest, offset) = name.strip_prefix(BLOCK_PREFIX)?.rsplit_once('-')?;
    let (encoded, epoch) = rest.rsplit_once('-')?;
    if encoded.is_empty() || !is_number(epoch) || !is_number(offset) {
        return None;
    }
    Some((decode_key(encoded)?, epoch.parse().ok()?, offset.parse().ok()?))
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// State of a staged blob, as recorded in its file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedState {
    Pending,
    Completed,
}

impl StagedState {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Pending => PENDING_PREFIX,
            Self::Completed => COMPLETED_PREFIX,
        }
    }

    /// Path of the staged file for `key` in this state
    pub fn path(self, dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{}{}", self.prefix(), encode_key(key)))
    }
}

/// Classify a file found in a staging directory
pub fn parse_staged_file_name(name: &str) -> Option<(StagedState, String)> {
    if let Some(encoded) = name.strip_prefix(PENDING_PREFIX) {
        return decode_key(encoded).map(|key| (StagedState::Pending, key));
    }
    if let Some(encoded) = name.strip_prefix(COMPLETED_PREFIX) {
        return decode_key(encoded).map(|key| (StagedState::Completed, key));
    }
    None
}
