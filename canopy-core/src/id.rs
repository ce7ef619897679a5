//! Reversible encoding between worktree paths and server ids.
//!
//! A server id is the base64url (no padding) encoding of the absolute
//! working-directory path, so ids are safe to embed in protocol messages
//! and URLs without escaping, and the original path can always be
//! recovered from the id alone.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::path::{Path, PathBuf};

/// Encode a working-directory path into a stable server id.
pub fn server_id(path: &Path) -> String {
    URL_SAFE_NO_PAD.encode(path.to_string_lossy().as_bytes())
}

/// Decode a server id back into the working-directory path it was derived
/// from. Returns `None` for ids that are not valid base64url or do not
/// decode to UTF-8.
pub fn server_path(id: &str) -> Option<PathBuf> {
    let bytes = URL_SAFE_NO_PAD.decode(id.as_bytes()).ok()?;
    let s = String::from_utf8(bytes).ok()?;
    if s.is_empty() {
        return None;
    }
    Some(PathBuf::from(s))
}
