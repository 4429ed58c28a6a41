//! Decode boundary for one line of a newline-delimited watch response.
//!
//! Shape is validated once here; everything downstream works with [`Envelope`].

use serde::Deserialize;

use crate::{Envelope, EventKind};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LineKind {
    Added,
    Modified,
    Deleted,
    Error,
    Bookmark,
}

/// Raw watch line: required `type`, optional `object`.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchLine {
    #[serde(rename = "type")]
    pub kind: LineKind,
    #[serde(default)]
    pub object: Option<serde_json::Value>,
}

impl WatchLine {
    pub fn into_envelope(self) -> Option<Envelope> {
        let kind = match self.kind {
            LineKind::Added => EventKind::Added,
            LineKind::Modified => EventKind::Modified,
            LineKind::Deleted => EventKind::Deleted,
            LineKind::Bookmark => return None,
            LineKind::Error => {
                let message = self.object.as_ref().map(status_message).unwrap_or_default();
                return Some(Envelope::error(message, self.object));
            }
        };
        match self.object {
            Some(obj) => Some(Envelope::update(kind, obj)),
            None => Some(Envelope::error(format!("{} event without object", kind.as_str()), None)),
        }
    }
}

/// Decode one line. Blank lines and bookmarks yield `None`; malformed lines
/// and unknown event types become an error envelope.
pub fn decode_line(line: &str) -> Option<Envelope> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<WatchLine>(line) {
        Ok(wl) => wl.into_envelope(),
        Err(e) => Some(Envelope::error(format!("malformed watch line: {}", e), None)),
    }
}

// Status objects carry `message`, `reason` and `code`; take the first one present.
fn status_message(status: &serde_json::Value) -> String {
    if let Some(m) = status.get("message").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        return m.to_string();
    }
    if let Some(r) = status.get("reason").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        return r.to_string();
    }
    match status.get("code").and_then(|v| v.as_i64()) {
        Some(code) => format!("upstream watch error (code {})", code),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_added_line() {
        let env = decode_line(r#"{"type":"ADDED","object":{"metadata":{"name":"x","resourceVersion":"7"}}}"#).unwrap();
        assert_eq!(env.kind, EventKind::Added);
        assert_eq!(env.name(), Some("x"));
        assert_eq!(env.resource_version.as_deref(), Some("7"));
    }

    #[test]
    fn error_line_takes_status_message() {
        let env = decode_line(r#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version","code":410}}"#).unwrap();
        assert!(env.is_error());
        assert_eq!(env.error.as_deref(), Some("too old resource version"));
    }

    #[test]
    fn error_line_without_message_still_has_text() {
        let env = decode_line(r#"{"type":"ERROR","object":{"code":500}}"#).unwrap();
        assert_eq!(env.error.as_deref(), Some("upstream watch error (code 500)"));
        let bare = decode_line(r#"{"type":"ERROR"}"#).unwrap();
        assert!(!bare.error.unwrap().is_empty());
    }

    #[test]
    fn blank_and_bookmark_lines_are_skipped() {
        assert!(decode_line("   ").is_none());
        assert!(decode_line(r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"9"}}}"#).is_none());
    }

    #[test]
    fn garbage_and_unknown_types_become_errors() {
        assert!(decode_line("{not json").unwrap().is_error());
        assert!(decode_line(r#"{"type":"RESYNC","object":{}}"#).unwrap().is_error());
    }
}
