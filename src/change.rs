//! Change-feed value types.
//!
//! A [`Change`] is one document mutation event as delivered by a store's
//! change feed. Sequence tokens are opaque strings; within one feed
//! instance they are monotonically non-decreasing in delivery order, so a
//! consumer can remember the last-seen token and resume after a disconnect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Feed consumption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Finite: the store returns all changes since `since`, then ends.
    Normal,
    /// The connection stays open; new changes arrive as they occur.
    /// No natural end - the consumer must cancel to stop.
    Continuous,
}

/// Resume point for opening a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Since {
    /// From the beginning of the feed's history.
    Beginning,
    /// From (exclusive) the given sequence token.
    Seq(String),
}

impl Since {
    /// Build a resume point from a sequence token.
    pub fn seq(token: impl Into<String>) -> Self {
        Self::Seq(token.into())
    }

    /// The token form of this resume point. `Beginning` is `"0"`.
    pub fn as_token(&self) -> &str {
        match self {
            Self::Beginning => "0",
            Self::Seq(s) => s,
        }
    }
}

impl Default for Since {
    fn default() -> Self {
        Self::Beginning
    }
}

impl std::fmt::Display for Since {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

impl From<&str> for Since {
    fn from(token: &str) -> Self {
        if token == "0" {
            Self::Beginning
        } else {
            Self::Seq(token.to_string())
        }
    }
}

/// One document mutation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Opaque, store-assigned, totally ordered position token.
    pub seq: String,
    /// Id of the mutated document.
    pub id: String,
    /// Opaque version token of the mutation.
    pub rev: String,
    /// Whether the mutation was a deletion.
    pub deleted: bool,
    /// Full document body, present only if docs were requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl Change {
    /// Check if this change carries a document body.
    pub fn has_doc(&self) -> bool {
        self.doc.is_some()
    }
}

/// Result of a pull-mode [`get_changes`](crate::listener::ChangesListener::get_changes) call.
#[derive(Debug, Clone)]
pub struct ChangesPage {
    /// Changes in non-decreasing sequence order.
    pub results: Vec<Change>,
    /// Sequence token to pass as `since` to continue where this page ended.
    /// Equals the `since` the call was made with when no changes arrived.
    pub last_seq: String,
}

impl ChangesPage {
    /// Number of changes in this page.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if the page is empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_since_tokens() {
        assert_eq!(Since::Beginning.as_token(), "0");
        assert_eq!(Since::seq("17").as_token(), "17");
        assert_eq!(Since::default(), Since::Beginning);
        assert_eq!(Since::from("0"), Since::Beginning);
        assert_eq!(Since::from("23"), Since::seq("23"));
        assert_eq!(Since::seq("9").to_string(), "9");
    }

    #[test]
    fn test_change_has_doc() {
        let mut change = Change {
            seq: "1".to_string(),
            id: "doc-1".to_string(),
            rev: "1-abc".to_string(),
            deleted: false,
            doc: None,
        };
        assert!(!change.has_doc());
        change.doc = Some(json!({"name": "x"}));
        assert!(change.has_doc());
    }

    #[test]
    fn test_changes_page_len() {
        let page = ChangesPage {
            results: vec![],
            last_seq: "0".to_string(),
        };
        assert!(page.is_empty());
        assert_eq!(page.len(), 0);
    }

    #[test]
    fn test_change_serde_roundtrip() {
        let change = Change {
            seq: "5".to_string(),
            id: "doc-5".to_string(),
            rev: "2-def".to_string(),
            deleted: true,
            doc: None,
        };
        let encoded = serde_json::to_string(&change).unwrap();
        // Absent doc bodies stay off the wire
        assert!(!encoded.contains("doc\""));
        let decoded: Change = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, "doc-5");
        assert!(decoded.deleted);
    }
}
