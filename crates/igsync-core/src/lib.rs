//! Core data model shared by the igsync crates.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "igsync-core";

/// Upper bound (and default) for the number of items returned by a recent-items query.
pub const MAX_RECENT_ITEMS: usize = 12;

/// One media post as mirrored from the remote feed.
///
/// `timestamp` is kept as the opaque string the remote produced. The store
/// orders on it lexicographically, which matches chronological order only for
/// fixed-width, fixed-offset ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub media_url: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub timestamp: String,
}

impl Item {
    /// File extension used for the downloaded asset of this item.
    pub fn asset_extension(&self) -> &'static str {
        if self.media_type.eq_ignore_ascii_case("VIDEO") {
            "mp4"
        } else {
            "jpg"
        }
    }
}

/// Id-bearing entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Cursors {
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Paging {
    #[serde(default)]
    pub cursors: Cursors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// One page of the remote listing. The paging cursor is decoded but never followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ItemList {
    #[serde(rename = "data", default)]
    pub items: Vec<ItemSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging: Option<Paging>,
}

impl ItemList {
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|s| s.id.clone()).collect()
    }
}

/// Long-lived access credential. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
}

impl Credential {
    /// Credential seeded from an externally supplied bearer token.
    pub fn seed(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "bearer".to_string(),
            expires_in: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_without_caption_decodes_with_empty_caption() {
        let item: Item = serde_json::from_str(
            r#"{"id":"17","media_type":"IMAGE","media_url":"https://cdn/x.jpg","permalink":"https://p/x","username":"me","timestamp":"2021-07-01T10:00:00+0000"}"#,
        )
        .unwrap();
        assert_eq!(item.id, "17");
        assert_eq!(item.caption, "");
        assert_eq!(item.asset_extension(), "jpg");
    }

    #[test]
    fn video_items_use_mp4_assets() {
        let item = Item {
            id: "v".into(),
            media_type: "VIDEO".into(),
            ..Default::default()
        };
        assert_eq!(item.asset_extension(), "mp4");
    }

    #[test]
    fn listing_keeps_remote_order_and_duplicates() {
        let list: ItemList = serde_json::from_str(
            r#"{"data":[{"id":"b"},{"id":"a"},{"id":"b"}],"paging":{"cursors":{"before":"x","after":"y"}}}"#,
        )
        .unwrap();
        assert_eq!(list.ids(), vec!["b", "a", "b"]);
        assert_eq!(list.paging.unwrap().cursors.after, "y");
    }

    #[test]
    fn listing_without_paging_decodes() {
        let list: ItemList = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(list.items.is_empty());
        assert!(list.paging.is_none());
    }
}
