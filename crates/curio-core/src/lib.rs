//! Core domain model and configuration types for Curio.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "curio-core";

/// Sentinel category applied when an item carries none. Never written
/// back into storage, only used for grouping and filtering.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Fallback title for sources that provide an empty one.
pub const UNTITLED: &str = "Untitled";

/// Current time as epoch milliseconds, the unit `created_at` carries.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Link,
    Note,
    Snippet,
}

/// A single stored record: a saved link, a free-text note, or a code
/// snippet. Wire format is the camelCase JSON the remote store speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Primary payload: the URL for links, free text otherwise. Byte
    /// equality of link contents is the duplicate-detection key.
    pub content: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Machine-generated summary, written only by the enrichment
    /// pipeline or single-item analysis. Never auto-cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: i64,
}

impl Item {
    pub fn new(kind: ItemKind, content: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            title: title.into(),
            summary: None,
            ai_summary: None,
            category: None,
            tags: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn is_link(&self) -> bool {
        self.kind == ItemKind::Link
    }

    /// Category for grouping purposes; an absent or empty category maps
    /// to the [`UNCATEGORIZED`] sentinel without rewriting storage.
    pub fn effective_category(&self) -> &str {
        self.category
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(UNCATEGORIZED)
    }

    /// Union new tags into the existing set, preserving insertion order
    /// and dropping case-sensitive duplicates. Tags only accumulate.
    pub fn add_tags(&mut self, incoming: impl IntoIterator<Item = String>) {
        for tag in incoming {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }
}

/// Process-wide configuration, loaded once at startup and persisted
/// only on explicit save. Dependent gateways are rebuilt after a save
/// rather than re-inspecting these fields per call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Ordered credentials rotated by the enrichment pipeline.
    #[serde(default)]
    pub analysis_keys: Vec<String>,
}

impl AppConfig {
    /// Remote mode is active iff both endpoint and token are non-empty.
    pub fn remote_configured(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.api_endpoint) && filled(&self.auth_token)
    }
}

/// Structured result returned by the content-analysis capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub kind: ItemKind,
}
