//! Import parsers: structured JSON exports and bookmark-folder HTML.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use curio_core::{now_millis, Item, ItemKind, UNTITLED};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "curio-adapters";

/// Tag assigned to structured-export sites whose group id resolves to
/// nothing.
const ORPHAN_GROUP_TAG: &str = "Imported";
/// Tag assigned to bookmark links with no enclosing folder.
const ROOT_FOLDER_TAG: &str = "Bookmarks";
/// Name used for folder headers with empty text.
const UNNAMED_FOLDER: &str = "Folder";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed import payload: {0}")]
    Parse(String),
    #[error("unsupported file type {0:?}: expected .json or .html")]
    UnsupportedFormat(String),
}

/// Single import entry point: raw file bytes plus the declared file
/// name. The extension selects the parser; every produced item of one
/// run shares a category derived from the file name so the run can be
/// traced and undone later.
pub fn import_file(bytes: &[u8], file_name: &str) -> Result<Vec<Item>, ImportError> {
    let category = derived_category(file_name);
    let text = String::from_utf8_lossy(bytes);
    let extension = Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("json") => parse_grouped_export(&text, &category),
        Some("html") | Some("htm") => parse_bookmark_html(&text, &category),
        _ => Err(ImportError::UnsupportedFormat(file_name.to_string())),
    }
}

/// `"bookmarks.json"` -> `"From bookmarks"`.
pub fn derived_category(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(OsStr::to_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(file_name);
    format!("From {stem}")
}

// --- Structured export (named groups + sites referencing them) ---

#[derive(Debug, Deserialize)]
struct GroupedExport {
    groups: Vec<ExportGroup>,
    sites: Vec<ExportSite>,
}

#[derive(Debug, Deserialize)]
struct ExportGroup {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExportSite {
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

pub fn parse_grouped_export(text: &str, category: &str) -> Result<Vec<Item>, ImportError> {
    let export: GroupedExport = serde_json::from_str(text)
        .map_err(|err| ImportError::Parse(format!("not a grouped export: {err}")))?;

    let group_names: HashMap<i64, &str> = export
        .groups
        .iter()
        .map(|group| (group.id, group.name.as_str()))
        .collect();

    let items = export
        .sites
        .into_iter()
        .map(|site| {
            let group = site
                .group_id
                .and_then(|id| group_names.get(&id).copied())
                .unwrap_or(ORPHAN_GROUP_TAG);
            let summary = join_summary(&[site.description.as_deref(), site.notes.as_deref()]);
            let created_at = site
                .created_at
                .as_deref()
                .and_then(parse_export_timestamp)
                .unwrap_or_else(now_millis);

            let mut item = Item::new(
                ItemKind::Link,
                site.url.unwrap_or_default(),
                non_empty(site.name).unwrap_or_else(|| UNTITLED.to_string()),
            );
            item.summary = summary;
            item.category = Some(category.to_string());
            item.tags = vec![group.to_string()];
            item.created_at = created_at;
            item
        })
        .collect();
    Ok(items)
}

/// Join the non-blank parts with a newline; `None` when all are blank.
fn join_summary(parts: &[Option<&str>]) -> Option<String> {
    let joined = parts
        .iter()
        .filter_map(|part| part.map(str::trim).filter(|s| !s.is_empty()))
        .collect::<Vec<_>>()
        .join("\n");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// RFC 3339 first, then a couple of common date-time shapes, all read
/// as UTC. Unparseable values fall back to the caller's default.
fn parse_export_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp_millis());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(parsed.and_utc().timestamp_millis());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(parsed.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    None
}

// --- Bookmark-folder HTML export ---

pub fn parse_bookmark_html(html: &str, category: &str) -> Result<Vec<Item>, ImportError> {
    let anchors =
        Selector::parse("a").map_err(|err| ImportError::Parse(err.to_string()))?;
    let document = Html::parse_document(html);

    let mut items = Vec::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !is_web_url(href) {
            continue;
        }

        let title = anchor.text().collect::<String>();
        let title = title.trim();
        let created_at = anchor
            .value()
            .attr("add_date")
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or_else(now_millis);

        let mut tags = folder_chain(anchor);
        if tags.is_empty() {
            tags.push(ROOT_FOLDER_TAG.to_string());
        }

        let mut item = Item::new(
            ItemKind::Link,
            href,
            if title.is_empty() { UNTITLED } else { title },
        );
        item.category = Some(category.to_string());
        item.tags = tags;
        item.created_at = created_at;
        items.push(item);
    }
    Ok(items)
}

fn is_web_url(href: &str) -> bool {
    let lower = href.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return false;
    }
    !["place:", "javascript:", "data:", "about:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

/// Enclosing folder names for a link, outermost first. Bookmark
/// exports put each folder header either inside the `<dt>` that wraps
/// its `<dl>` list or as the list's preceding sibling.
fn folder_chain(link: ElementRef<'_>) -> Vec<String> {
    let mut chain = Vec::new();
    for ancestor in link.ancestors() {
        let Some(element) = ElementRef::wrap(ancestor) else {
            continue;
        };
        if element.value().name() != "dl" {
            continue;
        }
        if let Some(name) = folder_name_for_list(element) {
            chain.push(name);
        }
    }
    chain.reverse();
    chain
}

fn folder_name_for_list(list: ElementRef<'_>) -> Option<String> {
    if let Some(parent) = list.parent().and_then(ElementRef::wrap) {
        if parent.value().name() == "dt" {
            if let Some(header) = first_child_header(parent) {
                return Some(header);
            }
        }
    }
    for node in list.prev_siblings() {
        if let Some(element) = ElementRef::wrap(node) {
            if element.value().name() == "h3" {
                return Some(header_text(element));
            }
            break;
        }
    }
    None
}

fn first_child_header(parent: ElementRef<'_>) -> Option<String> {
    parent
        .children()
        .filter_map(ElementRef::wrap)
        .find(|element| element.value().name() == "h3")
        .map(header_text)
}

fn header_text(header: ElementRef<'_>) -> String {
    let text = header.text().collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        UNNAMED_FOLDER.to_string()
    } else {
        text.to_string()
    }
}
