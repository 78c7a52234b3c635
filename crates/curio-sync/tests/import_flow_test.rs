//! End-to-end import flow against a local store: parse, stage,
//! resolve conflicts one decision at a time, then clean up duplicates.

use curio_adapters::import_file;
use curio_core::ItemKind;
use curio_storage::{Gateway, LocalStore};
use curio_sync::{
    apply_retention, duplicate_groups, stage_import, ConflictAction, RetentionPolicy,
};
use tempfile::tempdir;

const BOOKMARKS_HTML: &str = r#"<!DOCTYPE NETSCAPE-Bookmark-file-1>
<H1>Bookmarks</H1>
<DL><p>
    <DT><H3>Work</H3>
    <DL><p>
        <DT><A HREF="https://duplicate.example" ADD_DATE="1700000300">Dup (import)</A>
        <DT><A HREF="https://fresh.example" ADD_DATE="1700000400">Fresh</A>
    </DL><p>
</DL><p>
"#;

#[tokio::test]
async fn import_stages_conflicts_and_dedup_cleans_the_rest() {
    let dir = tempdir().expect("tempdir");
    let gateway = Gateway::local(LocalStore::new(dir.path()));

    // Pre-existing collection holds one link that will conflict.
    let mut seeded = curio_core::Item::new(
        ItemKind::Link,
        "https://duplicate.example",
        "Dup (stored)",
    );
    seeded.created_at = 100;
    gateway.upsert_one(&seeded).await.expect("seed");

    let candidates = import_file(BOOKMARKS_HTML.as_bytes(), "bookmarks.html").expect("parse");
    assert_eq!(candidates.len(), 2);
    assert!(candidates
        .iter()
        .all(|item| item.category.as_deref() == Some("From bookmarks")));
    assert!(candidates.iter().all(|item| item.tags == vec!["Work"]));

    let mut outcome = stage_import(&gateway, candidates).await.expect("stage");
    assert_eq!(outcome.imported, 1);
    assert_eq!(outcome.conflicts.len(), 1);

    // Keep the conflicting candidate: both copies now coexist.
    outcome
        .conflicts
        .resolve_head(ConflictAction::Keep, &gateway)
        .await
        .expect("keep");
    assert!(outcome.conflicts.is_empty());

    let items = gateway.list_all().await.expect("list");
    assert_eq!(items.len(), 3);

    // The kept copy created a duplicate group; keep-newest removes the
    // older stored copy and leaves the fresh import untouched.
    let groups = duplicate_groups(&items);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].content, "https://duplicate.example");

    let deleted = apply_retention(&gateway, &groups, RetentionPolicy::KeepNewest)
        .await
        .expect("dedup");
    assert_eq!(deleted, 1);

    let remaining = gateway.list_all().await.expect("list after dedup");
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|item| item.id != seeded.id));
    assert!(remaining
        .iter()
        .any(|item| item.content == "https://fresh.example"));
}

#[tokio::test]
async fn skip_all_discards_the_remaining_tail() {
    let dir = tempdir().expect("tempdir");
    let gateway = Gateway::local(LocalStore::new(dir.path()));

    // Seed three stored links matching everything the import carries.
    for (i, url) in ["https://a.example", "https://b.example", "https://c.example"]
        .iter()
        .enumerate()
    {
        let mut item = curio_core::Item::new(ItemKind::Link, *url, format!("stored-{i}"));
        item.created_at = i as i64;
        gateway.upsert_one(&item).await.expect("seed");
    }

    let html = r#"<DL><p>
        <DT><A HREF="https://a.example">A</A>
        <DT><A HREF="https://b.example">B</A>
        <DT><A HREF="https://c.example">C</A>
    </DL><p>"#;
    let candidates = import_file(html.as_bytes(), "all-dups.html").expect("parse");

    let mut outcome = stage_import(&gateway, candidates).await.expect("stage");
    assert_eq!(outcome.imported, 0);
    assert_eq!(outcome.conflicts.len(), 3);

    outcome
        .conflicts
        .resolve_head(ConflictAction::SkipAll, &gateway)
        .await
        .expect("skip all");
    assert!(outcome.conflicts.is_empty());

    // Nothing from the import was persisted.
    assert_eq!(gateway.list_all().await.expect("list").len(), 3);
}
