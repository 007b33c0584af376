use cairn::{
    Backend, ClassDescriptor, IndexManager, Indexer, MemoryBackend, ObjectStore, Order,
    StorageError, Type, Value,
};
use std::sync::Arc;

fn indexed_accounts() -> (ObjectStore, IndexManager, cairn::Class, Arc<MemoryBackend>) {
    let store = ObjectStore::new(MemoryBackend::new());
    let accounts = store
        .register(
            ClassDescriptor::builder("IdxAccount")
                .property("email", Type::String)
                .index("email", Indexer::Normalize)
                .build()
                .unwrap(),
        )
        .unwrap();
    let index_backend = Arc::new(MemoryBackend::new());
    let manager = IndexManager::with_backend(index_backend.clone());
    manager.adopt(&accounts);
    (store, manager, accounts, index_backend)
}

#[test]
fn normalized_lookup_finds_the_account() {
    let (_store, _manager, accounts, _backend) = indexed_accounts();

    let account = accounts.create();
    account
        .set("email", &Value::from("  Alice@Example.COM "))
        .unwrap();
    account.save().unwrap();

    let by_email = accounts.by("email").unwrap();
    let hits: Vec<_> = by_email
        .get("alice@example.com")
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].same_identity(&account));

    assert!(by_email.has("alice@example.com").unwrap());
    assert_eq!(by_email.count("alice@example.com").unwrap(), 1);
    assert!(!by_email.has("bob@example.com").unwrap());
}

#[test]
fn saving_a_change_moves_the_index_entry() {
    let (_store, _manager, accounts, _backend) = indexed_accounts();
    let account = accounts.create();
    account.set("email", &Value::from("old@x")).unwrap();
    account.save().unwrap();

    account.set("email", &Value::from("new@x")).unwrap();
    account.save().unwrap();

    let by_email = accounts.by("email").unwrap();
    assert!(!by_email.has("old@x").unwrap());
    assert_eq!(by_email.one("new@x", 0).unwrap().oid(), account.oid());
}

#[test]
fn removal_drops_every_index_entry() {
    let (_store, _manager, accounts, backend) = indexed_accounts();
    let account = accounts.create();
    account.set("email", &Value::from("gone@x")).unwrap();
    account.save().unwrap();

    account.remove().unwrap();
    let by_email = accounts.by("email").unwrap();
    assert!(!by_email.has("gone@x").unwrap());
    // Only the bucket bookkeeping may remain in the index backend.
    assert!(backend.keys("IdxAccount/").unwrap().is_empty());
}

#[test]
fn one_misses_with_not_found() {
    let (_store, _manager, accounts, _backend) = indexed_accounts();
    let err = accounts.by("email").unwrap().one("nobody@x", 0).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn undeclared_index_is_rejected() {
    let (_store, _manager, accounts, _backend) = indexed_accounts();
    let err = accounts.by("nope").unwrap_err();
    assert!(matches!(err, StorageError::UnknownProperty { .. }));
}

#[test]
fn query_without_a_manager_is_unsupported() {
    let store = ObjectStore::new(MemoryBackend::new());
    let things = store
        .register(
            ClassDescriptor::builder("UnmanagedThing")
                .property("name", Type::String)
                .index("name", Indexer::Value)
                .build()
                .unwrap(),
        )
        .unwrap();
    let err = things.by("name").unwrap_err();
    assert!(matches!(err, StorageError::Unsupported { .. }));
}

#[test]
fn keyword_search_over_title_and_content() {
    let store = ObjectStore::new(MemoryBackend::new());
    let articles = store
        .register(
            ClassDescriptor::builder("Article")
                .property("title", Type::String)
                .property("content", Type::String)
                .index("keywords", Indexer::keywords_over(["title", "content"], 3))
                .build()
                .unwrap(),
        )
        .unwrap();
    let manager = IndexManager::new(MemoryBackend::new());
    manager.adopt(&articles);

    let article = articles.create();
    article.set("title", &Value::from("The quick fox")).unwrap();
    article
        .set("content", &Value::from("over lazy dogs"))
        .unwrap();
    article.save().unwrap();

    let by_keywords = articles.by("keywords").unwrap();
    let mut keys = by_keywords.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["dogs", "fox", "lazy", "over", "quick", "the"]);

    let hits: Vec<_> = by_keywords.get("fox").unwrap().map(Result::unwrap).collect();
    assert_eq!(hits.len(), 1);
    assert!(!by_keywords.has("a").unwrap());
}

#[test]
fn paths_index_matches_every_prefix() {
    let store = ObjectStore::new(MemoryBackend::new());
    let files = store
        .register(
            ClassDescriptor::builder("FileEntry")
                .property("folder", Type::String)
                .index("folder", Indexer::Paths { separator: '/' })
                .build()
                .unwrap(),
        )
        .unwrap();
    let manager = IndexManager::new(MemoryBackend::new());
    manager.adopt(&files);

    let file = files.create();
    file.set("folder", &Value::from("a/b/c")).unwrap();
    file.save().unwrap();

    let by_folder = files.by("folder").unwrap();
    assert_eq!(by_folder.keys().unwrap(), vec!["a", "a/b", "a/b/c"]);
    assert!(by_folder.has("a/b").unwrap());

    assert_eq!(
        by_folder.list(0, None, Some(2), Order::Desc).unwrap(),
        vec!["a/b/c", "a/b"]
    );
    assert_eq!(
        by_folder.list(1, None, None, Order::Asc).unwrap(),
        vec!["a/b", "a/b/c"]
    );
}

#[test]
fn update_time_index_orders_chronologically() {
    let store = ObjectStore::new(MemoryBackend::new());
    let events = store
        .register(
            ClassDescriptor::builder("Event")
                .property("name", Type::String)
                .index("recent", Indexer::UpdateTime)
                .build()
                .unwrap(),
        )
        .unwrap();
    let manager = IndexManager::new(MemoryBackend::new());
    manager.adopt(&events);

    let first = events.create();
    first.set("name", &Value::from("first")).unwrap();
    first.save().unwrap();
    let second = events.create();
    second.set("name", &Value::from("second")).unwrap();
    second.save().unwrap();

    let by_recent = events.by("recent").unwrap();
    let keys = by_recent.list(0, None, None, Order::Desc).unwrap();
    assert_eq!(keys.len(), 2);
    let newest: Vec<_> = by_recent.get(&keys[0]).unwrap().map(Result::unwrap).collect();
    assert!(newest[0].same_identity(&second));
}

#[test]
fn insertion_order_is_preserved_per_key() {
    let (_store, _manager, accounts, _backend) = indexed_accounts();
    let mut oids = Vec::new();
    for _ in 0..3 {
        let account = accounts.create();
        account.set("email", &Value::from("shared@x")).unwrap();
        account.save().unwrap();
        oids.push(account.oid().unwrap());
    }
    let listed = accounts.by("email").unwrap().oids("shared@x").unwrap();
    assert_eq!(listed, oids);
}

#[test]
fn rebuild_reconstructs_identical_results() {
    let (_store, manager, accounts, index_backend) = indexed_accounts();
    let account = accounts.create();
    account.set("email", &Value::from("keep@x")).unwrap();
    account.save().unwrap();

    // Wipe the index backend outright, then rebuild from the objects.
    index_backend.clear().unwrap();
    assert!(!accounts.by("email").unwrap().has("keep@x").unwrap());

    let indexed = manager.rebuild(true).unwrap();
    assert_eq!(indexed, 1);
    assert!(accounts.by("email").unwrap().has("keep@x").unwrap());
    assert!(manager.last_rebuild().unwrap().is_some());
}

#[test]
fn rebuild_is_idempotent() {
    let (_store, manager, accounts, index_backend) = indexed_accounts();
    for email in ["a@x", "b@x"] {
        let account = accounts.create();
        account.set("email", &Value::from(email)).unwrap();
        account.save().unwrap();
    }

    manager.rebuild(false).unwrap();
    let mut first: Vec<(String, Vec<u8>)> = Vec::new();
    for key in index_backend.keys("IdxAccount/").unwrap() {
        first.push((key.clone(), index_backend.get(&key).unwrap().unwrap()));
    }

    manager.rebuild(false).unwrap();
    let mut second: Vec<(String, Vec<u8>)> = Vec::new();
    for key in index_backend.keys("IdxAccount/").unwrap() {
        second.push((key.clone(), index_backend.get(&key).unwrap().unwrap()));
    }
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn index_keys_with_separators_stay_scoped() {
    let store = ObjectStore::new(MemoryBackend::new());
    let docs = store
        .register(
            ClassDescriptor::builder("PathedDoc")
                .property("slug", Type::String)
                .index("slug", Indexer::Value)
                .build()
                .unwrap(),
        )
        .unwrap();
    let index_backend = Arc::new(MemoryBackend::new());
    let manager = IndexManager::with_backend(index_backend.clone());
    manager.adopt(&docs);

    let doc = docs.create();
    doc.set("slug", &Value::from("a/b")).unwrap();
    doc.save().unwrap();

    // The stored bucket key escapes the separator.
    let raw_keys = index_backend.keys("PathedDoc/slug/").unwrap();
    assert_eq!(raw_keys.len(), 1);
    assert!(raw_keys[0].ends_with("a%2Fb"));

    // And the decoded view matches what was indexed.
    assert_eq!(docs.by("slug").unwrap().keys().unwrap(), vec!["a/b"]);
    assert!(docs.by("slug").unwrap().has("a/b").unwrap());
}
