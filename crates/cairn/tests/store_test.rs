use cairn::{
    ClassDescriptor, DirectoryBackend, MemoryBackend, ObjectStore, Oid, StorageError, Timestamp,
    Type, Value,
};
use std::collections::BTreeMap;

fn account_store() -> (ObjectStore, cairn::Class) {
    let store = ObjectStore::new(MemoryBackend::new());
    let accounts = store
        .register(
            ClassDescriptor::builder("Account")
                .property("email", Type::Email)
                .property("age", Type::Positive)
                .build()
                .unwrap(),
        )
        .unwrap();
    (store, accounts)
}

fn map(entries: &[(&str, Value)]) -> Value {
    Value::Map(
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[test]
fn create_save_and_retrieve() {
    let (_store, accounts) = account_store();

    let account = accounts.create();
    let created_save_stamp = account.update_time("oid");
    account.set("email", &Value::from("A@x")).unwrap();
    assert!(account.oid().is_none());

    account.save().unwrap();
    let oid = account.oid().expect("oid allocated at first save");

    let retrieved = accounts.get(&oid).unwrap();
    assert_eq!(
        retrieved.get("email").unwrap(),
        Some(Value::from("A@x"))
    );
    assert!(retrieved.update_time("email") >= created_save_stamp);
    assert!(retrieved.update_time("oid") >= retrieved.update_time("email"));
}

#[test]
fn save_is_idempotent_when_clean() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account.set("email", &Value::from("a@x")).unwrap();
    account.save().unwrap();

    let stamp = account.update_time("oid");
    account.save().unwrap();
    assert_eq!(account.update_time("oid"), stamp);

    account.set("age", &Value::from(30)).unwrap();
    assert!(account.is_dirty());
    account.save().unwrap();
    assert!(account.update_time("oid") > stamp);
}

#[test]
fn identity_cache_returns_the_same_instance() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account.set("email", &Value::from("a@x")).unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();

    let a = accounts.get(&oid).unwrap();
    let b = accounts.get(&oid).unwrap();
    assert!(a.same_identity(&b));
    assert!(a.same_identity(&account));
}

#[test]
fn dropping_all_handles_reloads_an_equal_object() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account.set("email", &Value::from("a@x")).unwrap();
    account.set("age", &Value::from(7)).unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();
    let exported = account.export(1);
    drop(account);

    let reloaded = accounts.get(&oid).unwrap();
    assert_eq!(reloaded.export(1), exported);
    assert!(!reloaded.is_dirty());
}

#[test]
fn export_depth_one_is_stable_across_save_and_reload() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account.set("email", &Value::from("a@x")).unwrap();
    account.save().unwrap();
    let before = account.export(1);
    let oid = account.oid().unwrap();
    drop(account);

    assert_eq!(accounts.get(&oid).unwrap().export(1), before);
}

#[test]
fn get_missing_is_not_found() {
    let (_store, accounts) = account_store();
    let err = accounts.get(&Oid::parse("NOPE").unwrap()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn ensure_creates_unsaved_and_preserves_identity() {
    let (_store, accounts) = account_store();
    let oid = Oid::parse("FIXED").unwrap();

    let ensured = accounts.ensure(&oid).unwrap();
    assert!(ensured.is_dirty());
    assert!(!accounts.has(&oid).unwrap() || ensured.oid().is_some());

    let again = accounts.ensure(&oid).unwrap();
    assert!(ensured.same_identity(&again));

    ensured.set("email", &Value::from("e@x")).unwrap();
    ensured.save().unwrap();
    assert!(accounts.has(&oid).unwrap());
    let got = accounts.get(&oid).unwrap();
    assert!(got.same_identity(&ensured));
}

#[test]
fn list_and_count_follow_key_order() {
    let (_store, accounts) = account_store();
    for oid in ["C3", "A1", "B2"] {
        let account = accounts.ensure(&Oid::parse(oid).unwrap()).unwrap();
        account.set("email", &Value::from("x@y")).unwrap();
        account.save().unwrap();
    }
    assert_eq!(accounts.count().unwrap(), 3);

    let all: Vec<String> = accounts
        .all()
        .unwrap()
        .map(|o| o.unwrap().oid().unwrap().as_str().to_owned())
        .collect();
    assert_eq!(all, vec!["A1", "B2", "C3"]);

    let window = accounts.list(Some(2), 1, None).unwrap();
    let oids: Vec<String> = window
        .iter()
        .map(|o| o.oid().unwrap().as_str().to_owned())
        .collect();
    assert_eq!(oids, vec!["B2", "C3"]);
}

#[test]
fn all_since_filters_by_save_time() {
    let (_store, accounts) = account_store();
    let old = accounts.ensure(&Oid::parse("OLD").unwrap()).unwrap();
    old.set("email", &Value::from("o@x")).unwrap();
    old.save().unwrap();

    let cut = Timestamp::now();

    let new = accounts.ensure(&Oid::parse("NEW").unwrap()).unwrap();
    new.set("email", &Value::from("n@x")).unwrap();
    new.save().unwrap();

    let seen: Vec<String> = accounts
        .all_since(cut)
        .unwrap()
        .map(|o| o.unwrap().oid().unwrap().as_str().to_owned())
        .collect();
    assert_eq!(seen, vec!["NEW"]);
}

#[test]
fn set_validates_and_reports_violations() {
    let (_store, accounts) = account_store();
    let account = accounts.create();

    let err = account.set("email", &Value::from("not-an-email")).unwrap_err();
    assert!(matches!(err, StorageError::InvalidValue { .. }));

    let err = account.set("nickname", &Value::from("x")).unwrap_err();
    assert!(matches!(err, StorageError::UnknownProperty { .. }));

    let err = account.set("oid", &Value::from("x")).unwrap_err();
    assert!(matches!(err, StorageError::ReservedProperty { .. }));

    // Failed sets leave nothing behind.
    assert_eq!(account.get("email").unwrap(), None);
}

#[test]
fn update_applies_multiple_attributes() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account
        .update(&map(&[
            ("email", Value::from("u@x")),
            ("age", Value::from(44)),
        ]))
        .unwrap();
    assert!(account.is_dirty());
    assert_eq!(account.get("age").unwrap(), Some(Value::from(44)));
    assert!(account.update_time("age") > Timestamp::EPOCH);
}

#[test]
fn attribute_stamps_are_monotonic() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account.set("email", &Value::from("a@x")).unwrap();
    let first = account.update_time("email");
    account.set("email", &Value::from("b@x")).unwrap();
    assert!(account.update_time("email") > first);
}

#[test]
fn import_validates_without_saving() {
    let (_store, accounts) = account_store();
    let imported = accounts
        .import(&map(&[
            ("type", Value::from("Account")),
            ("email", Value::from("i@x")),
            ("age", Value::from(3)),
        ]))
        .unwrap();
    assert!(imported.is_dirty());
    assert!(imported.oid().is_none());
    assert_eq!(imported.get("email").unwrap(), Some(Value::from("i@x")));

    let err = accounts
        .import(&map(&[("type", Value::from("Comment"))]))
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidValue { .. }));
}

#[test]
fn import_prefers_the_stored_object() {
    let (_store, accounts) = account_store();
    let stored = accounts.ensure(&Oid::parse("KEEP").unwrap()).unwrap();
    stored.set("email", &Value::from("keep@x")).unwrap();
    stored.save().unwrap();

    let imported = accounts
        .import(&map(&[
            ("oid", Value::from("KEEP")),
            ("email", Value::from("other@x")),
        ]))
        .unwrap();
    assert!(imported.same_identity(&stored));
    assert_eq!(imported.get("email").unwrap(), Some(Value::from("keep@x")));
}

#[test]
fn removal_is_complete() {
    let (_store, accounts) = account_store();
    let account = accounts.create();
    account.set("email", &Value::from("r@x")).unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();

    account.remove().unwrap();
    assert!(!accounts.has(&oid).unwrap());
    assert!(accounts.get(&oid).unwrap_err().is_not_found());
    assert_eq!(accounts.count().unwrap(), 0);
}

#[test]
fn scoped_block_saves_touched_objects_once() {
    let (store, accounts) = account_store();
    let account = store
        .scoped(|| {
            let a = accounts.create();
            a.set("email", &Value::from("s@x")).unwrap();
            a.set("age", &Value::from(9)).unwrap();
            a
        })
        .unwrap();

    assert!(!account.is_dirty());
    let oid = account.oid().expect("scope exit saved the object");
    assert!(accounts.has(&oid).unwrap());
}

#[test]
fn scoped_blocks_do_not_nest() {
    let (store, _accounts) = account_store();
    let result = store.scoped(|| store.scoped(|| ()));
    assert!(matches!(
        result.unwrap().unwrap_err(),
        StorageError::Unsupported { .. }
    ));
}

#[test]
fn unregistered_class_is_reported() {
    let store = ObjectStore::new(MemoryBackend::new());
    let err = store.class("Ghost").unwrap_err();
    assert!(matches!(err, StorageError::NotRegistered { .. }));
}

#[test]
fn store_export_dumps_records() {
    let (store, accounts) = account_store();
    let account = accounts.ensure(&Oid::parse("D1").unwrap()).unwrap();
    account.set("email", &Value::from("d@x")).unwrap();
    account.save().unwrap();

    let dump = store.export().unwrap();
    let entries = dump.as_map().unwrap();
    assert!(entries.contains_key("Account/D1"));
}

#[test]
fn objects_survive_a_directory_backend_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let descriptor = || {
        ClassDescriptor::builder("DiskAccount")
            .property("email", Type::Email)
            .build()
            .unwrap()
    };

    let oid = {
        let store = ObjectStore::new(DirectoryBackend::open(dir.path().join("db")).unwrap());
        let accounts = store.register(descriptor()).unwrap();
        let account = accounts.create();
        account.set("email", &Value::from("disk@x")).unwrap();
        account.save().unwrap();
        account.oid().unwrap()
    };

    let store = ObjectStore::new(DirectoryBackend::open(dir.path().join("db")).unwrap());
    let accounts = store.register(descriptor()).unwrap();
    let reloaded = accounts.get(&oid).unwrap();
    assert_eq!(reloaded.get("email").unwrap(), Some(Value::from("disk@x")));
}
