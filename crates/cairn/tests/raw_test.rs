use cairn::{
    Backend, DirectoryBackend, MemoryBackend, Oid, RawClassDescriptor, RawStore, StorageError,
    Type, Value,
};
use std::sync::Arc;

fn image_store() -> (RawStore, cairn::RawClass, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let store = RawStore::with_backend(backend.clone());
    let images = store
        .register(
            RawClassDescriptor::builder("Image")
                .attribute("title", Type::String)
                .attribute("width", Type::Positive)
                .build()
                .unwrap(),
        )
        .unwrap();
    (store, images, backend)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn chunked_reads_cover_the_whole_blob() {
    let (_store, images, _backend) = image_store();
    let bytes = payload(10 * 1024 * 1024);

    let image = images.create();
    image.set_data(bytes.clone());
    image.set_meta("title", &Value::from("big")).unwrap();
    image.save().unwrap();

    let total: usize = image
        .data(64 * 1024)
        .unwrap()
        .map(|chunk| chunk.unwrap().len())
        .sum();
    assert_eq!(total, 10 * 1024 * 1024);
    assert_eq!(image.load_data().unwrap(), bytes);
}

#[test]
fn empty_blob_yields_zero_chunks() {
    let (_store, images, _backend) = image_store();
    let image = images.create();
    image.set_meta("title", &Value::from("no data")).unwrap();
    image.save().unwrap();

    assert_eq!(image.data(64 * 1024).unwrap().count(), 0);

    image.set_data(Vec::new());
    image.save().unwrap();
    assert_eq!(image.data(64 * 1024).unwrap().count(), 0);
    assert_eq!(image.load_data().unwrap(), Vec::<u8>::new());
}

#[test]
fn data_and_meta_records_move_together() {
    let (_store, images, backend) = image_store();
    let image = images.create();
    image.set_data(b"blob".to_vec());
    image.set_meta("title", &Value::from("pair")).unwrap();
    image.save().unwrap();
    let oid = image.oid().unwrap();

    let data_key = format!("Image/{oid}.data");
    let meta_key = format!("Image/{oid}.meta");
    assert!(backend.has(&data_key).unwrap());
    assert!(backend.has(&meta_key).unwrap());

    image.remove().unwrap();
    assert!(!backend.has(&data_key).unwrap());
    assert!(!backend.has(&meta_key).unwrap());
    assert!(!images.has(&oid).unwrap());
}

#[test]
fn untouched_data_is_not_restaged() {
    let (_store, images, _backend) = image_store();
    let image = images.create();
    image.set_data(b"original".to_vec());
    image.save().unwrap();
    let oid = image.oid().unwrap();
    drop(image);

    let reloaded = images.get(&oid).unwrap();
    assert!(!reloaded.has_data_changed());
    reloaded.set_meta("title", &Value::from("tweaked")).unwrap();
    reloaded.save().unwrap();
    assert!(!reloaded.has_data_changed());
    assert_eq!(reloaded.load_data().unwrap(), b"original");

    reloaded.set_data(b"rewritten".to_vec());
    assert!(reloaded.has_data_changed());
    assert_eq!(reloaded.length(), Some("rewritten".len()));
    reloaded.save().unwrap();
    assert_eq!(reloaded.load_data().unwrap(), b"rewritten");
}

#[test]
fn meta_reads_and_writes() {
    let (_store, images, _backend) = image_store();
    let image = images.create();

    image.set_meta("title", &Value::from("hello")).unwrap();
    image
        .merge_meta(&Value::Map(
            [
                ("width".to_owned(), Value::from(640)),
                ("note".to_owned(), Value::from("free-form")),
            ]
            .into(),
        ))
        .unwrap();

    assert_eq!(image.meta("title"), Some(Value::from("hello")));
    assert_eq!(image.meta("width"), Some(Value::from(640)));
    assert_eq!(image.meta("note"), Some(Value::from("free-form")));
    assert_eq!(image.meta_all().len(), 3);

    // Declared attributes are validated.
    let err = image.set_meta("width", &Value::from(-4)).unwrap_err();
    assert!(matches!(err, StorageError::InvalidValue { .. }));

    // Reserved names never land in metadata.
    for reserved in ["type", "oid", "updates", "data"] {
        let err = image.set_meta(reserved, &Value::from("x")).unwrap_err();
        assert!(matches!(err, StorageError::ReservedProperty { .. }));
    }
}

#[test]
fn metadata_survives_reload() {
    let (_store, images, _backend) = image_store();
    let image = images.create();
    image.set_meta("title", &Value::from("persisted")).unwrap();
    image.set_meta("width", &Value::from(800)).unwrap();
    image.save().unwrap();
    let oid = image.oid().unwrap();
    drop(image);

    let reloaded = images.get(&oid).unwrap();
    assert_eq!(reloaded.meta("title"), Some(Value::from("persisted")));
    assert_eq!(reloaded.meta("width"), Some(Value::from(800)));
    assert!(reloaded.update_time("meta") > cairn::Timestamp::EPOCH);
}

#[test]
fn identity_is_shared_while_referenced() {
    let (_store, images, _backend) = image_store();
    let image = images.create();
    image.save().unwrap();
    let oid = image.oid().unwrap();

    let a = images.get(&oid).unwrap();
    let b = images.get(&oid).unwrap();
    assert!(a.same_identity(&b));
    assert!(a.same_identity(&image));
}

#[test]
fn ensure_and_counting() {
    let (_store, images, _backend) = image_store();
    for name in ["I1", "I2"] {
        let image = images.ensure(&Oid::parse(name).unwrap()).unwrap();
        image.set_data(name.as_bytes().to_vec());
        image.save().unwrap();
    }
    assert_eq!(images.count().unwrap(), 2);

    let listed = images.list(Some(1), 1, None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].oid(), Some(Oid::parse("I2").unwrap()));

    let all: Vec<_> = images.all().unwrap().map(Result::unwrap).collect();
    assert_eq!(all.len(), 2);

    let ensured = images.ensure(&Oid::parse("I1").unwrap()).unwrap();
    assert!(ensured.same_identity(&all[0]) || ensured.load_data().unwrap() == b"I1");
}

#[test]
fn path_requires_the_filesystem_capability() {
    let (_store, images, _backend) = image_store();
    let image = images.create();
    image.set_data(b"x".to_vec());
    image.save().unwrap();

    let err = image.path().unwrap_err();
    assert!(matches!(err, StorageError::Unsupported { .. }));
}

#[test]
fn path_resolves_on_a_directory_backend() {
    let dir = tempfile::tempdir().unwrap();
    let store = RawStore::new(DirectoryBackend::open(dir.path().join("raw")).unwrap());
    let blobs = store
        .register(RawClassDescriptor::builder("DiskBlob").build().unwrap())
        .unwrap();

    let blob = blobs.create();
    blob.set_data(b"on disk".to_vec());
    blob.save().unwrap();

    let path = blob.path().unwrap();
    assert!(path.is_file());
    assert_eq!(std::fs::read(&path).unwrap(), b"on disk");
}

#[test]
fn export_and_import_round_trip() {
    let (_store, images, _backend) = image_store();
    let image = images.create();
    image.set_meta("title", &Value::from("round")).unwrap();
    image.set_data(b"tiny".to_vec());
    image.save().unwrap();

    let stub = image.export(0);
    assert_eq!(stub.as_map().unwrap().len(), 2);

    let full = image.export(1);
    assert_eq!(
        full.as_map().unwrap().get("title").unwrap().as_str(),
        Some("round")
    );

    let with_data = image.export_with_data().unwrap();
    let encoded = with_data.as_map().unwrap().get("data").unwrap().clone();
    assert_eq!(encoded.as_str(), Some("dGlueQ=="));

    // Import into a fresh class hosted by a fresh store.
    let other = RawStore::new(MemoryBackend::new());
    let copies = other
        .register(RawClassDescriptor::builder("ImageCopy").build().unwrap())
        .unwrap();
    let copy = copies
        .import(&Value::Map(
            [
                ("title".to_owned(), Value::from("round")),
                ("data".to_owned(), encoded),
            ]
            .into(),
        ))
        .unwrap();
    assert_eq!(copy.meta("title"), Some(Value::from("round")));
    assert_eq!(copy.load_data().unwrap(), b"tiny");
}
