use std::collections::BTreeMap;

use pagecraft::infrastructure::{
    BuilderConfig, FileKeyValueStore, KeyValueStore, PersistenceAdapter,
};
use pagecraft::{ComponentType, FieldType, ParentRef, PropValue, open_workspace};
use serde_json::json;

fn config(dir: &std::path::Path) -> BuilderConfig {
    BuilderConfig {
        storage_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

#[test]
fn test_first_open_seeds_once() {
    let dir = tempfile::tempdir().unwrap();

    let first = open_workspace(&config(dir.path())).unwrap().snapshot().clone();
    let second = open_workspace(&config(dir.path())).unwrap().snapshot().clone();

    assert_eq!(first, second);
    assert_eq!(first.apps.len(), 1);
    assert_eq!(first.pages.len(), 1);
    let keys = FileKeyValueStore::open(dir.path()).unwrap().keys().unwrap();
    assert_eq!(
        keys,
        vec!["pagecraft:app:app-1@0", "pagecraft:page:page-1@0", "pagecraft:workspace"]
    );
}

#[test]
fn test_workspace_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let expected = {
        let mut store = open_workspace(&config(dir.path())).unwrap();
        let mut session = store.default_session().unwrap();
        let app = store.create_app(&mut session, "Shop", None).unwrap();

        let table = store.create_table(&app.id, "Orders").unwrap();
        store.add_field(&table.id, "item", FieldType::Text).unwrap();
        store.add_field(&table.id, "ref", FieldType::Uuid).unwrap();
        store
            .add_record(&table.id, BTreeMap::from([("item".to_string(), json!("Lamp"))]))
            .unwrap();

        let page = ParentRef::Page(session.current_page.clone());
        let repeater = store
            .add_component(&session, &page, ComponentType::Repeater, None)
            .unwrap();
        store.select_component(&mut session, &repeater.id).unwrap();
        session.begin_edit().unwrap();
        store
            .set_prop_text(&session, &repeater.id, "source", "{{ Orders }}")
            .unwrap();
        store.save_to_library(&session, &repeater.id).unwrap();

        store.snapshot().clone()
        // Dropping the store drains the background flusher.
    };

    let reopened = open_workspace(&config(dir.path())).unwrap();
    assert_eq!(reopened.snapshot(), &expected);

    let shop = reopened.apps().find(|app| app.name == "Shop").unwrap();
    assert_eq!(shop.components.len(), 1);
    let library = reopened.component(&shop.components[0]).unwrap();
    assert!(matches!(library.props["source"], PropValue::Bound(_)));
}

#[test]
fn test_deleted_entities_leave_no_entries() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = open_workspace(&config(dir.path())).unwrap();
        let session = store.default_session().unwrap();
        let table = store.create_table(&session.current_app, "Scratch").unwrap();
        store.delete_table(&table.id).unwrap();
    }

    let backend = FileKeyValueStore::open(dir.path()).unwrap();
    assert!(backend.keys().unwrap().iter().all(|key| !key.contains(":table:")));
    let workspace = PersistenceAdapter::new(backend, "pagecraft", "Untitled App")
        .hydrate()
        .unwrap();
    assert!(workspace.tables.is_empty());
    assert_eq!(workspace.version, 2);
}
