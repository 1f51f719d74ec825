//! Replication integration tests
//!
//! Two or more replicas of a document exchange CBOR-encoded updates
//! directly; no transport is involved. Covers convergence, ownership repair
//! after concurrent moves, remote change notification and cross-document
//! references resolved through a `DocumentStore`.
//!
//! Run with:
//!   cargo test --test replication

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use entwine::{
    CollectionShape, Document, DocumentStore, Entity, Fields, GraphConfig, GraphError, OwnerSlot, ScalarKind,
    SchemaRegistry, TypeSchema, Update, Value,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn registry() -> Arc<SchemaRegistry> {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = SchemaRegistry::new();
    registry
        .define_type(TypeSchema::new("User").scalar("name", ScalarKind::String))
        .unwrap();
    registry
        .define_type(
            TypeSchema::new("Team")
                .scalar("name", ScalarKind::String)
                .owned_list("members", "User"),
        )
        .unwrap();
    registry
        .define_type(TypeSchema::new("Book").scalar("title", ScalarKind::String))
        .unwrap();
    registry
        .define_type(
            TypeSchema::new("Shelf")
                .reference("featured", "Book")
                .collection("books", CollectionShape::List, "Book", false)
                .collection("by_title", CollectionShape::Map, "Book", false),
        )
        .unwrap();
    registry
}

fn named(registry: &Arc<SchemaRegistry>, type_name: &str, name: &str) -> Entity {
    registry
        .create(type_name, Fields::new().scalar("name", name))
        .unwrap()
}

/// Send each side the operations the other has not seen
fn exchange(a: &Document, b: &Document) {
    let to_b = a.encode_update_since(&b.horizon()).unwrap();
    let to_a = b.encode_update_since(&a.horizon()).unwrap();
    b.apply_update(&to_b).unwrap();
    a.apply_update(&to_a).unwrap();
}

fn members(doc: &Document, root: &str) -> Vec<Entity> {
    doc.root(root)
        .unwrap()
        .unwrap()
        .list("members")
        .unwrap()
        .to_vec()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[test]
fn test_replica_sees_initial_state() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default().with_replica_id("alpha")).unwrap();
    let team = named(&registry, "Team", "core");
    alpha.set_root("main", &team).unwrap();
    let alice = named(&registry, "User", "Alice");
    team.list("members").unwrap().push(&alice).unwrap();

    let beta = alpha.replicate("beta").unwrap();
    assert_eq!(beta.id(), alpha.id());
    assert_eq!(beta.replica_id(), "beta");
    assert_eq!(beta.schema_version(), Some(1));

    let remote_alice = beta.get_entity(alice.id()).unwrap();
    assert_eq!(remote_alice.get_scalar("name").unwrap(), Value::string("Alice"));
    // The ownership index is rebuilt from the merged containers
    assert_eq!(remote_alice.owner(), Some(OwnerSlot::indexed(team.id(), "members", 0)));
}

#[test]
fn test_concurrent_edits_converge() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default().with_replica_id("alpha")).unwrap();
    let team = named(&registry, "Team", "core");
    alpha.set_root("main", &team).unwrap();
    let beta = alpha.replicate("beta").unwrap();

    let mut from_alpha = alpha.subscribe_updates();
    let mut from_beta = beta.subscribe_updates();

    team.set("name", "renamed").unwrap();
    team.list("members")
        .unwrap()
        .push(&named(&registry, "User", "Alice"))
        .unwrap();
    beta.root("main")
        .unwrap()
        .unwrap()
        .list("members")
        .unwrap()
        .push(&named(&registry, "User", "Bob"))
        .unwrap();

    while let Ok(update) = from_alpha.try_recv() {
        beta.apply_update(&update.to_cbor().unwrap()).unwrap();
    }
    while let Ok(update) = from_beta.try_recv() {
        alpha.integrate(update).unwrap();
    }

    let names = |doc: &Document| -> Vec<Value> {
        members(doc, "main")
            .iter()
            .map(|u| u.get_scalar("name").unwrap())
            .collect()
    };
    assert_eq!(names(&alpha), names(&beta));
    assert_eq!(names(&alpha).len(), 2);
    assert_eq!(
        beta.root("main").unwrap().unwrap().get_scalar("name").unwrap(),
        Value::string("renamed")
    );
}

#[test]
fn test_concurrent_moves_settle_on_one_owner() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default().with_replica_id("alpha")).unwrap();
    let teams: Vec<Entity> = ["t1", "t2", "t3"]
        .iter()
        .map(|name| {
            let team = named(&registry, "Team", name);
            alpha.set_root(name, &team).unwrap();
            team
        })
        .collect();
    let user = named(&registry, "User", "Alice");
    teams[0].list("members").unwrap().push(&user).unwrap();
    let beta = alpha.replicate("beta").unwrap();

    // Both replicas move the same user, to different teams
    teams[1].list("members").unwrap().push(&user).unwrap();
    let remote_user = beta.get_entity(user.id()).unwrap();
    beta.root("t3")
        .unwrap()
        .unwrap()
        .list("members")
        .unwrap()
        .push(&remote_user)
        .unwrap();

    exchange(&alpha, &beta);
    // Repairs made on each side replicate too
    exchange(&alpha, &beta);

    for doc in [&alpha, &beta] {
        assert!(members(doc, "t1").is_empty());
        let held = members(doc, "t2").len() + members(doc, "t3").len();
        assert_eq!(held, 1, "user held {} times on {}", held, doc.replica_id());
    }
    assert_eq!(alpha.owner_slot(user.id()), beta.owner_slot(user.id()));
    assert_eq!(members(&alpha, "t2").len(), members(&beta, "t2").len());
    assert!(alpha.reconcile().unwrap().is_clean());
    assert!(beta.reconcile().unwrap().is_clean());
}

#[test]
fn test_back_pointers_rebuilt_with_repair_disabled() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default().with_replica_id("alpha")).unwrap();
    let (red, blue) = (named(&registry, "Team", "red"), named(&registry, "Team", "blue"));
    alpha.set_root("red", &red).unwrap();
    alpha.set_root("blue", &blue).unwrap();
    let alice = named(&registry, "User", "Alice");
    red.list("members").unwrap().push(&alice).unwrap();

    let mut config = GraphConfig::default().with_replica_id("beta");
    config.repair_after_merge = false;
    let beta = Document::from_state(registry.clone(), config, &alpha.encode_state().unwrap()).unwrap();

    let remote_alice = beta.get_entity(alice.id()).unwrap();
    assert_eq!(remote_alice.owner(), Some(OwnerSlot::indexed(red.id(), "members", 0)));

    // A move on the replica vacates the slot it learned about from the merge
    beta.root("blue")
        .unwrap()
        .unwrap()
        .list("members")
        .unwrap()
        .push(&remote_alice)
        .unwrap();
    assert!(members(&beta, "red").is_empty());
    assert_eq!(members(&beta, "blue"), vec![remote_alice.clone()]);
    assert_eq!(remote_alice.owner(), Some(OwnerSlot::indexed(blue.id(), "members", 0)));

    // Later merges keep the index current too
    let bob = named(&registry, "User", "Bob");
    red.list("members").unwrap().push(&bob).unwrap();
    beta.apply_update(&alpha.encode_update_since(&beta.horizon()).unwrap())
        .unwrap();
    let remote_bob = beta.get_entity(bob.id()).unwrap();
    assert_eq!(remote_bob.owner(), Some(OwnerSlot::indexed(red.id(), "members", 0)));
}

#[test]
fn test_out_of_order_updates_wait_for_predecessors() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default().with_replica_id("alpha")).unwrap();
    let user = named(&registry, "User", "Alice");
    alpha.set_root("user", &user).unwrap();
    let beta = alpha.replicate("beta").unwrap();

    let mut updates = alpha.subscribe_updates();
    user.set("name", "one").unwrap();
    user.set("name", "two").unwrap();
    let first = updates.try_recv().unwrap();
    let second = updates.try_recv().unwrap();

    beta.integrate(second).unwrap();
    let remote = beta.get_entity(user.id()).unwrap();
    assert_eq!(remote.get_scalar("name").unwrap(), Value::string("Alice"));

    beta.integrate(first).unwrap();
    assert_eq!(remote.get_scalar("name").unwrap(), Value::string("two"));
    assert_eq!(beta.horizon(), alpha.horizon());
}

#[test]
fn test_remote_changes_notify_subscribers() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default()).unwrap();
    let user = named(&registry, "User", "Alice");
    alpha.set_root("user", &user).unwrap();
    let beta = alpha.replicate("beta").unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    beta.get_entity(user.id())
        .unwrap()
        .subscribe("name", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let since = beta.horizon();
    user.set("name", "Alicia").unwrap();
    user.set("name", "Ally").unwrap();
    beta.apply_update(&alpha.encode_update_since(&since).unwrap()).unwrap();

    // Both writes arrive in one batch, so one notification
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_encode_update_since_skips_seen_ops() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default()).unwrap();
    alpha
        .set_root("user", &named(&registry, "User", "Alice"))
        .unwrap();

    let caught_up = Update::from_cbor(&alpha.encode_update_since(&alpha.horizon()).unwrap()).unwrap();
    assert!(caught_up.is_empty());
    assert_eq!(caught_up.document_id, alpha.id());

    let full = Update::from_cbor(&alpha.encode_state().unwrap()).unwrap();
    assert!(!full.is_empty());
}

#[test]
fn test_foreign_update_rejected() {
    let registry = registry();
    let alpha = Document::new(registry.clone(), GraphConfig::default()).unwrap();
    assert!(matches!(
        alpha.integrate(Update::new(Uuid::new_v4(), Vec::new())),
        Err(GraphError::DocumentMismatch(_))
    ));
    assert!(matches!(alpha.apply_update(b"not cbor"), Err(GraphError::Codec(_))));
}

// ---------------------------------------------------------------------------
// Cross-document references
// ---------------------------------------------------------------------------

#[test]
fn test_cross_document_reference_records_dependency() {
    let registry = registry();
    let store = DocumentStore::new(registry.clone(), GraphConfig::default());
    let library = store.create_document().unwrap();
    let app = store.create_document().unwrap();

    let book = registry
        .create("Book", Fields::new().scalar("title", "Dune"))
        .unwrap();
    library.set_root("book", &book).unwrap();
    let shelf = registry.create("Shelf", Fields::new()).unwrap();
    app.set_root("shelf", &shelf).unwrap();

    shelf.set_ref("featured", Some(&book)).unwrap();
    let reference = shelf.reference("featured").unwrap().unwrap();
    assert!(!reference.is_local());
    assert_eq!(app.dependencies().len(), 1);
    assert_eq!(app.dependencies()[0].1, library.id());
    assert_eq!(shelf.get_ref("featured").unwrap(), Some(book.clone()));

    // Referencing again reuses the dependency entry
    shelf.set_ref("featured", Some(&book)).unwrap();
    assert_eq!(app.dependencies().len(), 1);

    // Owned edges never cross documents
    assert!(book.document().same(&library));
    assert!(matches!(
        app.set_root("stolen", &book),
        Err(GraphError::DocumentMismatch(_))
    ));
}

#[tokio::test]
async fn test_resolve_waits_for_dependency_document() {
    let registry = registry();
    let store = DocumentStore::new(registry.clone(), GraphConfig::default());
    let library = store.create_document().unwrap();
    let app = store.create_document().unwrap();
    let book = registry
        .create("Book", Fields::new().scalar("title", "Dune"))
        .unwrap();
    library.set_root("book", &book).unwrap();
    let shelf = registry.create("Shelf", Fields::new()).unwrap();
    app.set_root("shelf", &shelf).unwrap();
    shelf.set_ref("featured", Some(&book)).unwrap();

    let (library_state, app_state) = (library.encode_state().unwrap(), app.encode_state().unwrap());

    // A second process loads the app before the library
    let other = DocumentStore::new(registry.clone(), GraphConfig::default());
    let app2 = other.load_document(&app_state).unwrap();
    let shelf2 = app2.root("shelf").unwrap().unwrap();
    assert!(matches!(
        shelf2.get_ref("featured"),
        Err(GraphError::DependencyUnavailable(id)) if id == library.id()
    ));

    let load_later = async {
        tokio::task::yield_now().await;
        other.load_document(&library_state)
    };
    let (resolved, loaded) = tokio::time::timeout(
        Duration::from_secs(1),
        async { tokio::join!(shelf2.resolve_ref("featured"), load_later) },
    )
    .await
    .expect("dependency was never resolved");

    let book2 = resolved.unwrap().unwrap();
    assert_eq!(book2.get_scalar("title").unwrap(), Value::string("Dune"));
    assert_eq!(book2.document().id(), library.id());
    assert_eq!(loaded.unwrap().id(), library.id());
    assert!(other.get(&library.id()).is_some());

    // Now loaded, the synchronous path works too
    assert_eq!(shelf2.get_ref("featured").unwrap(), Some(book2));
}

#[test]
fn test_reference_round_trips_across_documents() {
    let registry = registry();
    let store = DocumentStore::new(registry.clone(), GraphConfig::default());
    let (library, app) = (store.create_document().unwrap(), store.create_document().unwrap());
    let book = registry
        .create("Book", Fields::new().scalar("title", "Dune"))
        .unwrap();
    library.set_root("book", &book).unwrap();

    let reference = app.reference_of(&book).unwrap();
    assert!(!reference.is_local());
    assert_eq!(app.try_resolve(&reference).unwrap(), book);
    assert_eq!(app.reference_of(&book).unwrap(), reference);

    let local = library.reference_of(&book).unwrap();
    assert!(local.is_local());
    assert_eq!(library.try_resolve(&local).unwrap(), book);
}

#[test]
fn test_remove_reference_into_unloaded_document() {
    let registry = registry();
    let store = DocumentStore::new(registry.clone(), GraphConfig::default());
    let (library, app) = (store.create_document().unwrap(), store.create_document().unwrap());
    let book = registry
        .create("Book", Fields::new().scalar("title", "Dune"))
        .unwrap();
    library.set_root("book", &book).unwrap();
    let shelf = registry.create("Shelf", Fields::new()).unwrap();
    app.set_root("shelf", &shelf).unwrap();
    shelf.list("books").unwrap().push(&book).unwrap();
    shelf.map("by_title").unwrap().insert("dune", &book).unwrap();

    let app_state = app.encode_state().unwrap();

    // With the library loaded, removal hands back the entity
    let by_title = shelf.map("by_title").unwrap();
    assert_eq!(by_title.remove("dune").unwrap(), Some(book.clone()));
    assert_eq!(shelf.list("books").unwrap().remove(0).unwrap(), Some(book.clone()));

    // Without it, the stale entries still go
    let other = DocumentStore::new(registry.clone(), GraphConfig::default());
    let app2 = other.load_document(&app_state).unwrap();
    let shelf2 = app2.root("shelf").unwrap().unwrap();
    let books = shelf2.list("books").unwrap();
    assert!(matches!(
        books.get(0),
        Err(GraphError::DependencyUnavailable(id)) if id == library.id()
    ));
    assert_eq!(books.remove(0).unwrap(), None);
    assert!(books.is_empty());

    let by_title = shelf2.map("by_title").unwrap();
    assert!(by_title.contains_key("dune"));
    assert_eq!(by_title.remove("dune").unwrap(), None);
    assert!(by_title.is_empty());
}
