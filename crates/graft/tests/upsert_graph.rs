//! End-to-end graph upserts against a recording backend.

mod support;

use graft::{GraftError, GraphOptions, GraphUpserter, RelationKind};
use serde_json::{Value, json};
use support::{Call, RecordingBackend, person_movie_schema};

async fn upsert(
    options: GraphOptions,
    new_root: Value,
    persisted_root: Value,
) -> (RecordingBackend, Vec<Value>) {
    let backend = RecordingBackend::new();
    let upserter = GraphUpserter::new(&person_movie_schema(), options);
    let models = upserter
        .run("persons", vec![new_root], vec![persisted_root], &backend)
        .await
        .expect("upsert should run");
    (backend, models)
}

#[tokio::test]
async fn matched_child_is_patched_and_new_child_inserted() {
    let (backend, models) = upsert(
        GraphOptions::default(),
        json!({"id": 1, "children": [
            {"id": 2, "name": "renamed"},
            {"name": "brand new"},
        ]}),
        json!({"id": 1, "children": [{"id": 2, "name": "old"}]}),
    )
    .await;

    let calls = backend.calls();
    // New child is inserted with the owner's key already present.
    let inserted = backend.inserted_rows("persons");
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0]["name"], json!("brand new"));
    assert_eq!(inserted[0]["parent_id"], json!(1));

    let patches: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Patch { table, id, row } => Some((table.clone(), id.clone(), row.clone())),
            _ => None,
        })
        .collect();
    // The root carries nothing but its id, so only the child is written.
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].1, vec![json!(2)]);
    assert_eq!(patches[0].2["name"], json!("renamed"));
    assert!(!patches[0].2.contains_key("id"));

    assert_eq!(models[0]["children"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn update_option_writes_full_rows() {
    let (backend, _) = upsert(
        GraphOptions::new().update(true),
        json!({"id": 1, "name": "renamed"}),
        json!({"id": 1, "name": "old"}),
    )
    .await;

    let calls = backend.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        Call::Update { table, id, .. } if table == "persons" && id == &vec![json!(1)]
    )));
}

#[tokio::test]
async fn missing_child_is_deleted_by_default() {
    let (backend, _) = upsert(
        GraphOptions::default(),
        json!({"id": 1, "children": []}),
        json!({"id": 1, "children": [{"id": 2}]}),
    )
    .await;

    let calls = backend.calls();
    let deletes: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Delete(op) => Some(op.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].table, "persons");
    assert_eq!(deletes[0].id, vec![json!(2)]);
}

#[tokio::test]
async fn unrelate_option_nulls_the_fk_instead() {
    let (backend, _) = upsert(
        GraphOptions::new().unrelate(true),
        json!({"id": 2, "parent": null}),
        json!({"id": 2, "parent_id": 7, "parent": {"id": 7}}),
    )
    .await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    let Call::Unrelate(op) = &calls[0] else {
        panic!("expected a single unrelate, got {calls:?}");
    };
    assert_eq!(op.kind, RelationKind::BelongsToOne);
    assert_eq!(op.table, "persons");
    assert_eq!(op.columns, vec!["parent_id"]);
    assert_eq!(op.id, vec![json!(2)]);
}

#[tokio::test]
async fn relate_option_attaches_existing_to_many_children() {
    let (backend, _) = upsert(
        GraphOptions::new().relate(true),
        json!({"id": 1, "children": [{"id": 99}]}),
        json!({"id": 1, "children": []}),
    )
    .await;

    let calls = backend.calls();
    let relates: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            Call::Relate(op) => Some(op.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(relates.len(), 1);
    assert_eq!(relates[0].kind, RelationKind::HasMany);
    assert_eq!(relates[0].table, "persons");
    assert_eq!(relates[0].columns, vec!["parent_id"]);
    assert_eq!(relates[0].values, vec![json!(1)]);
    assert_eq!(relates[0].id, vec![json!(99)]);
}

#[tokio::test]
async fn relate_option_joins_existing_many_to_many_children() {
    let (backend, _) = upsert(
        GraphOptions::new().relate(true),
        json!({"id": 1, "movies": [{"id": 5}]}),
        json!({"id": 1, "movies": []}),
    )
    .await;

    // Many-to-many relates go through the join-row phase, not RelateOp.
    let join_rows = backend.inserted_rows("persons_movies");
    assert_eq!(join_rows.len(), 1);
    assert_eq!(join_rows[0]["person_id"], json!(1));
    assert_eq!(join_rows[0]["movie_id"], json!(5));
    assert!(
        !backend
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Relate(_)))
    );
}

#[tokio::test]
async fn matched_many_to_many_children_keep_their_join_rows() {
    let (backend, _) = upsert(
        GraphOptions::default(),
        json!({"id": 1, "movies": [{"id": 5, "name": "renamed"}]}),
        json!({"id": 1, "movies": [{"id": 5, "name": "old"}]}),
    )
    .await;

    // The join row already exists; only the movie is patched.
    assert!(backend.inserted_rows("persons_movies").is_empty());
    assert!(backend.calls().iter().any(|call| matches!(
        call,
        Call::Patch { table, .. } if table == "movies"
    )));
}

#[tokio::test]
async fn unrelate_removes_the_join_row_for_many_to_many() {
    let (backend, _) = upsert(
        GraphOptions::new().unrelate(true),
        json!({"id": 1, "movies": []}),
        json!({"id": 1, "movies": [{"id": 5}]}),
    )
    .await;

    let calls = backend.calls();
    let Some(Call::Unrelate(op)) = calls
        .iter()
        .find(|call| matches!(call, Call::Unrelate(_)))
    else {
        panic!("expected an unrelate");
    };
    assert_eq!(op.join_table.as_deref(), Some("persons_movies"));
    let join_row = op.join_row.as_ref().unwrap();
    assert_eq!(join_row["person_id"], json!(1));
    assert_eq!(join_row["movie_id"], json!(5));
}

#[tokio::test]
async fn insert_missing_keeps_the_caller_provided_id() {
    let (backend, _) = upsert(
        GraphOptions::new().insert_missing(true),
        json!({"id": 1, "children": [{"id": 99, "name": "restored"}]}),
        json!({"id": 1, "children": []}),
    )
    .await;

    let inserted = backend.inserted_rows("persons");
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0]["id"], json!(99));
    assert_eq!(inserted[0]["parent_id"], json!(1));
}

#[tokio::test]
async fn unknown_child_id_fails_without_relate_or_insert_missing() {
    let backend = RecordingBackend::new();
    let upserter = GraphUpserter::new(&person_movie_schema(), GraphOptions::default());
    let err = upserter
        .run(
            "persons",
            vec![json!({"id": 1, "children": [{"id": 99}]})],
            vec![json!({"id": 1, "children": []})],
            &backend,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GraftError::Validation(_)));
    // Classification fails before anything is written.
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn untouched_relations_are_left_alone() {
    let (backend, _) = upsert(
        GraphOptions::default(),
        json!({"id": 1, "name": "renamed"}),
        json!({"id": 1, "name": "old", "children": [{"id": 2}]}),
    )
    .await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], Call::Patch { table, .. } if table == "persons"));
}

#[tokio::test]
async fn no_update_suppresses_the_parent_write() {
    let (backend, _) = upsert(
        GraphOptions::new().no_update(true),
        json!({"id": 1, "name": "renamed"}),
        json!({"id": 1, "name": "old"}),
    )
    .await;
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn inserted_subtree_under_a_matched_root_resolves_keys() {
    let (backend, models) = upsert(
        GraphOptions::default(),
        json!({"id": 1, "children": [
            {"name": "child", "children": [{"name": "grandchild"}]},
        ]}),
        json!({"id": 1, "children": []}),
    )
    .await;

    let inserted = backend.inserted_rows("persons");
    assert_eq!(inserted.len(), 2);
    assert_eq!(inserted[0]["parent_id"], json!(1));
    // The grandchild waits for the child's generated id.
    assert_eq!(inserted[1]["parent_id"], inserted[0].get("id").cloned().unwrap_or(json!(1)));

    let child = &models[0]["children"][0];
    assert!(child.as_object().unwrap().contains_key("id"));
    assert_eq!(child["children"][0]["parent_id"], child["id"]);
}
