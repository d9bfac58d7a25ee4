#![allow(dead_code)]

//! Shared fixtures: the persons/movies schema and a recording backend.

use graft::{
    BatchInserter, DeleteOp, GraftResult, GraphExecutor, JoinTable, RelateOp, Relation, Row,
    Schema, TableBatch, TableInfo, UnrelateOp,
};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

pub fn person_movie_schema() -> Schema {
    Schema::new()
        .with_table(
            TableInfo::new("persons")
                .with_id("id")
                .with_relation(Relation::belongs_to_one(
                    "parent",
                    ["parent_id"],
                    "persons",
                    ["id"],
                ))
                .with_relation(Relation::has_many(
                    "children",
                    ["id"],
                    "persons",
                    ["parent_id"],
                ))
                .with_relation(Relation::many_to_many(
                    "movies",
                    ["id"],
                    "movies",
                    ["id"],
                    JoinTable::new("persons_movies", ["person_id"], ["movie_id"]),
                )),
        )
        .with_table(
            TableInfo::new("movies")
                .with_id("id")
                .with_relation(Relation::many_to_many(
                    "actors",
                    ["id"],
                    "persons",
                    ["id"],
                    JoinTable::new("persons_movies", ["movie_id"], ["person_id"]),
                )),
        )
}

/// One recorded backend call.
#[derive(Debug, Clone)]
pub enum Call {
    Insert { table: String, rows: Vec<Row> },
    Update { table: String, id: Vec<Value>, row: Row },
    Patch { table: String, id: Vec<Value>, row: Row },
    Delete(DeleteOp),
    Relate(RelateOp),
    Unrelate(UnrelateOp),
}

/// Records every call and hands out sequential generated ids for the
/// `id` column of non-join tables.
pub struct RecordingBackend {
    pub calls: Mutex<Vec<Call>>,
    next_id: AtomicI64,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Rows of every insert batch submitted for `table`, flattened.
    pub fn inserted_rows(&self, table: &str) -> Vec<Row> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Insert { table: t, rows } if t == table => Some(rows),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Tables of insert batches, in submission order.
    pub fn insert_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Insert { table, .. } => Some(table),
                _ => None,
            })
            .collect()
    }
}

impl BatchInserter for RecordingBackend {
    fn insert(&self, batch: TableBatch) -> impl Future<Output = GraftResult<Vec<Row>>> + Send {
        self.calls.lock().unwrap().push(Call::Insert {
            table: batch.table.clone(),
            rows: batch.rows.clone(),
        });
        let mut rows = batch.rows;
        if batch.table != "persons_movies" {
            for row in &mut rows {
                if !row.contains_key("id") {
                    row.insert(
                        "id".into(),
                        json!(self.next_id.fetch_add(1, Ordering::SeqCst)),
                    );
                }
            }
        }
        async move { Ok(rows) }
    }
}

impl GraphExecutor for RecordingBackend {
    fn update(
        &self,
        table: &str,
        id: &[Value],
        row: Row,
    ) -> impl Future<Output = GraftResult<()>> + Send {
        self.calls.lock().unwrap().push(Call::Update {
            table: table.to_string(),
            id: id.to_vec(),
            row,
        });
        async { Ok(()) }
    }

    fn patch(
        &self,
        table: &str,
        id: &[Value],
        row: Row,
    ) -> impl Future<Output = GraftResult<()>> + Send {
        self.calls.lock().unwrap().push(Call::Patch {
            table: table.to_string(),
            id: id.to_vec(),
            row,
        });
        async { Ok(()) }
    }

    fn delete(&self, op: DeleteOp) -> impl Future<Output = GraftResult<u64>> + Send {
        self.calls.lock().unwrap().push(Call::Delete(op));
        async { Ok(1) }
    }

    fn relate(&self, op: RelateOp) -> impl Future<Output = GraftResult<()>> + Send {
        self.calls.lock().unwrap().push(Call::Relate(op));
        async { Ok(()) }
    }

    fn unrelate(&self, op: UnrelateOp) -> impl Future<Output = GraftResult<()>> + Send {
        self.calls.lock().unwrap().push(Call::Unrelate(op));
        async { Ok(()) }
    }
}
