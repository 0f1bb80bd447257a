//! Fixtures shared by unit tests.

use std::sync::Arc;

use serde_json::json;

use crate::backend::MemoryBackend;
use crate::db::{Database, DbConfig, DbDict, TransactionOptions};
use crate::transaction::TransactionHandle;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn dict() -> DbDict {
    DbDict::new()
        .with_table("tb_user", ["uid", "name"])
        .with_table("tb_user_ext", ["uid", "age", "address"])
}

/// Backend seeded with two users.
pub fn backend() -> MemoryBackend {
    let backend = MemoryBackend::from_dict(&dict());
    backend
        .insert_rows(
            "tb_user",
            [json!({"uid": 1, "name": "alice"}), json!({"uid": 2, "name": "bob"})],
        )
        .unwrap();
    backend
        .insert_rows(
            "tb_user_ext",
            [
                json!({"uid": 1, "age": 30, "address": "a"}),
                json!({"uid": 2, "age": 25, "address": "b"}),
            ],
        )
        .unwrap();
    backend
}

pub fn database() -> Database {
    setup().0
}

pub fn database_with(backend: Arc<MemoryBackend>) -> Database {
    init_logger();
    Database::new("test", backend, dict(), DbConfig::default())
}

pub fn setup() -> (Database, Arc<MemoryBackend>) {
    let backend = Arc::new(backend());
    (database_with(backend.clone()), backend)
}

pub async fn begin(db: &Database) -> TransactionHandle {
    db.transaction(TransactionOptions::default()).await.unwrap()
}
