//! Inspector integration tests: guardrails against live databases and
//! the SQLCipher unlock path.

use debugprobe::inspector::{DatabaseDescriptor, DbError, EncryptionStatus, SqliteInspector};
use debugprobe::key_provider::StaticKeyProvider;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;

fn seeded_db(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, createTimestamp TEXT, note TEXT);
         INSERT INTO t (createTimestamp, note) VALUES
             ('2026-01-01', 'first'), ('2026-01-02', 'second');",
    )
    .unwrap();
    path
}

fn encrypted_db(dir: &tempfile::TempDir, name: &str, passphrase: &str) -> PathBuf {
    let path = dir.path().join(name);
    let conn = Connection::open(&path).unwrap();
    // The key must be applied before anything touches the database
    conn.execute_batch(&format!("PRAGMA key = \"{passphrase}\";")).unwrap();
    conn.execute_batch(
        "CREATE TABLE secrets (id INTEGER PRIMARY KEY, value TEXT);
         INSERT INTO secrets (value) VALUES ('classified');",
    )
    .unwrap();
    path
}

// ── Guardrails (scenario S5) ────────────────────────────────────────

#[tokio::test]
async fn execute_query_guardrails_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded_db(&dir, "app.db");
    let inspector = SqliteInspector::new();
    inspector.register(DatabaseDescriptor::new("db1", "App", &path), None);

    // A trailing write statement is rejected
    let err = inspector
        .execute_query("db1", "SELECT * FROM t; DELETE FROM t")
        .await
        .unwrap_err();
    match err {
        DbError::InvalidQuery(msg) => assert!(msg.contains("DELETE"), "{msg}"),
        other => panic!("expected InvalidQuery, got {other:?}"),
    }

    // createTimestamp contains CREATE but is not a whole-word match
    let result = inspector
        .execute_query("db1", "SELECT createTimestamp FROM t")
        .await
        .unwrap();
    assert_eq!(result.row_count, 2);

    // Unregistered database id
    let err = inspector.execute_query("missing", "SELECT 1").await.unwrap_err();
    assert!(matches!(err, DbError::DatabaseNotFound(_)));

    // Nothing was deleted by the rejected statement
    let count: i64 = Connection::open(&path)
        .unwrap()
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn list_tables_agrees_with_sqlite_master() {
    let dir = tempfile::tempdir().unwrap();
    let path = seeded_db(&dir, "app.db");
    let inspector = SqliteInspector::new();
    inspector.register(DatabaseDescriptor::new("db1", "App", &path), None);

    let mut expected: Vec<String> = {
        let conn = Connection::open(&path).unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap();
        names
    };
    expected.sort();

    let tables = inspector.list_tables("db1").await.unwrap();
    assert_eq!(tables, expected);
}

#[tokio::test]
async fn target_rowid_page_contains_the_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rows.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (n INTEGER)").unwrap();
        let mut stmt = conn.prepare("INSERT INTO t (n) VALUES (?1)").unwrap();
        for i in 1..=100 {
            stmt.execute(rusqlite::params![i]).unwrap();
        }
    }
    let inspector = SqliteInspector::new();
    inspector.register(DatabaseDescriptor::new("db1", "Rows", &path), None);

    // Whatever page was asked for, the returned page holds the target row
    for target in [1_i64, 37, 50, 99, 100] {
        let page = inspector
            .fetch_table_page("db1", "t", 1, 10, None, true, Some(target))
            .await
            .unwrap();
        assert!(
            page.rows.iter().any(|row| row["_rowid"] == target),
            "page {} does not contain rowid {target}",
            page.page
        );
    }
}

// ── Encryption (scenario S6) ────────────────────────────────────────

#[tokio::test]
async fn encrypted_database_unlocks_with_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let path = encrypted_db(&dir, "enc.db", "s3cret");
    let inspector = SqliteInspector::new();
    inspector.register(
        DatabaseDescriptor::new("enc1", "Encrypted", &path)
            .encrypted(vec!["PRAGMA cipher_compatibility = 4;".to_string()]),
        Some(Arc::new(StaticKeyProvider::new("s3cret"))),
    );

    let tables = inspector.list_tables("enc1").await.unwrap();
    assert_eq!(tables, vec!["secrets"]);

    let result = inspector
        .execute_query("enc1", "SELECT value FROM secrets")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], "classified");

    let summaries = inspector.list_databases().await;
    assert_eq!(summaries[0].encryption_status, EncryptionStatus::Unlocked);
    assert_eq!(summaries[0].table_count, 1);
}

#[tokio::test]
async fn wrong_passphrase_is_access_denied() {
    let dir = tempfile::tempdir().unwrap();
    let path = encrypted_db(&dir, "enc.db", "s3cret");
    let inspector = SqliteInspector::new();
    inspector.register(
        DatabaseDescriptor::new("enc1", "Encrypted", &path).encrypted(vec![]),
        Some(Arc::new(StaticKeyProvider::new("wrong-pass"))),
    );

    let err = inspector.list_tables("enc1").await.unwrap_err();
    match err {
        DbError::AccessDenied(msg) => assert!(msg.contains("Invalid encryption key"), "{msg}"),
        other => panic!("expected AccessDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn encrypted_without_provider_lists_as_locked() {
    let dir = tempfile::tempdir().unwrap();
    let path = encrypted_db(&dir, "enc.db", "s3cret");
    let inspector = SqliteInspector::new();
    inspector.register(
        DatabaseDescriptor::new("enc1", "Encrypted", &path).encrypted(vec![]),
        None,
    );

    let summaries = inspector.list_databases().await;
    assert_eq!(summaries[0].encryption_status, EncryptionStatus::Locked);
    assert_eq!(summaries[0].table_count, 0);
    // File size never requires opening the database
    assert!(summaries[0].file_size_bytes > 0);
}

#[tokio::test]
async fn empty_provider_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = encrypted_db(&dir, "enc.db", "s3cret");
    let inspector = SqliteInspector::new();
    inspector.register(
        DatabaseDescriptor::new("enc1", "Encrypted", &path).encrypted(vec![]),
        Some(Arc::new(StaticKeyProvider::new(""))),
    );

    let err = inspector.list_tables("enc1").await.unwrap_err();
    assert!(matches!(err, DbError::AccessDenied(_)));
}
