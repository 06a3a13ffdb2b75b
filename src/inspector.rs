//! Read-only SQLite inspector
//!
//! Introspects and queries host-owned databases registered by the host.
//! Safety properties, in order of importance:
//!
//! - every open is read-only + no-mutex, one connection per call, closed
//!   on return; nothing is cached, so host reads/writes stay coherent
//! - identifiers that must be interpolated (table/column names, order
//!   clauses) are validated against `^[A-Za-z_][A-Za-z0-9_]*$` (max 128)
//!   and double-quoted; every user-supplied *value* goes through bound
//!   parameters
//! - free-form SQL must start with SELECT and must not contain any
//!   write/DDL keyword as a whole word; a watchdog interrupts the
//!   connection after 10 seconds
//! - descriptors flagged sensitive reject every inspection operation
//!
//! Encrypted databases (SQLCipher) are unlocked via a registered
//! [`KeyProvider`]; the key is validated, applied with `PRAGMA key`,
//! followed by the descriptor's preparation statements and a probe of
//! `sqlite_master`.

use crate::key_provider::{validate_key, KeyProvider};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Wall-clock budget for a free-form query before the watchdog interrupts.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard cap on rows returned by `execute_query`.
pub const MAX_QUERY_ROWS: usize = 1000;
/// Page size bounds for `fetch_table_page`.
pub const MAX_PAGE_SIZE: u64 = 500;
/// Cap on rowids accepted by `fetch_rows_by_rowids`.
pub const MAX_ROWID_FETCH: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Host-supplied metadata binding a database id to a file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDescriptor {
    pub id: String,
    pub display_name: String,
    /// Storage kind; currently always "sqlite"
    pub kind: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub is_encrypted: bool,
    /// Sensitive databases reject all inspection operations
    pub is_sensitive: bool,
    /// Statements run right after `PRAGMA key` (cipher compatibility,
    /// kdf settings), in registration order
    #[serde(skip)]
    pub preparation_statements: Vec<String>,
}

impl DatabaseDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind: "sqlite".to_string(),
            path: path.into(),
            is_encrypted: false,
            is_sensitive: false,
            preparation_statements: Vec::new(),
        }
    }

    pub fn encrypted(mut self, preparation_statements: Vec<String>) -> Self {
        self.is_encrypted = true;
        self.preparation_statements = preparation_statements;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.is_sensitive = true;
        self
    }
}

/// Structured inspector error. Always returned in the DB response; the
/// probe never throws these into the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    DatabaseNotFound(String),
    TableNotFound(String),
    InvalidQuery(String),
    Timeout,
    AccessDenied(String),
    Internal(String),
}

impl DbError {
    /// Stable error code shown by the hub.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::DatabaseNotFound(_) => "DatabaseNotFound",
            DbError::TableNotFound(_) => "TableNotFound",
            DbError::InvalidQuery(_) => "InvalidQuery",
            DbError::Timeout => "Timeout",
            DbError::AccessDenied(_) => "AccessDenied",
            DbError::Internal(_) => "InternalError",
        }
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::DatabaseNotFound(id) => write!(f, "database not found: {id}"),
            DbError::TableNotFound(t) => write!(f, "table not found: {t}"),
            DbError::InvalidQuery(msg) => write!(f, "invalid query: {msg}"),
            DbError::Timeout => write!(f, "query exceeded its time budget"),
            DbError::AccessDenied(msg) => write!(f, "access denied: {msg}"),
            DbError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DbError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionStatus {
    None,
    Unlocked,
    Locked,
}

/// One row of `list_databases`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    pub id: String,
    pub display_name: String,
    pub kind: String,
    pub file_size_bytes: u64,
    pub table_count: u64,
    pub encryption_status: EncryptionStatus,
    pub is_sensitive: bool,
}

/// One column of `describe_table`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// A page of table rows. Every row carries the implicit `_rowid` column
/// for hub-side highlighting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePage {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub page: u64,
    pub page_size: u64,
    pub total_rows: u64,
}

/// Result of a free-form query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

/// Per-table search result, sorted by `match_count` descending.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub table: String,
    pub match_count: u64,
    pub preview_rows: Vec<Map<String, Value>>,
    pub rowids: Vec<i64>,
}

struct Registered {
    descriptor: DatabaseDescriptor,
    key_provider: Option<Arc<dyn KeyProvider>>,
}

/// The inspector: a registry of descriptors plus the query surface.
#[derive(Default)]
pub struct SqliteInspector {
    registry: Mutex<HashMap<String, Registered>>,
}

impl SqliteInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a database. Encrypted databases without a key provider
    /// show up as locked.
    pub fn register(&self, descriptor: DatabaseDescriptor, key_provider: Option<Arc<dyn KeyProvider>>) {
        debug!(db_id = %descriptor.id, encrypted = descriptor.is_encrypted, "Registering database");
        self.registry.lock().expect("registry lock").insert(
            descriptor.id.clone(),
            Registered {
                descriptor,
                key_provider,
            },
        );
    }

    pub fn unregister(&self, db_id: &str) {
        self.registry.lock().expect("registry lock").remove(db_id);
    }

    fn lookup(&self, db_id: &str) -> Result<(DatabaseDescriptor, Option<Arc<dyn KeyProvider>>), DbError> {
        let registry = self.registry.lock().expect("registry lock");
        let reg = registry
            .get(db_id)
            .ok_or_else(|| DbError::DatabaseNotFound(db_id.to_string()))?;
        Ok((reg.descriptor.clone(), reg.key_provider.clone()))
    }

    /// Resolve and validate the key for an operation on this database.
    /// Key provider failures surface as AccessDenied with the provider's
    /// reason, per the error taxonomy.
    async fn resolve_key(
        descriptor: &DatabaseDescriptor,
        provider: &Option<Arc<dyn KeyProvider>>,
    ) -> Result<Option<String>, DbError> {
        if !descriptor.is_encrypted {
            return Ok(None);
        }
        let provider = provider
            .as_ref()
            .ok_or_else(|| DbError::AccessDenied("database is locked (no key provider)".to_string()))?;
        let key = provider
            .get_key()
            .await
            .map_err(|e| DbError::AccessDenied(e.to_string()))?;
        validate_key(&key).map_err(|e| DbError::AccessDenied(e.to_string()))?;
        Ok(Some(key))
    }

    /// Look up, gate, and resolve the key for `db_id`.
    async fn prepare(&self, db_id: &str) -> Result<(DatabaseDescriptor, Option<String>), DbError> {
        let (descriptor, provider) = self.lookup(db_id)?;
        if descriptor.is_sensitive {
            return Err(DbError::AccessDenied("database is marked sensitive".to_string()));
        }
        let key = Self::resolve_key(&descriptor, &provider).await?;
        Ok((descriptor, key))
    }

    /// Run `f` against a fresh read-only connection on a blocking thread.
    async fn with_connection<T, F>(&self, db_id: &str, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let (descriptor, key) = self.prepare(db_id).await?;
        tokio::task::spawn_blocking(move || {
            let conn = open_readonly(&descriptor, key.as_deref())?;
            f(&conn)
        })
        .await
        .map_err(|e| DbError::Internal(format!("inspector task failed: {e}")))?
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Summaries for every registered database. File size never requires
    /// opening; the table count comes from a minimal open that may fail
    /// (locked/corrupt databases report zero tables).
    pub async fn list_databases(&self) -> Vec<DatabaseSummary> {
        let snapshot: Vec<(DatabaseDescriptor, Option<Arc<dyn KeyProvider>>)> = {
            let registry = self.registry.lock().expect("registry lock");
            registry
                .values()
                .map(|r| (r.descriptor.clone(), r.key_provider.clone()))
                .collect()
        };

        let mut summaries = Vec::with_capacity(snapshot.len());
        for (descriptor, provider) in snapshot {
            let file_size_bytes = std::fs::metadata(&descriptor.path).map(|m| m.len()).unwrap_or(0);

            let (table_count, encryption_status) = if descriptor.is_sensitive {
                let status = if descriptor.is_encrypted {
                    EncryptionStatus::Locked
                } else {
                    EncryptionStatus::None
                };
                (0, status)
            } else {
                match Self::resolve_key(&descriptor, &provider).await {
                    Err(_) => (0, EncryptionStatus::Locked),
                    Ok(key) => {
                        let desc = descriptor.clone();
                        let count = tokio::task::spawn_blocking(move || {
                            let conn = open_readonly(&desc, key.as_deref())?;
                            count_user_tables(&conn)
                        })
                        .await
                        .unwrap_or_else(|e| Err(DbError::Internal(e.to_string())));
                        match count {
                            Ok(n) => {
                                let status = if descriptor.is_encrypted {
                                    EncryptionStatus::Unlocked
                                } else {
                                    EncryptionStatus::None
                                };
                                (n, status)
                            }
                            Err(_) if descriptor.is_encrypted => (0, EncryptionStatus::Locked),
                            Err(_) => (0, EncryptionStatus::None),
                        }
                    }
                }
            };

            summaries.push(DatabaseSummary {
                id: descriptor.id,
                display_name: descriptor.display_name,
                kind: descriptor.kind,
                file_size_bytes,
                table_count,
                encryption_status,
                is_sensitive: descriptor.is_sensitive,
            });
        }
        summaries
    }

    /// Names of all user tables.
    pub async fn list_tables(&self, db_id: &str) -> Result<Vec<String>, DbError> {
        self.with_connection(db_id, |conn| list_user_tables(conn)).await
    }

    /// Column metadata for one table.
    pub async fn describe_table(&self, db_id: &str, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        let table = validated_identifier(table)?;
        self.with_connection(db_id, move |conn| {
            let columns = table_columns(conn, &table)?;
            if columns.is_empty() {
                return Err(DbError::TableNotFound(table));
            }
            Ok(columns)
        })
        .await
    }

    /// One page of rows. `page_size` is clamped to [1, 500] and `page`
    /// to >= 1. When `target_row_id` is given the page is rewritten to
    /// the one containing that rowid.
    pub async fn fetch_table_page(
        &self,
        db_id: &str,
        table: &str,
        page: u64,
        page_size: u64,
        order_by: Option<String>,
        ascending: bool,
        target_row_id: Option<i64>,
    ) -> Result<TablePage, DbError> {
        let table = validated_identifier(table)?;
        let order_by = match order_by {
            Some(col) if !col.is_empty() => Some(validated_identifier(&col)?),
            _ => None,
        };
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let page = page.max(1);

        self.with_connection(db_id, move |conn| {
            if !table_exists(conn, &table)? {
                return Err(DbError::TableNotFound(table));
            }

            let total_rows: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
                .map_err(map_sqlite_error)?;

            let order_clause = match &order_by {
                Some(col) => format!(
                    " ORDER BY \"{col}\" {}",
                    if ascending { "ASC" } else { "DESC" }
                ),
                None => String::new(),
            };

            let page = match target_row_id {
                Some(rowid) => {
                    match row_ordinal(conn, &table, &order_clause, rowid)? {
                        Some(ordinal) => (ordinal - 1) / page_size as i64 + 1,
                        None => page as i64,
                    }
                }
                None => page as i64,
            } as u64;

            let offset = (page - 1) * page_size;
            let sql = format!(
                "SELECT rowid AS _rowid, * FROM \"{table}\"{order_clause} LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut rows_out = Vec::new();
            let mut rows = stmt
                .query(rusqlite::params![page_size as i64, offset as i64])
                .map_err(map_sqlite_error)?;
            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                rows_out.push(row_to_map(row, &columns)?);
            }

            Ok(TablePage {
                columns,
                rows: rows_out,
                page,
                page_size,
                total_rows: total_rows.max(0) as u64,
            })
        })
        .await
    }

    /// Run a free-form read-only query with the 10-second watchdog.
    pub async fn execute_query(&self, db_id: &str, sql: &str) -> Result<QueryResult, DbError> {
        validate_read_only_sql(sql)?;
        let (descriptor, key) = self.prepare(db_id).await?;

        // Open first so the watchdog can hold the interrupt handle while
        // the query runs on a blocking thread.
        let desc = descriptor.clone();
        let key_clone = key.clone();
        let conn = tokio::task::spawn_blocking(move || open_readonly(&desc, key_clone.as_deref()))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))??;

        let interrupt = conn.get_interrupt_handle();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(QUERY_TIMEOUT).await;
            warn!("Query exceeded {}s budget, interrupting", QUERY_TIMEOUT.as_secs());
            interrupt.interrupt();
        });

        let sql = sql.to_string();
        let result = tokio::task::spawn_blocking(move || run_query(&conn, &sql))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?;
        watchdog.abort();
        result
    }

    /// Search every user table's text columns for a keyword.
    pub async fn search_in_database(
        &self,
        db_id: &str,
        keyword: &str,
        max_results_per_table: u64,
    ) -> Result<Vec<SearchHit>, DbError> {
        if keyword.is_empty() {
            return Err(DbError::InvalidQuery("empty search keyword".to_string()));
        }
        let pattern = format!("%{}%", escape_like(keyword));
        let limit = max_results_per_table.clamp(1, MAX_PAGE_SIZE);

        self.with_connection(db_id, move |conn| {
            let mut hits = Vec::new();
            for table in list_user_tables(conn)? {
                let columns = table_columns(conn, &table)?;
                let searchable: Vec<String> = columns
                    .into_iter()
                    .filter(|c| is_text_column(&c.decl_type))
                    .map(|c| c.name)
                    .filter(|name| validated_identifier(name).is_ok())
                    .collect();
                if searchable.is_empty() {
                    continue;
                }

                let where_clause = searchable
                    .iter()
                    .map(|col| format!("\"{col}\" LIKE ?1 ESCAPE '\\'"))
                    .collect::<Vec<_>>()
                    .join(" OR ");

                let match_count: i64 = conn
                    .query_row(
                        &format!("SELECT COUNT(*) FROM \"{table}\" WHERE {where_clause}"),
                        rusqlite::params![pattern],
                        |row| row.get(0),
                    )
                    .map_err(map_sqlite_error)?;
                if match_count == 0 {
                    continue;
                }

                let sql = format!(
                    "SELECT rowid AS _rowid, * FROM \"{table}\" WHERE {where_clause} LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
                let preview_columns: Vec<String> =
                    stmt.column_names().iter().map(|s| s.to_string()).collect();
                let mut preview_rows = Vec::new();
                let mut rows = stmt
                    .query(rusqlite::params![pattern, limit as i64])
                    .map_err(map_sqlite_error)?;
                while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                    preview_rows.push(row_to_map(row, &preview_columns)?);
                }
                drop(rows);
                drop(stmt);

                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT rowid FROM \"{table}\" WHERE {where_clause}"
                    ))
                    .map_err(map_sqlite_error)?;
                let rowids: Vec<i64> = stmt
                    .query_map(rusqlite::params![pattern], |row| row.get(0))
                    .map_err(map_sqlite_error)?
                    .collect::<Result<_, _>>()
                    .map_err(map_sqlite_error)?;

                hits.push(SearchHit {
                    table,
                    match_count: match_count.max(0) as u64,
                    preview_rows,
                    rowids,
                });
            }

            hits.sort_by(|a, b| b.match_count.cmp(&a.match_count));
            Ok(hits)
        })
        .await
    }

    /// Fetch specific rows by rowid, preserving the requested order.
    pub async fn fetch_rows_by_rowids(
        &self,
        db_id: &str,
        table: &str,
        row_ids: Vec<i64>,
    ) -> Result<Vec<Map<String, Value>>, DbError> {
        let table = validated_identifier(table)?;
        if row_ids.len() > MAX_ROWID_FETCH {
            return Err(DbError::InvalidQuery(format!(
                "at most {MAX_ROWID_FETCH} rowids per fetch"
            )));
        }
        self.with_connection(db_id, move |conn| {
            if !table_exists(conn, &table)? {
                return Err(DbError::TableNotFound(table));
            }
            if row_ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; row_ids.len()].join(",");
            let sql = format!(
                "SELECT rowid AS _rowid, * FROM \"{table}\" WHERE rowid IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut by_rowid: HashMap<i64, Map<String, Value>> = HashMap::new();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(row_ids.iter()))
                .map_err(map_sqlite_error)?;
            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                let rowid: i64 = row.get(0).map_err(map_sqlite_error)?;
                by_rowid.insert(rowid, row_to_map(row, &columns)?);
            }
            // Preserve the caller's order; missing rowids are skipped
            Ok(row_ids.iter().filter_map(|id| by_rowid.remove(id)).collect())
        })
        .await
    }
}

// ── Connection discipline ───────────────────────────────────────────

/// Open a per-call connection: read-only, no-mutex, 5s busy timeout,
/// key + preparation statements + verification when encrypted.
fn open_readonly(descriptor: &DatabaseDescriptor, key: Option<&str>) -> Result<Connection, DbError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(&descriptor.path, flags)
        .map_err(|e| DbError::Internal(format!("failed to open database: {e}")))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| DbError::Internal(format!("failed to set busy timeout: {e}")))?;

    if let Some(key) = key {
        // Hex keyspecs go through verbatim; passphrases are quoted with
        // embedded quotes doubled
        let literal = if key.starts_with("x'") && key.ends_with('\'') {
            key.to_string()
        } else {
            key.replace('"', "\"\"")
        };
        conn.execute_batch(&format!("PRAGMA key = \"{literal}\";"))
            .map_err(|e| DbError::AccessDenied(format!("failed to apply key: {e}")))?;
        for statement in &descriptor.preparation_statements {
            conn.execute_batch(statement)
                .map_err(|e| DbError::AccessDenied(format!("preparation statement failed: {e}")))?;
        }
        // The key is only checked on first page access
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|_| DbError::AccessDenied("Invalid encryption key".to_string()))?;
    }

    Ok(conn)
}

fn map_sqlite_error(e: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(ffi, _) = &e {
        if ffi.code == rusqlite::ErrorCode::OperationInterrupted {
            return DbError::Timeout;
        }
    }
    DbError::Internal(e.to_string())
}

// ── Guardrails ──────────────────────────────────────────────────────

/// Validate an identifier destined for interpolation. Parameterized
/// statements cannot bind identifiers, so this gate plus double-quoting
/// is what stands between the hub and SQL injection.
pub fn validated_identifier(name: &str) -> Result<String, DbError> {
    if name.is_empty() || name.len() > 128 {
        return Err(DbError::InvalidQuery(format!("invalid identifier: {name:?}")));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(DbError::InvalidQuery(format!("invalid identifier: {name:?}")));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::InvalidQuery(format!("invalid identifier: {name:?}")));
    }
    Ok(name.to_string())
}

const DENYLIST: [&str; 8] = [
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "ATTACH", "DETACH",
];

/// Reject anything that is not a single read-only SELECT. Denylisted
/// keywords are matched as whole words so column names like
/// `createTimestamp` pass.
pub fn validate_read_only_sql(sql: &str) -> Result<(), DbError> {
    let trimmed = sql.trim();
    if !trimmed
        .get(..6)
        .map(|prefix| prefix.eq_ignore_ascii_case("SELECT"))
        .unwrap_or(false)
    {
        return Err(DbError::InvalidQuery("only SELECT statements are allowed".to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    static DENY_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = DENY_RE.get_or_init(|| {
        let words = DENYLIST.join("|");
        regex::Regex::new(&format!(r"\b({words})\b")).expect("denylist regex")
    });
    if let Some(m) = re.find(&upper) {
        return Err(DbError::InvalidQuery(format!(
            "statement contains forbidden keyword {}",
            m.as_str()
        )));
    }
    Ok(())
}

/// Escape `%`, `_` and `\` in a LIKE keyword. The keyword itself is
/// always bound as a parameter, so quotes need no treatment here.
fn escape_like(keyword: &str) -> String {
    keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn is_text_column(decl_type: &str) -> bool {
    if decl_type.is_empty() {
        // Untyped columns are searched by default
        return true;
    }
    let upper = decl_type.to_ascii_uppercase();
    ["TEXT", "CHAR", "CLOB", "VARCHAR", "STRING"]
        .iter()
        .any(|t| upper.contains(t))
}

// ── Introspection helpers ───────────────────────────────────────────

fn list_user_tables(conn: &Connection) -> Result<Vec<String>, DbError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(map_sqlite_error)?;
    let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(map_sqlite_error)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(map_sqlite_error)?;
    Ok(names)
}

fn count_user_tables(conn: &Connection) -> Result<u64, DbError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .map_err(map_sqlite_error)?;
    Ok(count.max(0) as u64)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, DbError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            rusqlite::params![table],
            |row| row.get(0),
        )
        .map_err(map_sqlite_error)?;
    Ok(count > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .map_err(map_sqlite_error)?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                primary_key: row.get::<_, i64>(5)? != 0,
                default_value: row.get(4)?,
            })
        })
        .map_err(map_sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_sqlite_error)?;
    Ok(columns)
}

/// 1-based ordinal of `rowid` under the given order clause. Prefers
/// ROW_NUMBER(); without an order clause falls back to counting rowids
/// when window functions are unavailable.
fn row_ordinal(
    conn: &Connection,
    table: &str,
    order_clause: &str,
    rowid: i64,
) -> Result<Option<i64>, DbError> {
    let window_order = if order_clause.is_empty() {
        "ORDER BY rowid"
    } else {
        order_clause.trim_start()
    };
    let window_sql = format!(
        "SELECT rn FROM (SELECT rowid AS rid, ROW_NUMBER() OVER ({window_order}) AS rn \
         FROM \"{table}\") WHERE rid = ?1"
    );
    match conn.query_row(&window_sql, rusqlite::params![rowid], |row| row.get::<_, i64>(0)) {
        Ok(ordinal) => Ok(Some(ordinal)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) if order_clause.is_empty() => {
            // Window functions unavailable; with no explicit order the
            // rowid count gives the same ordinal
            debug!(error = %e, "ROW_NUMBER unavailable, falling back to rowid count");
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM \"{table}\" WHERE rowid <= ?1"),
                    rusqlite::params![rowid],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_error)?;
            if count == 0 {
                Ok(None)
            } else {
                Ok(Some(count))
            }
        }
        Err(e) => Err(map_sqlite_error(e)),
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryResult, DbError> {
    let mut stmt = conn.prepare(sql).map_err(|e| match map_sqlite_error(e) {
        DbError::Timeout => DbError::Timeout,
        other => DbError::InvalidQuery(other.to_string()),
    })?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows_out: Vec<Vec<Value>> = Vec::new();
    let mut truncated = false;
    let mut rows = stmt.query([]).map_err(map_sqlite_error)?;
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        if rows_out.len() >= MAX_QUERY_ROWS {
            truncated = true;
            break;
        }
        let mut out = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            out.push(value_to_json(row.get_ref(i).map_err(map_sqlite_error)?));
        }
        rows_out.push(out);
    }

    Ok(QueryResult {
        row_count: rows_out.len(),
        columns,
        rows: rows_out,
        truncated,
    })
}

fn row_to_map(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<Map<String, Value>, DbError> {
    let mut map = Map::new();
    for (i, name) in columns.iter().enumerate() {
        map.insert(name.clone(), value_to_json(row.get_ref(i).map_err(map_sqlite_error)?));
    }
    Ok(map)
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(STANDARD.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Pure guardrail tests ────────────────────────────────────────

    #[test]
    fn identifier_validation() {
        assert!(validated_identifier("users").is_ok());
        assert!(validated_identifier("_private").is_ok());
        assert!(validated_identifier("col_2").is_ok());

        assert!(validated_identifier("").is_err());
        assert!(validated_identifier("2cols").is_err());
        assert!(validated_identifier("users; DROP TABLE t").is_err());
        assert!(validated_identifier("a\"b").is_err());
        assert!(validated_identifier(&"x".repeat(129)).is_err());
        assert!(validated_identifier(&"x".repeat(128)).is_ok());
    }

    #[test]
    fn sql_must_start_with_select() {
        assert!(validate_read_only_sql("SELECT 1").is_ok());
        assert!(validate_read_only_sql("  select * from t  ").is_ok());
        assert!(validate_read_only_sql("PRAGMA table_info(t)").is_err());
        assert!(validate_read_only_sql("VACUUM").is_err());
        assert!(validate_read_only_sql("").is_err());
    }

    #[test]
    fn sql_denylist_matches_whole_words() {
        // Trailing statements after a semicolon are caught by the keyword scan
        assert!(validate_read_only_sql("SELECT * FROM t; DELETE FROM t").is_err());
        assert!(validate_read_only_sql("SELECT * FROM t WHERE x = 'UPDATE'").is_err());

        // Whole-word matching skips identifiers that merely contain a keyword
        assert!(validate_read_only_sql("SELECT createTimestamp FROM t").is_ok());
        assert!(validate_read_only_sql("SELECT updated_at, dropped_count FROM t").is_ok());
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("50%"), "50\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn text_column_detection() {
        assert!(is_text_column("TEXT"));
        assert!(is_text_column("varchar(40)"));
        assert!(is_text_column("NCHAR(10)"));
        assert!(is_text_column("CLOB"));
        assert!(is_text_column("STRING"));
        assert!(is_text_column("")); // untyped searched by default
        assert!(!is_text_column("INTEGER"));
        assert!(!is_text_column("REAL"));
        assert!(!is_text_column("BLOB"));
    }

    #[test]
    fn db_error_codes() {
        assert_eq!(DbError::Timeout.code(), "Timeout");
        assert_eq!(DbError::InvalidQuery("x".into()).code(), "InvalidQuery");
        assert_eq!(DbError::Internal("x".into()).code(), "InternalError");
    }

    // ── Live database tests ─────────────────────────────────────────

    fn seeded_db(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("app.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, createTimestamp TEXT);
             CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);
             INSERT INTO users (name, age, createTimestamp) VALUES
                 ('alice', 30, '2026-01-01'),
                 ('bob', 25, '2026-01-02'),
                 ('carol', 41, '2026-01-03');
             INSERT INTO notes (body) VALUES ('hello world'), ('50% off'), ('plain note');",
        )
        .unwrap();
        path
    }

    fn inspector_with(path: &std::path::Path) -> SqliteInspector {
        let inspector = SqliteInspector::new();
        inspector.register(DatabaseDescriptor::new("db1", "App DB", path), None);
        inspector
    }

    #[tokio::test]
    async fn list_tables_matches_sqlite_master() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        let tables = inspector.list_tables("db1").await.unwrap();
        assert_eq!(tables, vec!["notes", "users"]);
    }

    #[tokio::test]
    async fn unknown_database_is_reported() {
        let inspector = SqliteInspector::new();
        let err = inspector.list_tables("nope").await.unwrap_err();
        assert!(matches!(err, DbError::DatabaseNotFound(_)));

        let err = inspector.execute_query("nope", "SELECT 1").await.unwrap_err();
        assert!(matches!(err, DbError::DatabaseNotFound(_)));
    }

    #[tokio::test]
    async fn describe_table_reports_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        let columns = inspector.describe_table("db1", "users").await.unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "age", "createTimestamp"]);
        assert!(columns[0].primary_key);

        let err = inspector.describe_table("db1", "missing").await.unwrap_err();
        assert!(matches!(err, DbError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn execute_query_guardrails() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        // Whole-word denylist skips createTimestamp
        let result = inspector
            .execute_query("db1", "SELECT createTimestamp FROM users")
            .await
            .unwrap();
        assert_eq!(result.row_count, 3);

        let err = inspector
            .execute_query("db1", "SELECT * FROM users; DELETE FROM users")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(msg) if msg.contains("DELETE")));

        let err = inspector
            .execute_query("db1", "DROP TABLE users")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn execute_query_returns_rows_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (n INTEGER)").unwrap();
            let mut stmt = conn.prepare("INSERT INTO t (n) VALUES (?1)").unwrap();
            for i in 0..1100 {
                stmt.execute(rusqlite::params![i]).unwrap();
            }
        }
        let inspector = inspector_with(&path);

        let result = inspector.execute_query("db1", "SELECT n FROM t").await.unwrap();
        assert_eq!(result.row_count, MAX_QUERY_ROWS);
        assert!(result.truncated);

        let result = inspector
            .execute_query("db1", "SELECT n FROM t LIMIT 5")
            .await
            .unwrap();
        assert_eq!(result.row_count, 5);
        assert!(!result.truncated);
        assert_eq!(result.columns, vec!["n"]);
    }

    #[tokio::test]
    async fn fetch_table_page_clamps_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        let page = inspector
            .fetch_table_page("db1", "users", 1, 2, Some("age".to_string()), true, None)
            .await
            .unwrap();
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0]["name"], "bob"); // youngest first
        assert!(page.rows[0].contains_key("_rowid"));

        // page_size 0 clamps to 1; page 0 clamps to 1
        let page = inspector
            .fetch_table_page("db1", "users", 0, 0, None, true, None)
            .await
            .unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.rows.len(), 1);
    }

    #[tokio::test]
    async fn fetch_table_page_target_rowid_lands_on_right_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paged.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (n INTEGER)").unwrap();
            let mut stmt = conn.prepare("INSERT INTO t (n) VALUES (?1)").unwrap();
            for i in 1..=25 {
                stmt.execute(rusqlite::params![i]).unwrap();
            }
        }
        let inspector = inspector_with(&path);

        // rowid 17 with page size 5 lives on page 4
        let page = inspector
            .fetch_table_page("db1", "t", 1, 5, None, true, Some(17))
            .await
            .unwrap();
        assert_eq!(page.page, 4);
        assert!(page.rows.iter().any(|r| r["_rowid"] == 17));

        // Ordered descending by n, rowid 17 is the 9th row -> page 2
        let page = inspector
            .fetch_table_page("db1", "t", 1, 5, Some("n".to_string()), false, Some(17))
            .await
            .unwrap();
        assert_eq!(page.page, 2);
        assert!(page.rows.iter().any(|r| r["_rowid"] == 17));
    }

    #[tokio::test]
    async fn fetch_table_page_rejects_bad_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        let err = inspector
            .fetch_table_page("db1", "users; --", 1, 10, None, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(_)));

        let err = inspector
            .fetch_table_page("db1", "users", 1, 10, Some("age DESC".to_string()), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidQuery(_)));

        let err = inspector
            .fetch_table_page("db1", "ghost", 1, 10, None, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn search_finds_text_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        let hits = inspector.search_in_database("db1", "hello", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].table, "notes");
        assert_eq!(hits[0].match_count, 1);
        assert_eq!(hits[0].rowids.len(), 1);
        assert!(hits[0].preview_rows[0].contains_key("_rowid"));
    }

    #[tokio::test]
    async fn search_escapes_like_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        // "%" must match only the literal percent note, not everything
        let hits = inspector.search_in_database("db1", "50%", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_count, 1);
    }

    #[tokio::test]
    async fn search_orders_by_match_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE few (t TEXT); CREATE TABLE many (t TEXT);
                 INSERT INTO few (t) VALUES ('needle');
                 INSERT INTO many (t) VALUES ('needle'), ('needle two'), ('a needle');",
            )
            .unwrap();
        }
        let inspector = inspector_with(&path);

        let hits = inspector.search_in_database("db1", "needle", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].table, "many");
        assert_eq!(hits[1].table, "few");
    }

    #[tokio::test]
    async fn fetch_rows_by_rowids_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = inspector_with(&path);

        let rows = inspector
            .fetch_rows_by_rowids("db1", "users", vec![3, 1])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "carol");
        assert_eq!(rows[1]["name"], "alice");

        // Missing rowids are skipped silently
        let rows = inspector
            .fetch_rows_by_rowids("db1", "users", vec![999, 2])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "bob");
    }

    #[tokio::test]
    async fn sensitive_database_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = SqliteInspector::new();
        inspector.register(
            DatabaseDescriptor::new("secrets", "Secrets", &path).sensitive(),
            None,
        );

        for result in [
            inspector.list_tables("secrets").await.err(),
            inspector.execute_query("secrets", "SELECT 1").await.err(),
            inspector
                .search_in_database("secrets", "x", 5)
                .await
                .err(),
        ] {
            assert!(matches!(result, Some(DbError::AccessDenied(_))));
        }

        // It still appears in the listing, but with no table count
        let summaries = inspector.list_databases().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].table_count, 0);
        assert!(summaries[0].is_sensitive);
    }

    #[tokio::test]
    async fn list_databases_reports_size_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = SqliteInspector::new();
        inspector.register(DatabaseDescriptor::new("db1", "App DB", &path), None);
        inspector.register(
            DatabaseDescriptor::new("gone", "Deleted", dir.path().join("missing.db")),
            None,
        );

        let mut summaries = inspector.list_databases().await;
        summaries.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(summaries[0].id, "db1");
        assert!(summaries[0].file_size_bytes > 0);
        assert_eq!(summaries[0].table_count, 2);
        assert_eq!(summaries[0].encryption_status, EncryptionStatus::None);

        assert_eq!(summaries[1].id, "gone");
        assert_eq!(summaries[1].file_size_bytes, 0);
        assert_eq!(summaries[1].table_count, 0);
    }

    #[tokio::test]
    async fn encrypted_without_provider_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(&dir);
        let inspector = SqliteInspector::new();
        inspector.register(
            DatabaseDescriptor::new("enc", "Encrypted", &path).encrypted(vec![]),
            None,
        );

        let summaries = inspector.list_databases().await;
        assert_eq!(summaries[0].encryption_status, EncryptionStatus::Locked);
        assert_eq!(summaries[0].table_count, 0);

        let err = inspector.list_tables("enc").await.unwrap_err();
        assert!(matches!(err, DbError::AccessDenied(_)));
    }
}
