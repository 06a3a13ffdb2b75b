//! Database plugin: the inspector's command surface
//!
//! Accepts `db_command` envelopes wrapping a typed [`DbCommand`] and
//! answers with a structural [`DbResponse`]. Inspector failures never
//! surface as command failures; they travel inside the response payload
//! so the hub can render them.

use super::parse_payload;
use crate::error::{ProbeError, Result};
use crate::inspector::DbError;
use crate::kernel::{PluginContext, PluginDescriptor, ProbePlugin};
use crate::types::{PluginCommand, PluginCommandResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

pub const PLUGIN_ID: &str = "database";

fn default_page() -> u64 {
    1
}
fn default_page_size() -> u64 {
    50
}
fn default_true() -> bool {
    true
}
fn default_search_limit() -> u64 {
    20
}

/// The typed operation inside a `db_command` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DbCommand {
    ListDatabases,
    #[serde(rename_all = "camelCase")]
    ListTables { db_id: String },
    #[serde(rename_all = "camelCase")]
    DescribeTable { db_id: String, table: String },
    #[serde(rename_all = "camelCase")]
    FetchTablePage {
        db_id: String,
        table: String,
        #[serde(default = "default_page")]
        page: u64,
        #[serde(default = "default_page_size")]
        page_size: u64,
        #[serde(default)]
        order_by: Option<String>,
        #[serde(default = "default_true")]
        ascending: bool,
        #[serde(default)]
        target_row_id: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    ExecuteQuery { db_id: String, sql: String },
    #[serde(rename_all = "camelCase")]
    SearchDatabase {
        db_id: String,
        keyword: String,
        #[serde(default = "default_search_limit")]
        max_results_per_table: u64,
    },
    #[serde(rename_all = "camelCase")]
    FetchRowsByRowIds {
        db_id: String,
        table: String,
        row_ids: Vec<i64>,
    },
}

/// Structural result of a DB command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DbResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_code: None,
            error_message: None,
        }
    }

    fn err(error: DbError) -> Self {
        Self {
            success: false,
            data: None,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
        }
    }

    fn from_result<T: Serialize>(result: std::result::Result<T, DbError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(data) => Self::ok(data),
                Err(e) => Self::err(DbError::Internal(e.to_string())),
            },
            Err(error) => Self::err(error),
        }
    }
}

#[derive(Default)]
pub struct DatabasePlugin {
    ctx: Mutex<Option<Arc<PluginContext>>>,
}

impl DatabasePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<Arc<PluginContext>> {
        self.ctx
            .lock()
            .expect("ctx lock")
            .clone()
            .ok_or_else(|| ProbeError::invalid_config("database plugin is not initialized"))
    }

    async fn dispatch(&self, ctx: &PluginContext, command: DbCommand) -> DbResponse {
        let inspector = &ctx.inspector;
        match command {
            DbCommand::ListDatabases => DbResponse::from_result(Ok(inspector.list_databases().await)),
            DbCommand::ListTables { db_id } => {
                DbResponse::from_result(inspector.list_tables(&db_id).await)
            }
            DbCommand::DescribeTable { db_id, table } => {
                DbResponse::from_result(inspector.describe_table(&db_id, &table).await)
            }
            DbCommand::FetchTablePage {
                db_id,
                table,
                page,
                page_size,
                order_by,
                ascending,
                target_row_id,
            } => DbResponse::from_result(
                inspector
                    .fetch_table_page(&db_id, &table, page, page_size, order_by, ascending, target_row_id)
                    .await,
            ),
            DbCommand::ExecuteQuery { db_id, sql } => {
                DbResponse::from_result(inspector.execute_query(&db_id, &sql).await)
            }
            DbCommand::SearchDatabase {
                db_id,
                keyword,
                max_results_per_table,
            } => DbResponse::from_result(
                inspector
                    .search_in_database(&db_id, &keyword, max_results_per_table)
                    .await,
            ),
            DbCommand::FetchRowsByRowIds { db_id, table, row_ids } => {
                DbResponse::from_result(inspector.fetch_rows_by_rowids(&db_id, &table, row_ids).await)
            }
        }
    }
}

#[async_trait]
impl ProbePlugin for DatabasePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(PLUGIN_ID, "Database")
    }

    async fn initialize(&self, ctx: Arc<PluginContext>) -> Result<()> {
        *self.ctx.lock().expect("ctx lock") = Some(ctx);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn handle_command(&self, cmd: &PluginCommand) -> PluginCommandResponse {
        let ctx = match self.ctx() {
            Ok(ctx) => ctx,
            Err(e) => return PluginCommandResponse::fail(cmd, e.to_string()),
        };

        match cmd.command_type.as_str() {
            "enable" | "disable" => PluginCommandResponse::ok(cmd, None),
            "get_status" => {
                let databases = ctx.inspector.list_databases().await.len();
                PluginCommandResponse::ok(cmd, Some(json!({"registeredDatabases": databases})))
            }
            "db_command" => {
                let command: DbCommand = match parse_payload(cmd) {
                    Ok(c) => c,
                    Err(e) => return PluginCommandResponse::fail(cmd, e),
                };
                let response = self.dispatch(&ctx, command).await;
                match serde_json::to_value(&response) {
                    Ok(payload) => PluginCommandResponse::ok(cmd, Some(payload)),
                    Err(e) => PluginCommandResponse::fail(cmd, e.to_string()),
                }
            }
            other => PluginCommandResponse::fail(cmd, format!("unknown command '{other}'")),
        }
    }
}
