use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{Document, Store};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;
/// Entries kept in the `logs` collection; older ones are dropped on append
pub const MAX_STORED_LOGS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One log document, written by the bot or by server jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: String,
    pub level: LogLevel,
    /// Who wrote the entry, e.g. `bot` or `backup`
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Document for ActivityLog {
    const COLLECTION: &'static str = "logs";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLogEntry {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub source: Option<String>,
    pub level: Option<LogLevel>,
    pub limit: Option<usize>,
}

pub async fn append_log(store: &Store, entry: NewLogEntry) -> Result<ActivityLog, AppError> {
    append_log_keeping(store, entry, MAX_STORED_LOGS).await
}

async fn append_log_keeping(
    store: &Store,
    entry: NewLogEntry,
    keep: usize,
) -> Result<ActivityLog, AppError> {
    let source = entry.source.trim();
    if source.is_empty() || entry.message.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Log entries need a source and a message".to_string(),
        ));
    }

    let log = ActivityLog {
        id: Uuid::new_v4().to_string(),
        level: entry.level,
        source: source.to_string(),
        message: entry.message,
        meta: entry.meta,
        created_at: Utc::now(),
    };

    let log = store
        .write(move |txn| {
            let log = txn.insert(log)?;
            let dropped = txn.keep_newest::<ActivityLog>(keep);
            if dropped > 0 {
                debug!(dropped, "pruned old log entries");
            }
            Ok(log)
        })
        .await?;
    Ok(log)
}

/// Newest entries first, filtered by source and level
pub async fn recent_logs(store: &Store, query: &LogQuery) -> Result<Vec<ActivityLog>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let mut logs = store
        .find(|log: &ActivityLog| {
            query.source.as_deref().is_none_or(|source| log.source == source)
                && query.level.is_none_or(|level| log.level == level)
        })
        .await?;

    logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    logs.truncate(limit);
    Ok(logs)
}

#[cfg(feature = "web")]
pub use web::*;

#[cfg(feature = "web")]
mod web {
    use axum::{
        Json,
        extract::{Query, State},
        response::IntoResponse,
    };

    use super::*;
    use crate::app::{AppState, success};

    pub async fn handle_list_logs(
        State(state): State<AppState>,
        Query(query): Query<LogQuery>,
    ) -> Result<impl IntoResponse, AppError> {
        success(recent_logs(&state.store, &query).await?)
    }

    /// Log intake for the bot (bearer-authenticated)
    pub async fn handle_append_log(
        State(state): State<AppState>,
        Json(entry): Json<NewLogEntry>,
    ) -> Result<impl IntoResponse, AppError> {
        success(append_log(&state.store, entry).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel, source: &str, message: &str) -> NewLogEntry {
        NewLogEntry {
            level,
            source: source.to_string(),
            message: message.to_string(),
            meta: None,
        }
    }

    #[tokio::test]
    async fn recent_logs_are_newest_first_and_filtered() {
        let store = Store::in_memory();
        append_log(&store, entry(LogLevel::Info, "bot", "started")).await.unwrap();
        append_log(&store, entry(LogLevel::Error, "backup", "upload failed")).await.unwrap();
        append_log(&store, entry(LogLevel::Info, "bot", "synced roles")).await.unwrap();

        let bot = recent_logs(
            &store,
            &LogQuery {
                source: Some("bot".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(bot.len(), 2);
        assert!(bot[0].created_at >= bot[1].created_at);

        let errors = recent_logs(
            &store,
            &LogQuery {
                level: Some(LogLevel::Error),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "backup");

        let one = recent_logs(
            &store,
            &LogQuery {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn blank_entries_are_rejected() {
        let store = Store::in_memory();
        assert!(matches!(
            append_log(&store, entry(LogLevel::Info, " ", "hello")).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn appending_past_the_cap_drops_the_oldest_entries() {
        let store = Store::in_memory();
        for message in ["one", "two", "three", "four"] {
            append_log_keeping(&store, entry(LogLevel::Info, "bot", message), 3)
                .await
                .unwrap();
        }

        let stored: Vec<String> = store
            .list::<ActivityLog>()
            .await
            .unwrap()
            .into_iter()
            .map(|log| log.message)
            .collect();
        assert_eq!(stored, vec!["two", "three", "four"]);
    }
}
