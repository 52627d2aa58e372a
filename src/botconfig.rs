//! Chat bot integration: versioned configuration and liveness.
//!
//! The bot's configuration is one document. Every replace first copies the
//! current document into `bot_config_history` (keyed by its version) and then
//! writes the new one with the version bumped by exactly one. Both writes
//! happen in one store unit of work.
//!
//! Liveness comes from a heartbeat document the bot refreshes periodically;
//! a heartbeat older than the configured threshold means the bot is offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::AppError;
use crate::store::{Document, Store, StoreError};

const CURRENT_ID: &str = "current";
const HEARTBEAT_ID: &str = "bot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    pub version: u64,
    pub settings: Value,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl Document for BotConfig {
    const COLLECTION: &'static str = "bot_config";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A configuration document as it was right before being replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfigSnapshot {
    pub id: String,
    pub version: u64,
    pub settings: Value,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub archived_at: DateTime<Utc>,
    pub archived_by: String,
}

impl Document for BotConfigSnapshot {
    const COLLECTION: &'static str = "bot_config_history";

    fn id(&self) -> &str {
        &self.id
    }
}

fn snapshot_id(version: u64) -> String {
    format!("v{version}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotHeartbeat {
    pub id: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub bot_version: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl Document for BotHeartbeat {
    const COLLECTION: &'static str = "bot_heartbeat";

    fn id(&self) -> &str {
        &self.id
    }
}

/// What the bot sends with each heartbeat
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatReport {
    #[serde(default)]
    pub bot_version: Option<String>,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Online,
    Offline,
    Unknown,
}

impl BotState {
    pub fn label(self) -> &'static str {
        match self {
            BotState::Online => "ONLINE",
            BotState::Offline => "OFFLINE",
            BotState::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotStatus {
    pub state: BotState,
    pub last_seen: Option<DateTime<Utc>>,
    pub seconds_since: Option<i64>,
    pub bot_version: Option<String>,
}

impl BotStatus {
    /// Classify a heartbeat against the staleness threshold
    pub fn evaluate(
        heartbeat: Option<&BotHeartbeat>,
        now: DateTime<Utc>,
        offline_after: Duration,
    ) -> Self {
        let Some(heartbeat) = heartbeat else {
            return BotStatus {
                state: BotState::Unknown,
                last_seen: None,
                seconds_since: None,
                bot_version: None,
            };
        };

        let seconds_since = (now - heartbeat.last_seen).num_seconds().max(0);
        let threshold = i64::try_from(offline_after.as_secs()).unwrap_or(i64::MAX);

        BotStatus {
            state: if seconds_since <= threshold {
                BotState::Online
            } else {
                BotState::Offline
            },
            last_seen: Some(heartbeat.last_seen),
            seconds_since: Some(seconds_since),
            bot_version: heartbeat.bot_version.clone(),
        }
    }
}

pub async fn current_config(store: &Store) -> Result<BotConfig, AppError> {
    store
        .get::<BotConfig>(CURRENT_ID)
        .await?
        .ok_or_else(|| AppError::NotFound("Bot configuration has not been set".to_string()))
}

/// Replace the bot configuration, archiving the previous document.
///
/// # Arguments
/// * `store` - Document store
/// * `settings` - New settings; must be a JSON object
/// * `actor` - Admin performing the change
///
/// # Returns
/// * `Result<BotConfig, AppError>` - The new document, `version` one above the old
pub async fn replace_config(
    store: &Store,
    settings: Value,
    actor: &str,
) -> Result<BotConfig, AppError> {
    if !settings.is_object() {
        return Err(AppError::BadRequest(
            "Bot settings must be a JSON object".to_string(),
        ));
    }

    let config = store
        .write(|txn| {
            let now = Utc::now();
            let previous = txn.get::<BotConfig>(CURRENT_ID)?;

            let version = match previous {
                Some(previous) => {
                    let next = previous.version + 1;
                    txn.put(BotConfigSnapshot {
                        id: snapshot_id(previous.version),
                        version: previous.version,
                        settings: previous.settings,
                        updated_at: previous.updated_at,
                        updated_by: previous.updated_by,
                        archived_at: now,
                        archived_by: actor.to_string(),
                    })?;
                    next
                }
                None => 1,
            };

            let config = BotConfig {
                id: CURRENT_ID.to_string(),
                version,
                settings,
                updated_at: now,
                updated_by: actor.to_string(),
            };
            txn.put(config.clone())?;
            Ok(config)
        })
        .await?;

    tracing::info!(version = config.version, actor, "bot configuration replaced");
    Ok(config)
}

/// Archived versions, newest first
pub async fn config_history(store: &Store) -> Result<Vec<BotConfigSnapshot>, AppError> {
    let mut history = store.list::<BotConfigSnapshot>().await?;
    history.sort_by(|a, b| b.version.cmp(&a.version));
    Ok(history)
}

pub async fn config_snapshot(store: &Store, version: u64) -> Result<BotConfigSnapshot, AppError> {
    store
        .get::<BotConfigSnapshot>(&snapshot_id(version))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Bot configuration v{version} not found")))
}

/// Bring back the settings of an archived version as a new version
pub async fn restore_config(
    store: &Store,
    version: u64,
    actor: &str,
) -> Result<BotConfig, AppError> {
    let snapshot = config_snapshot(store, version).await?;
    replace_config(store, snapshot.settings, actor).await
}

pub async fn record_heartbeat(
    store: &Store,
    report: HeartbeatReport,
) -> Result<BotHeartbeat, StoreError> {
    let heartbeat = BotHeartbeat {
        id: HEARTBEAT_ID.to_string(),
        last_seen: Utc::now(),
        bot_version: report.bot_version,
        details: report.details,
    };
    store.put(heartbeat.clone()).await?;
    Ok(heartbeat)
}

pub async fn bot_status(store: &Store, offline_after: Duration) -> Result<BotStatus, AppError> {
    let heartbeat = store.get::<BotHeartbeat>(HEARTBEAT_ID).await?;
    Ok(BotStatus::evaluate(
        heartbeat.as_ref(),
        Utc::now(),
        offline_after,
    ))
}

#[cfg(feature = "web")]
pub use web::*;

#[cfg(feature = "web")]
mod web {
    use axum::{
        Extension, Json,
        extract::{Path, State},
        response::IntoResponse,
    };

    use super::*;
    use crate::app::{AppState, success};
    use crate::login::AdminSession;

    pub async fn handle_get_config(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(current_config(&state.store).await?)
    }

    pub async fn handle_replace_config(
        State(state): State<AppState>,
        Extension(admin): Extension<AdminSession>,
        Json(settings): Json<Value>,
    ) -> Result<impl IntoResponse, AppError> {
        success(replace_config(&state.store, settings, &admin.username).await?)
    }

    pub async fn handle_config_history(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(config_history(&state.store).await?)
    }

    pub async fn handle_config_snapshot(
        State(state): State<AppState>,
        Path(version): Path<u64>,
    ) -> Result<impl IntoResponse, AppError> {
        success(config_snapshot(&state.store, version).await?)
    }

    pub async fn handle_restore_config(
        State(state): State<AppState>,
        Extension(admin): Extension<AdminSession>,
        Path(version): Path<u64>,
    ) -> Result<impl IntoResponse, AppError> {
        success(restore_config(&state.store, version, &admin.username).await?)
    }

    pub async fn handle_bot_status(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(bot_status(&state.store, state.config.bot_offline_after).await?)
    }

    /// Heartbeat intake for the bot (bearer-authenticated)
    pub async fn handle_heartbeat(
        State(state): State<AppState>,
        body: Option<Json<HeartbeatReport>>,
    ) -> Result<impl IntoResponse, AppError> {
        let report = body.map(|Json(report)| report).unwrap_or_default();
        let heartbeat = record_heartbeat(&state.store, report).await?;
        tracing::debug!(last_seen = %heartbeat.last_seen, "bot heartbeat");
        success(heartbeat)
    }

    /// The bot reads its own configuration with the service secret
    pub async fn handle_service_config(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(current_config(&state.store).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_replace_bumps_the_version_by_one_and_archives_the_old() {
        let store = Store::in_memory();
        assert!(matches!(
            current_config(&store).await,
            Err(AppError::NotFound(_))
        ));

        let first = replace_config(&store, json!({ "prefix": "!" }), "ops").await.unwrap();
        assert_eq!(first.version, 1);
        assert!(config_history(&store).await.unwrap().is_empty());

        let second = replace_config(&store, json!({ "prefix": "?" }), "lead").await.unwrap();
        let third = replace_config(&store, json!({ "prefix": "$" }), "ops").await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(third.version, 3);

        let history = config_history(&store).await.unwrap();
        assert_eq!(
            history.iter().map(|s| s.version).collect::<Vec<_>>(),
            vec![2, 1]
        );
        assert_eq!(history[0].settings, json!({ "prefix": "?" }));
        assert_eq!(history[0].updated_by, "lead");
        assert_eq!(history[0].archived_by, "ops");

        assert_eq!(current_config(&store).await.unwrap(), third);
    }

    #[tokio::test]
    async fn restore_is_a_new_version() {
        let store = Store::in_memory();
        replace_config(&store, json!({ "channel": "general" }), "ops").await.unwrap();
        replace_config(&store, json!({ "channel": "random" }), "ops").await.unwrap();

        let restored = restore_config(&store, 1, "ops").await.unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(restored.settings, json!({ "channel": "general" }));
        assert_eq!(config_history(&store).await.unwrap().len(), 2);

        assert!(matches!(
            restore_config(&store, 42, "ops").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn settings_must_be_an_object() {
        let store = Store::in_memory();
        assert!(matches!(
            replace_config(&store, json!(["nope"]), "ops").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn stale_heartbeats_mean_offline() {
        let now = Utc::now();
        let heartbeat = |age: i64| BotHeartbeat {
            id: HEARTBEAT_ID.to_string(),
            last_seen: now - chrono::Duration::seconds(age),
            bot_version: Some("1.2.0".to_string()),
            details: Value::Null,
        };
        let threshold = Duration::from_secs(300);

        let fresh = BotStatus::evaluate(Some(&heartbeat(30)), now, threshold);
        assert_eq!(fresh.state, BotState::Online);
        assert_eq!(fresh.seconds_since, Some(30));

        let edge = BotStatus::evaluate(Some(&heartbeat(300)), now, threshold);
        assert_eq!(edge.state, BotState::Online);

        let stale = BotStatus::evaluate(Some(&heartbeat(301)), now, threshold);
        assert_eq!(stale.state, BotState::Offline);

        let never = BotStatus::evaluate(None, now, threshold);
        assert_eq!(never.state, BotState::Unknown);
    }

    #[tokio::test]
    async fn heartbeat_marks_the_bot_online() {
        let store = Store::in_memory();
        let threshold = Duration::from_secs(300);
        assert_eq!(
            bot_status(&store, threshold).await.unwrap().state,
            BotState::Unknown
        );

        record_heartbeat(&store, HeartbeatReport::default()).await.unwrap();
        assert_eq!(
            bot_status(&store, threshold).await.unwrap().state,
            BotState::Online
        );
    }
}
