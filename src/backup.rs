//! Participant backups: CSV export, upload, activity log and report mail.
//!
//! A run is triggered by the interval task started with the server, by the
//! cron endpoint, or by `hackdesk-admin backup`.

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::activity::{self, ActivityLog, LogLevel, LogQuery, NewLogEntry};
use crate::app::AppState;
use crate::botconfig::{self, BotState, BotStatus};
use crate::error::AppError;
use crate::export::participants_csv;
use crate::mailer::OutgoingEmail;
use crate::participant::{Participant, ParticipantStats};
use crate::templates::BACKUP_REPORT;

const SOURCE: &str = "backup";
const REPORT_LOG_ENTRIES: usize = 20;

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupOutcome {
    pub key: String,
    pub location: String,
    pub rows: usize,
    pub bytes: usize,
    pub report_sent: bool,
}

/// Object key for a backup taken at `at`
pub fn backup_key(prefix: &str, at: DateTime<Utc>, gzip: bool) -> String {
    let file = format!(
        "participants-{}.csv{}",
        at.format("%Y%m%d-%H%M%S"),
        if gzip { ".gz" } else { "" }
    );
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file
    } else {
        format!("{prefix}/{file}")
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

struct Upload {
    key: String,
    location: String,
    rows: usize,
    bytes: usize,
}

async fn upload_participants(state: &AppState, at: DateTime<Utc>) -> Result<Upload, AppError> {
    let participants = state.store.list::<Participant>().await?;
    let csv = participants_csv(&participants).into_bytes();

    let gzip_enabled = state.config.backup_gzip;
    let (body, content_type) = if gzip_enabled {
        let compressed = gzip(&csv).map_err(|e| AppError::Internal(e.to_string()))?;
        (compressed, "application/gzip")
    } else {
        (csv, "text/csv; charset=utf-8")
    };

    let key = backup_key(&state.config.backup_prefix, at, gzip_enabled);
    let bytes = body.len();
    let location = state.objects.put(&key, body, content_type).await?;

    Ok(Upload {
        key,
        location,
        rows: participants.len(),
        bytes,
    })
}

/// Run one backup and mail the report.
///
/// Failures are logged as an `error` entry and reported as FAILED before the
/// error is returned.
pub async fn run_backup(state: &AppState) -> Result<BackupOutcome, AppError> {
    let started = Utc::now();
    info!("backup started");

    match upload_participants(state, started).await {
        Ok(upload) => {
            info!(key = %upload.key, rows = upload.rows, bytes = upload.bytes, "backup uploaded");
            log_entry(
                state,
                LogLevel::Info,
                format!("Backed up {} participants to {}", upload.rows, upload.location),
                json!({ "key": upload.key, "bytes": upload.bytes }),
            )
            .await;

            let report_sent = send_report(state, started, Ok(&upload)).await;
            Ok(BackupOutcome {
                key: upload.key,
                location: upload.location,
                rows: upload.rows,
                bytes: upload.bytes,
                report_sent,
            })
        }
        Err(err) => {
            error!(error = %err, "backup failed");
            log_entry(
                state,
                LogLevel::Error,
                format!("Backup failed: {err}"),
                json!({}),
            )
            .await;

            send_report(state, started, Err(&err)).await;
            Err(err)
        }
    }
}

async fn log_entry(state: &AppState, level: LogLevel, message: String, meta: serde_json::Value) {
    let entry = NewLogEntry {
        level,
        source: SOURCE.to_string(),
        message,
        meta: Some(meta),
    };
    if let Err(e) = activity::append_log(&state.store, entry).await {
        warn!(error = %e, "could not record backup log entry");
    }
}

#[derive(Serialize)]
struct BotBadge {
    label: &'static str,
    online: bool,
    last_seen: String,
}

impl From<&BotStatus> for BotBadge {
    fn from(status: &BotStatus) -> Self {
        BotBadge {
            label: status.state.label(),
            online: status.state == BotState::Online,
            last_seen: status
                .last_seen
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        }
    }
}

#[derive(Serialize)]
struct ReportContext<'a> {
    event: &'a str,
    status: &'static str,
    success: bool,
    generated_at: String,
    location: String,
    rows: usize,
    error: String,
    bot: BotBadge,
    stats: ParticipantStats,
    entries: Vec<ActivityLog>,
}

/// Mail the HTML report; returns whether it reached every recipient
async fn send_report(
    state: &AppState,
    started: DateTime<Utc>,
    result: Result<&Upload, &AppError>,
) -> bool {
    let recipients = &state.config.report_recipients;
    if recipients.is_empty() {
        debug!("no report recipients configured");
        return false;
    }

    // The report goes out even when the store is unreadable
    let stats = crate::participant::participant_stats(&state.store)
        .await
        .unwrap_or_default();
    let bot = botconfig::bot_status(&state.store, state.config.bot_offline_after)
        .await
        .unwrap_or_else(|_| BotStatus::evaluate(None, Utc::now(), state.config.bot_offline_after));
    let query = LogQuery {
        limit: Some(REPORT_LOG_ENTRIES),
        ..Default::default()
    };
    let entries = activity::recent_logs(&state.store, &query)
        .await
        .unwrap_or_default();

    let status = if result.is_ok() { "SUCCESS" } else { "FAILED" };
    let context = ReportContext {
        event: &state.config.event_name,
        status,
        success: result.is_ok(),
        generated_at: started.to_rfc3339(),
        location: result.map(|u| u.location.clone()).unwrap_or_default(),
        rows: result.map(|u| u.rows).unwrap_or_default(),
        error: result.err().map(|e| e.to_string()).unwrap_or_default(),
        bot: BotBadge::from(&bot),
        stats,
        entries,
    };

    let html = match state.templates.render(BACKUP_REPORT, &context) {
        Ok(html) => html,
        Err(e) => {
            error!(error = %e, "backup report did not render");
            return false;
        }
    };
    let subject = format!("[{}] Backup {status}", state.config.event_name);

    let mut delivered = true;
    for to in recipients {
        let email = OutgoingEmail {
            to: to.clone(),
            subject: subject.clone(),
            html: html.clone(),
        };
        if let Err(e) = state.mailer.deliver(email).await {
            warn!(%to, error = %e, "backup report delivery failed");
            delivered = false;
        }
    }
    delivered
}

/// Start the periodic backup task, if an interval is configured.
///
/// The first run happens one interval after startup.
pub fn spawn_scheduler(state: AppState) -> Option<JoinHandle<()>> {
    let period = state.config.backup_interval?;
    info!(minutes = period.as_secs() / 60, "backup schedule enabled");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Failures are already logged and reported by run_backup
            let _ = run_backup(&state).await;
        }
    }))
}

pub use web::*;

mod web {
    use axum::{extract::State, response::IntoResponse};

    use super::*;
    use crate::app::success;

    /// Cron trigger (bearer-authenticated)
    pub async fn handle_cron_backup(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(run_backup(&state).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn keys_carry_prefix_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 7).unwrap();
        assert_eq!(
            backup_key("backups", at, false),
            "backups/participants-20260314-090507.csv"
        );
        assert_eq!(
            backup_key("/nightly/", at, true),
            "nightly/participants-20260314-090507.csv.gz"
        );
        assert_eq!(backup_key("", at, false), "participants-20260314-090507.csv");
    }

    #[test]
    fn gzip_output_decompresses_to_the_input() {
        let compressed = gzip(b"ID,Name\n").unwrap();
        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "ID,Name\n");
    }
}
