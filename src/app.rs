use axum::{
    Json, Router,
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::activity::{self, LogQuery};
use crate::backup;
use crate::botconfig;
use crate::config::Config;
use crate::error::AppError;
use crate::export;
use crate::idcard::{self, IdCardRenderer};
use crate::login;
use crate::mailer::{self, MailTransport, Outbox, SmtpMailer};
use crate::participant;
use crate::sponsor::{self, Sponsor};
use crate::storage::{HttpObjectStore, LocalObjectStore, ObjectStore};
use crate::store::Store;
use crate::templates::Templates;

/// Shared handles available to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub mailer: Arc<dyn MailTransport>,
    pub objects: Arc<dyn ObjectStore>,
    pub templates: Arc<Templates>,
    pub idcards: Arc<IdCardRenderer>,
}

impl AppState {
    /// Open the store and build the mail, storage and badge backends the
    /// configuration asks for
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        let store = Store::open(&config.data_dir)?;

        let mailer: Arc<dyn MailTransport> = match &config.smtp {
            Some(smtp) => {
                info!(host = %smtp.host, port = smtp.port, "SMTP transport configured");
                Arc::new(SmtpMailer::new(smtp, &config.mail_from)?)
            }
            None => Arc::new(Outbox::new()),
        };

        let objects: Arc<dyn ObjectStore> = match &config.storage_url {
            Some(url) => {
                info!(%url, "backups go to remote object storage");
                Arc::new(HttpObjectStore::new(url.clone(), config.storage_token.clone()))
            }
            None => {
                info!(dir = %config.backup_dir.display(), "backups go to a local directory");
                Arc::new(LocalObjectStore::new(config.backup_dir.clone()))
            }
        };

        Self::with_backends(config, store, mailer, objects)
    }

    /// Assemble a state around explicit backends
    pub fn with_backends(
        config: Config,
        store: Store,
        mailer: Arc<dyn MailTransport>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self, AppError> {
        let idcards = IdCardRenderer::from_config(&config.idcard)?;
        Ok(AppState {
            config: Arc::new(config),
            store,
            mailer,
            objects,
            templates: Arc::new(Templates::new()?),
            idcards: Arc::new(idcards),
        })
    }
}

/// Wrap handler output in the `{ "success": true, "data": ... }` envelope
pub fn success<T: Serialize>(data: T) -> Result<Json<Value>, AppError> {
    let data = serde_json::to_value(data)
        .map_err(|e| AppError::Internal(format!("Failed to encode response: {e}")))?;
    Ok(Json(json!({ "success": true, "data": data })))
}

/// Build the complete router
pub fn router(state: AppState) -> Router {
    let session = middleware::from_fn_with_state(state.clone(), login::require_auth);
    let service = middleware::from_fn_with_state(state.clone(), login::require_service_secret);

    let pages = Router::new()
        .route("/dashboard", get(login::serve_dashboard_page))
        .route_layer(session.clone());

    let api = Router::new()
        .route("/api/auth/me", get(login::handle_me))
        .route("/api/auth/password", post(login::handle_change_password))
        .route("/api/dashboard", get(handle_dashboard))
        // Participants
        .route(
            "/api/participants",
            get(participant::handle_list_participants).post(participant::handle_create_participant),
        )
        .route("/api/participants/import", post(participant::handle_import_participants))
        .route("/api/participants/stats", get(participant::handle_participant_stats))
        .route(
            "/api/participants/:id",
            get(participant::handle_get_participant)
                .patch(participant::handle_update_participant)
                .delete(participant::handle_delete_participant),
        )
        .route("/api/participants/:id/checkin", post(participant::handle_check_in))
        .route("/api/participants/:id/checkout", post(participant::handle_check_out))
        .route("/api/participants/:id/wifi", post(participant::handle_generate_wifi))
        .route("/api/export/participants.csv", get(export::handle_export_csv))
        .route("/api/export/participants.xlsx", get(export::handle_export_xlsx))
        // Sponsors
        .route(
            "/api/sponsors",
            get(sponsor::handle_list_sponsors).post(sponsor::handle_create_sponsor),
        )
        .route(
            "/api/sponsors/:id",
            get(sponsor::handle_get_sponsor)
                .put(sponsor::handle_update_sponsor)
                .delete(sponsor::handle_delete_sponsor),
        )
        // Bot
        .route(
            "/api/bot/config",
            get(botconfig::handle_get_config).put(botconfig::handle_replace_config),
        )
        .route("/api/bot/config/history", get(botconfig::handle_config_history))
        .route("/api/bot/config/history/:version", get(botconfig::handle_config_snapshot))
        .route(
            "/api/bot/config/history/:version/restore",
            post(botconfig::handle_restore_config),
        )
        .route("/api/bot/status", get(botconfig::handle_bot_status))
        .route("/api/logs", get(activity::handle_list_logs))
        // Mail and badges
        .route("/api/mail/send", post(mailer::handle_send_mail))
        .route("/api/mail/preview", post(mailer::handle_preview_mail))
        .route("/api/idcards/batch", post(idcard::handle_idcard_batch))
        .route("/api/idcards/:id", get(idcard::handle_idcard))
        .route_layer(session);

    let services = Router::new()
        .route(
            "/api/cron/backup",
            get(backup::handle_cron_backup).post(backup::handle_cron_backup),
        )
        .route("/api/service/heartbeat", post(botconfig::handle_heartbeat))
        .route("/api/service/logs", post(activity::handle_append_log))
        .route("/api/service/config", get(botconfig::handle_service_config))
        .route_layer(service);

    Router::new()
        .route("/", get(login::serve_index))
        .route("/login", get(login::serve_login_page))
        .route("/api/auth/login", post(login::handle_login))
        .route("/api/auth/logout", post(login::handle_logout))
        .merge(pages)
        .merge(api)
        .merge(services)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> AppError {
    AppError::NotFound("Not found".to_string())
}

/// Summary numbers for the dashboard landing view
async fn handle_dashboard(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let participants = participant::participant_stats(&state.store).await?;
    let sponsors = state.store.count(|_: &Sponsor| true).await?;
    let bot = botconfig::bot_status(&state.store, state.config.bot_offline_after).await?;
    let config_version = match botconfig::current_config(&state.store).await {
        Ok(config) => Some(config.version),
        Err(AppError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let query = LogQuery {
        limit: Some(10),
        ..Default::default()
    };
    let recent_logs = activity::recent_logs(&state.store, &query).await?;

    success(json!({
        "event": state.config.event_name,
        "participants": participants,
        "sponsors": sponsors,
        "bot": bot,
        "bot_config_version": config_version,
        "recent_logs": recent_logs,
    }))
}

/// Start the HTTP server and the backup schedule, until Ctrl+C or SIGTERM
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(config)?;
    if login::seed_admin(&state.store, &state.config).await? {
        info!("seeded admin account from ADMIN_USERNAME");
    }

    let scheduler = backup::spawn_scheduler(state.clone());

    let addr = state.config.bind_address();
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn success_wraps_data_in_the_envelope() {
        let Json(body) = success(vec![1, 2]).unwrap();
        assert_eq!(body, json!({ "success": true, "data": [1, 2] }));
    }

    #[test]
    fn unencodable_data_is_an_internal_error() {
        // JSON object keys must be strings
        let data: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        assert!(matches!(success(data), Err(AppError::Internal(_))));
    }
}
