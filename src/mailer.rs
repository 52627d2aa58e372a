use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{SmtpConfig, SmtpTls};
use crate::error::AppError;
use crate::participant::{self, Location, Participant, ParticipantQuery};
use crate::store::Store;
use crate::templates::MailTemplate;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address {0:?}")]
    Address(String),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP failure: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// A rendered HTML email ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Anything that can deliver an [`OutgoingEmail`]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: OutgoingEmail) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    smtp: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, from: &str) -> Result<Self, MailError> {
        let builder = match config.tls {
            SmtpTls::Wrapper => {
                let tls_parameters = TlsParameters::new(config.host.clone())?;
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
                    .tls(Tls::Wrapper(tls_parameters))
            }
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        let mut builder = builder.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        // Fail on bad sender addresses at startup rather than on first send
        from.parse::<lettre::message::Mailbox>()
            .map_err(|_| MailError::Address(from.to_string()))?;

        Ok(SmtpMailer {
            smtp: builder.build(),
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn deliver(&self, email: OutgoingEmail) -> Result<(), MailError> {
        let message = Message::builder()
            .from(
                self.from
                    .parse()
                    .map_err(|_| MailError::Address(self.from.clone()))?,
            )
            .to(email
                .to
                .parse()
                .map_err(|_| MailError::Address(email.to.clone()))?)
            .subject(email.subject)
            .header(ContentType::TEXT_HTML)
            .body(email.html)?;

        self.smtp.send(message).await?;
        Ok(())
    }
}

/// Keeps every message in memory instead of sending it.
///
/// Used when no SMTP server is configured, and by tests.
#[derive(Default)]
pub struct Outbox {
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MailTransport for Outbox {
    async fn deliver(&self, email: OutgoingEmail) -> Result<(), MailError> {
        if email.to.parse::<lettre::Address>().is_err() {
            return Err(MailError::Address(email.to));
        }

        info!(to = %email.to, subject = %email.subject, "mail captured (SMTP not configured)");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email);
        }
        Ok(())
    }
}

/// Who a bulk mail goes to
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecipientSelector {
    All,
    Inside { location: Location },
    Participants { ids: Vec<String> },
    Addresses { emails: Vec<String> },
}

/// Placeholder values available to bulk mail templates
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecipientContext {
    pub email: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
}

impl RecipientContext {
    pub fn for_participant(participant: &Participant, event: &str) -> Self {
        RecipientContext {
            email: participant.email.clone(),
            event: event.to_string(),
            name: Some(participant.name.clone()),
            team: participant.team.clone(),
            phone: participant.phone.clone(),
            wifi_username: participant.wifi.as_ref().map(|w| w.username.clone()),
            wifi_password: participant.wifi.as_ref().map(|w| w.password.clone()),
        }
    }

    /// Stand-in values for previews without a participant
    pub fn placeholder(event: &str) -> Self {
        RecipientContext {
            email: "ada@example.org".to_string(),
            event: event.to_string(),
            name: Some("Ada Lovelace".to_string()),
            team: Some("Analytical Engines".to_string()),
            phone: Some("+44 20 7946 0000".to_string()),
            wifi_username: Some("ada".to_string()),
            wifi_password: Some("k7q2m9x4tp".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedDelivery {
    pub email: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub sent: usize,
    pub failed: Vec<FailedDelivery>,
}

/// Expand a selector into one template context per recipient
pub async fn resolve_recipients(
    store: &Store,
    selector: &RecipientSelector,
    event: &str,
) -> Result<Vec<RecipientContext>, AppError> {
    let recipients: Vec<RecipientContext> = match selector {
        RecipientSelector::All => {
            participant::list_participants(store, &ParticipantQuery::default())
                .await?
                .iter()
                .map(|p| RecipientContext::for_participant(p, event))
                .collect()
        }
        RecipientSelector::Inside { location } => {
            let query = ParticipantQuery {
                inside: Some(*location),
                ..Default::default()
            };
            participant::list_participants(store, &query)
                .await?
                .iter()
                .map(|p| RecipientContext::for_participant(p, event))
                .collect()
        }
        RecipientSelector::Participants { ids } => {
            let mut recipients = Vec::with_capacity(ids.len());
            for id in ids {
                let participant = participant::get_participant(store, id).await?;
                recipients.push(RecipientContext::for_participant(&participant, event));
            }
            recipients
        }
        RecipientSelector::Addresses { emails } => emails
            .iter()
            .map(|email| email.trim())
            .filter(|email| !email.is_empty())
            .map(|email| RecipientContext {
                email: email.to_string(),
                event: event.to_string(),
                ..Default::default()
            })
            .collect(),
    };

    if recipients.is_empty() {
        return Err(AppError::BadRequest("No recipients selected".to_string()));
    }
    Ok(recipients)
}

/// Render and deliver one message per recipient.
///
/// A failing recipient is recorded in the report and the batch carries on.
pub async fn send_bulk(
    transport: &dyn MailTransport,
    template: &MailTemplate,
    recipients: &[RecipientContext],
) -> BulkReport {
    let mut report = BulkReport::default();

    for recipient in recipients {
        let outcome = match template.render(recipient) {
            Ok((subject, html)) => transport
                .deliver(OutgoingEmail {
                    to: recipient.email.clone(),
                    subject,
                    html,
                })
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => report.sent += 1,
            Err(error) => {
                warn!(to = %recipient.email, %error, "bulk mail delivery failed");
                report.failed.push(FailedDelivery {
                    email: recipient.email.clone(),
                    error,
                });
            }
        }
    }

    report
}

// Web handler functions below

pub use web::*;

mod web {
    use axum::{Json, extract::State, response::IntoResponse};
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::activity::{self, LogLevel, NewLogEntry};
    use crate::app::{AppState, success};

    #[derive(Debug, Deserialize)]
    pub struct SendMailRequest {
        pub subject: String,
        pub body: String,
        pub recipients: RecipientSelector,
    }

    #[derive(Debug, Deserialize)]
    pub struct PreviewMailRequest {
        pub subject: String,
        pub body: String,
        #[serde(default)]
        pub participant_id: Option<String>,
    }

    pub async fn handle_send_mail(
        State(state): State<AppState>,
        Json(request): Json<SendMailRequest>,
    ) -> Result<impl IntoResponse, AppError> {
        // Broken templates are rejected before anything goes out
        let template = MailTemplate::compile(&request.subject, &request.body)?;
        let recipients =
            resolve_recipients(&state.store, &request.recipients, &state.config.event_name).await?;

        let report = send_bulk(state.mailer.as_ref(), &template, &recipients).await;
        info!(sent = report.sent, failed = report.failed.len(), "bulk mail finished");

        activity::append_log(
            &state.store,
            NewLogEntry {
                level: if report.failed.is_empty() {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                },
                source: "mail".to_string(),
                message: format!(
                    "Bulk mail sent to {} recipients, {} failed",
                    report.sent,
                    report.failed.len()
                ),
                meta: Some(json!({ "subject": request.subject })),
            },
        )
        .await?;

        success(report)
    }

    pub async fn handle_preview_mail(
        State(state): State<AppState>,
        Json(request): Json<PreviewMailRequest>,
    ) -> Result<impl IntoResponse, AppError> {
        let template = MailTemplate::compile(&request.subject, &request.body)?;
        let event = &state.config.event_name;

        let context = match request.participant_id.as_deref() {
            Some(id) => {
                let participant = participant::get_participant(&state.store, id).await?;
                RecipientContext::for_participant(&participant, event)
            }
            None => RecipientContext::placeholder(event),
        };

        let (subject, html) = template.render(&context)?;
        success(json!({ "subject": subject, "html": html }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutgoingEmail {
        OutgoingEmail {
            to: to.to_string(),
            subject: "Welcome".to_string(),
            html: "<p>Hi</p>".to_string(),
        }
    }

    #[tokio::test]
    async fn outbox_keeps_delivered_messages() {
        let outbox = Outbox::new();
        outbox.deliver(email("ada@example.org")).await.unwrap();
        assert_eq!(outbox.sent(), vec![email("ada@example.org")]);
    }

    #[tokio::test]
    async fn outbox_rejects_malformed_addresses() {
        let outbox = Outbox::new();
        assert!(matches!(
            outbox.deliver(email("not an address")).await,
            Err(MailError::Address(_))
        ));
        assert!(outbox.sent().is_empty());
    }

    #[tokio::test]
    async fn smtp_mailer_rejects_a_bad_sender() {
        let config = SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            username: None,
            password: None,
            tls: SmtpTls::None,
        };
        assert!(SmtpMailer::new(&config, "not a mailbox").is_err());
        assert!(SmtpMailer::new(&config, "Ops <ops@example.org>").is_ok());
    }

    #[tokio::test]
    async fn one_bad_recipient_does_not_stop_the_batch() {
        let outbox = Outbox::new();
        let template = MailTemplate::compile("Hi {{name}}", "<p>{{event}}</p>").unwrap();
        let recipients = vec![
            RecipientContext {
                email: "ada@example.org".to_string(),
                event: "HackNight".to_string(),
                name: Some("Ada".to_string()),
                ..Default::default()
            },
            RecipientContext {
                email: "broken".to_string(),
                event: "HackNight".to_string(),
                ..Default::default()
            },
            RecipientContext {
                email: "grace@example.org".to_string(),
                event: "HackNight".to_string(),
                name: Some("Grace".to_string()),
                ..Default::default()
            },
        ];

        let report = send_bulk(&outbox, &template, &recipients).await;

        assert_eq!(report.sent, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].email, "broken");
        let sent = outbox.sent();
        assert_eq!(sent[0].subject, "Hi Ada");
        assert_eq!(sent[1].html, "<p>HackNight</p>");
    }

    #[tokio::test]
    async fn address_lists_ignore_blank_entries() {
        let store = Store::in_memory();
        let selector = RecipientSelector::Addresses {
            emails: vec!["ops@example.org".to_string(), "  ".to_string()],
        };
        let recipients = resolve_recipients(&store, &selector, "HackNight").await.unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].name, None);
    }

    #[tokio::test]
    async fn empty_selections_are_rejected() {
        let store = Store::in_memory();
        assert!(matches!(
            resolve_recipients(&store, &RecipientSelector::All, "HackNight").await,
            Err(AppError::BadRequest(_))
        ));
    }
}
