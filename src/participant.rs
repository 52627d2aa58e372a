use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{Document, Store, StoreError};

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// A registered hackathon participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Unique identifier, also encoded in the badge QR code
    pub id: String,

    /// Full name as printed on the badge
    pub name: String,

    /// Contact address, unique across participants (case-insensitive)
    pub email: String,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub team: Option<String>,

    /// Attendance at the college gate
    #[serde(default)]
    pub college: Checkpoint,

    /// Attendance at the lab
    #[serde(default)]
    pub lab: Checkpoint,

    #[serde(default)]
    pub wifi: Option<WifiCredentials>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for Participant {
    const COLLECTION: &'static str = "participants";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Check-in/check-out flags and timestamps for one location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checked_in: bool,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_out: bool,
    pub checked_out_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Checked in and not (yet) checked out
    pub fn is_inside(&self) -> bool {
        self.checked_in && !self.checked_out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub username: String,
    pub password: String,
}

/// Places where attendance is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    College,
    Lab,
}

impl Location {
    pub fn label(self) -> &'static str {
        match self {
            Location::College => "college",
            Location::Lab => "lab",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    CheckIn,
    CheckOut,
}

impl Participant {
    pub fn checkpoint(&self, location: Location) -> &Checkpoint {
        match location {
            Location::College => &self.college,
            Location::Lab => &self.lab,
        }
    }

    fn checkpoint_mut(&mut self, location: Location) -> &mut Checkpoint {
        match location {
            Location::College => &mut self.college,
            Location::Lab => &mut self.lab,
        }
    }

    /// Apply a check-in or check-out at `location`.
    ///
    /// Checking in again after a check-out counts as re-entry and clears the
    /// check-out.
    ///
    /// # Errors
    /// * `StoreError::Conflict` when checking in while already inside, or
    ///   checking out without being inside
    pub fn record(
        &mut self,
        location: Location,
        movement: Movement,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let name = self.name.clone();
        let checkpoint = self.checkpoint_mut(location);

        match movement {
            Movement::CheckIn => {
                if checkpoint.is_inside() {
                    return Err(StoreError::Conflict(format!(
                        "{name} is already checked in at the {}",
                        location.label()
                    )));
                }
                checkpoint.checked_in = true;
                checkpoint.checked_in_at = Some(now);
                checkpoint.checked_out = false;
                checkpoint.checked_out_at = None;
            }
            Movement::CheckOut => {
                if !checkpoint.checked_in {
                    return Err(StoreError::Conflict(format!(
                        "{name} has not checked in at the {}",
                        location.label()
                    )));
                }
                if checkpoint.checked_out {
                    return Err(StoreError::Conflict(format!(
                        "{name} has already checked out of the {}",
                        location.label()
                    )));
                }
                checkpoint.checked_out = true;
                checkpoint.checked_out_at = Some(now);
            }
        }

        self.updated_at = now;
        Ok(())
    }

    fn matches(&self, query: &ParticipantQuery) -> bool {
        if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let needle = q.to_lowercase();
            let hit = self.name.to_lowercase().contains(&needle)
                || self.email.to_lowercase().contains(&needle)
                || self
                    .team
                    .as_deref()
                    .is_some_and(|team| team.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }

        if let Some(team) = query.team.as_deref() {
            if !self
                .team
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(team))
            {
                return false;
            }
        }

        if let Some(location) = query.inside {
            if !self.checkpoint(location).is_inside() {
                return false;
            }
        }

        true
    }
}

/// Fields accepted when registering a participant
#[derive(Debug, Clone, Deserialize)]
pub struct NewParticipant {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub wifi: Option<WifiCredentials>,
}

/// Partial update; absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParticipantPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub team: Option<String>,
    pub wifi: Option<WifiCredentials>,
}

/// Filters for the participant listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParticipantQuery {
    /// Free-text match on name, email or team
    pub q: Option<String>,
    pub team: Option<String>,
    /// Only participants currently inside this location
    pub inside: Option<Location>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointStats {
    pub checked_in: usize,
    pub checked_out: usize,
    pub inside: usize,
}

/// Aggregate attendance counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParticipantStats {
    pub total: usize,
    pub college: CheckpointStats,
    pub lab: CheckpointStats,
    pub with_wifi: usize,
}

impl ParticipantStats {
    pub fn from_participants(participants: &[Participant]) -> Self {
        let mut stats = ParticipantStats {
            total: participants.len(),
            ..Default::default()
        };

        for participant in participants {
            for (checkpoint, counts) in [
                (&participant.college, &mut stats.college),
                (&participant.lab, &mut stats.lab),
            ] {
                counts.checked_in += usize::from(checkpoint.checked_in);
                counts.checked_out += usize::from(checkpoint.checked_out);
                counts.inside += usize::from(checkpoint.is_inside());
            }
            stats.with_wifi += usize::from(participant.wifi.is_some());
        }

        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub skipped: Vec<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Name cannot be empty".to_string()));
    }
    Ok(name.to_string())
}

fn validate_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    if !EMAIL_REGEX.is_match(&email) {
        return Err(AppError::BadRequest(format!("{email:?} is not a valid email address")));
    }
    Ok(email)
}

fn build(input: NewParticipant, now: DateTime<Utc>) -> Result<Participant, AppError> {
    Ok(Participant {
        id: Uuid::new_v4().to_string(),
        name: validate_name(&input.name)?,
        email: validate_email(&input.email)?,
        phone: clean(input.phone),
        team: clean(input.team),
        college: Checkpoint::default(),
        lab: Checkpoint::default(),
        wifi: input.wifi,
        created_at: now,
        updated_at: now,
    })
}

fn email_taken(participants: &[Participant], email: &str, except: Option<&str>) -> bool {
    participants
        .iter()
        .any(|p| p.email.eq_ignore_ascii_case(email) && Some(p.id.as_str()) != except)
}

/// Register a participant.
///
/// # Errors
/// * `AppError::BadRequest` for an empty name or malformed email
/// * `AppError::Conflict` if the email is already registered
pub async fn create_participant(
    store: &Store,
    input: NewParticipant,
) -> Result<Participant, AppError> {
    let participant = build(input, Utc::now())?;

    let created = store
        .write(|txn| {
            if email_taken(&txn.list::<Participant>()?, &participant.email, None) {
                return Err(StoreError::Conflict(format!(
                    "{} is already registered",
                    participant.email
                )));
            }
            txn.insert(participant.clone())
        })
        .await?;

    Ok(created)
}

/// Register many participants at once, skipping emails that already exist.
///
/// Every entry is validated before anything is written.
pub async fn import_participants(
    store: &Store,
    inputs: Vec<NewParticipant>,
) -> Result<ImportReport, AppError> {
    let now = Utc::now();
    let candidates = inputs
        .into_iter()
        .map(|input| build(input, now))
        .collect::<Result<Vec<_>, _>>()?;

    let report = store
        .write(|txn| {
            let mut existing = txn.list::<Participant>()?;
            let mut report = ImportReport::default();

            for participant in candidates {
                if email_taken(&existing, &participant.email, None) {
                    report.skipped.push(participant.email);
                    continue;
                }
                existing.push(txn.insert(participant)?);
                report.inserted += 1;
            }
            Ok(report)
        })
        .await?;

    Ok(report)
}

pub async fn list_participants(
    store: &Store,
    query: &ParticipantQuery,
) -> Result<Vec<Participant>, AppError> {
    let mut participants = store.find(|p: &Participant| p.matches(query)).await?;
    participants.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(participants)
}

pub async fn get_participant(store: &Store, id: &str) -> Result<Participant, AppError> {
    store
        .get::<Participant>(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Participant {id} not found")))
}

pub async fn update_participant(
    store: &Store,
    id: &str,
    patch: ParticipantPatch,
) -> Result<Participant, AppError> {
    let name = patch.name.as_deref().map(validate_name).transpose()?;
    let email = patch.email.as_deref().map(validate_email).transpose()?;

    let updated = store
        .write(|txn| {
            if let Some(email) = email.as_deref() {
                if email_taken(&txn.list::<Participant>()?, email, Some(id)) {
                    return Err(StoreError::Conflict(format!("{email} is already registered")));
                }
            }

            txn.update(id, |participant: &mut Participant| {
                if let Some(name) = name {
                    participant.name = name;
                }
                if let Some(email) = email {
                    participant.email = email;
                }
                if patch.phone.is_some() {
                    participant.phone = clean(patch.phone);
                }
                if patch.team.is_some() {
                    participant.team = clean(patch.team);
                }
                if patch.wifi.is_some() {
                    participant.wifi = patch.wifi;
                }
                participant.updated_at = Utc::now();
                Ok(participant.clone())
            })
        })
        .await?;

    Ok(updated)
}

pub async fn delete_participant(store: &Store, id: &str) -> Result<Participant, AppError> {
    Ok(store.remove::<Participant>(id).await?)
}

/// Record a check-in or check-out and return the updated participant
pub async fn record_movement(
    store: &Store,
    id: &str,
    location: Location,
    movement: Movement,
) -> Result<Participant, AppError> {
    let participant = store
        .update(id, |participant: &mut Participant| {
            participant.record(location, movement, Utc::now())?;
            Ok(participant.clone())
        })
        .await?;

    Ok(participant)
}

pub async fn participant_stats(store: &Store) -> Result<ParticipantStats, AppError> {
    let participants = store.list::<Participant>().await?;
    Ok(ParticipantStats::from_participants(&participants))
}

// Web handler functions below (only compiled with "web" feature)

#[cfg(feature = "web")]
pub use web::*;

#[cfg(feature = "web")]
mod web {
    use axum::{
        Json,
        extract::{Path, Query, State},
        response::IntoResponse,
    };
    use rand::Rng;
    use serde::Deserialize;

    use super::*;
    use crate::app::{AppState, success};

    const WIFI_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789";

    /// Body of the check-in / check-out endpoints
    #[derive(Debug, Deserialize)]
    pub struct MovementRequest {
        pub location: Location,
    }

    /// Body of the Wi-Fi credential generator; a username derived from the
    /// participant's email is used when none is given
    #[derive(Debug, Default, Deserialize)]
    pub struct WifiRequest {
        pub username: Option<String>,
    }

    /// Generate a random Wi-Fi password
    pub fn generate_wifi_password() -> String {
        let mut rng = rand::thread_rng();

        (0..10)
            .map(|_| {
                let idx = rng.gen_range(0..WIFI_CHARSET.len());
                WIFI_CHARSET[idx] as char
            })
            .collect()
    }

    pub async fn handle_list_participants(
        State(state): State<AppState>,
        Query(query): Query<ParticipantQuery>,
    ) -> Result<impl IntoResponse, AppError> {
        success(list_participants(&state.store, &query).await?)
    }

    pub async fn handle_create_participant(
        State(state): State<AppState>,
        Json(input): Json<NewParticipant>,
    ) -> Result<impl IntoResponse, AppError> {
        let participant = create_participant(&state.store, input).await?;
        tracing::info!(id = %participant.id, email = %participant.email, "participant registered");
        success(participant)
    }

    pub async fn handle_import_participants(
        State(state): State<AppState>,
        Json(inputs): Json<Vec<NewParticipant>>,
    ) -> Result<impl IntoResponse, AppError> {
        let report = import_participants(&state.store, inputs).await?;
        tracing::info!(
            inserted = report.inserted,
            skipped = report.skipped.len(),
            "participants imported"
        );
        success(report)
    }

    pub async fn handle_participant_stats(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(participant_stats(&state.store).await?)
    }

    pub async fn handle_get_participant(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse, AppError> {
        success(get_participant(&state.store, &id).await?)
    }

    pub async fn handle_update_participant(
        State(state): State<AppState>,
        Path(id): Path<String>,
        Json(patch): Json<ParticipantPatch>,
    ) -> Result<impl IntoResponse, AppError> {
        success(update_participant(&state.store, &id, patch).await?)
    }

    pub async fn handle_delete_participant(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse, AppError> {
        let removed = delete_participant(&state.store, &id).await?;
        tracing::info!(id = %removed.id, "participant deleted");
        success(removed)
    }

    pub async fn handle_check_in(
        State(state): State<AppState>,
        Path(id): Path<String>,
        Json(request): Json<MovementRequest>,
    ) -> Result<impl IntoResponse, AppError> {
        let participant =
            record_movement(&state.store, &id, request.location, Movement::CheckIn).await?;
        tracing::info!(id = %id, location = request.location.label(), "checked in");
        success(participant)
    }

    pub async fn handle_check_out(
        State(state): State<AppState>,
        Path(id): Path<String>,
        Json(request): Json<MovementRequest>,
    ) -> Result<impl IntoResponse, AppError> {
        let participant =
            record_movement(&state.store, &id, request.location, Movement::CheckOut).await?;
        tracing::info!(id = %id, location = request.location.label(), "checked out");
        success(participant)
    }

    pub async fn handle_generate_wifi(
        State(state): State<AppState>,
        Path(id): Path<String>,
        body: Option<Json<WifiRequest>>,
    ) -> Result<impl IntoResponse, AppError> {
        let request = body.map(|Json(request)| request).unwrap_or_default();
        let password = generate_wifi_password();

        let participant = state
            .store
            .update(&id, |participant: &mut Participant| {
                let username = clean(request.username)
                    .unwrap_or_else(|| wifi_username_for(&participant.email));
                participant.wifi = Some(WifiCredentials { username, password });
                participant.updated_at = Utc::now();
                Ok(participant.clone())
            })
            .await?;

        success(participant)
    }

    /// Email local part without any `+tag`, or `participant` when nothing usable is left
    fn wifi_username_for(email: &str) -> String {
        let local = email.split(['@', '+']).next().unwrap_or_default();
        let username: String = local
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_')
            .collect();

        if username.is_empty() {
            "participant".to_string()
        } else {
            username.to_ascii_lowercase()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn wifi_passwords_use_the_unambiguous_charset() {
            let password = generate_wifi_password();
            assert_eq!(password.len(), 10);
            assert!(password.bytes().all(|b| WIFI_CHARSET.contains(&b)));
        }

        #[test]
        fn wifi_username_comes_from_the_email_local_part() {
            assert_eq!(wifi_username_for("Ada.Lovelace+hack@example.org"), "ada.lovelace");
            assert_eq!(wifi_username_for("grace_h@example.org"), "grace_h");
        }

        #[test]
        fn wifi_username_falls_back_when_local_part_is_unusable() {
            assert_eq!(wifi_username_for("+tag@example.org"), "participant");
            assert_eq!(wifi_username_for("åäö@example.org"), "participant");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new(name: &str, email: &str) -> NewParticipant {
        NewParticipant {
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
            team: Some("Rustaceans".to_string()),
            wifi: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = Store::in_memory();
        create_participant(&store, new("Ada", "ada@example.org")).await.unwrap();

        let err = create_participant(&store, new("Ada Again", "ADA@example.org"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let store = Store::in_memory();
        assert!(matches!(
            create_participant(&store, new("  ", "a@example.org")).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            create_participant(&store, new("Ada", "not-an-email")).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn check_in_and_out_follow_the_attendance_rules() {
        let store = Store::in_memory();
        let ada = create_participant(&store, new("Ada", "ada@example.org")).await.unwrap();

        // Cannot leave before arriving
        assert!(matches!(
            record_movement(&store, &ada.id, Location::Lab, Movement::CheckOut).await,
            Err(AppError::Conflict(_))
        ));

        let inside = record_movement(&store, &ada.id, Location::College, Movement::CheckIn)
            .await
            .unwrap();
        assert!(inside.college.is_inside());
        assert!(inside.college.checked_in_at.is_some());
        assert!(!inside.lab.checked_in);

        assert!(matches!(
            record_movement(&store, &ada.id, Location::College, Movement::CheckIn).await,
            Err(AppError::Conflict(_))
        ));

        let out = record_movement(&store, &ada.id, Location::College, Movement::CheckOut)
            .await
            .unwrap();
        assert!(out.college.checked_out);
        assert!(matches!(
            record_movement(&store, &ada.id, Location::College, Movement::CheckOut).await,
            Err(AppError::Conflict(_))
        ));

        // Re-entry clears the check-out
        let back = record_movement(&store, &ada.id, Location::College, Movement::CheckIn)
            .await
            .unwrap();
        assert!(back.college.is_inside());
        assert!(back.college.checked_out_at.is_none());
    }

    #[tokio::test]
    async fn unknown_participant_is_not_found() {
        let store = Store::in_memory();
        assert!(matches!(
            record_movement(&store, "missing", Location::Lab, Movement::CheckIn).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            get_participant(&store, "missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn import_skips_known_addresses() {
        let store = Store::in_memory();
        create_participant(&store, new("Ada", "ada@example.org")).await.unwrap();

        let report = import_participants(
            &store,
            vec![
                new("Ada", "ada@example.org"),
                new("Grace", "grace@example.org"),
                new("Grace Twin", "grace@example.org"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, vec!["ada@example.org", "grace@example.org"]);
        assert_eq!(store.list::<Participant>().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn listing_filters_and_stats_agree() {
        let store = Store::in_memory();
        let ada = create_participant(&store, new("Ada", "ada@example.org")).await.unwrap();
        let mut grace = new("Grace", "grace@example.org");
        grace.team = Some("Compilers".to_string());
        create_participant(&store, grace).await.unwrap();

        record_movement(&store, &ada.id, Location::Lab, Movement::CheckIn).await.unwrap();

        let inside = list_participants(
            &store,
            &ParticipantQuery {
                inside: Some(Location::Lab),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].name, "Ada");

        let compilers = list_participants(
            &store,
            &ParticipantQuery {
                q: Some("compil".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(compilers.len(), 1);
        assert_eq!(compilers[0].name, "Grace");

        let stats = participant_stats(&store).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.lab.inside, 1);
        assert_eq!(stats.college.checked_in, 0);
    }

    #[tokio::test]
    async fn updating_to_a_taken_email_is_a_conflict() {
        let store = Store::in_memory();
        create_participant(&store, new("Ada", "ada@example.org")).await.unwrap();
        let grace = create_participant(&store, new("Grace", "grace@example.org"))
            .await
            .unwrap();

        let err = update_participant(
            &store,
            &grace.id,
            ParticipantPatch {
                email: Some("ada@example.org".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let renamed = update_participant(
            &store,
            &grace.id,
            ParticipantPatch {
                name: Some("Grace Hopper".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(renamed.name, "Grace Hopper");
        assert_eq!(renamed.email, "grace@example.org");
    }
}
