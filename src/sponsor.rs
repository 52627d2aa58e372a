use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{Document, Store, StoreError};

/// Sponsorship level, ordered from most to least prominent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Title,
    Platinum,
    Gold,
    Silver,
    Bronze,
    Partner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sponsor {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document for Sponsor {
    const COLLECTION: &'static str = "sponsors";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Editable sponsor fields, used for both create and full update
#[derive(Debug, Clone, Deserialize)]
pub struct SponsorInput {
    pub name: String,
    pub tier: Tier,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SponsorInput {
    fn apply(self, sponsor: &mut Sponsor, name: String) {
        sponsor.name = name;
        sponsor.tier = self.tier;
        sponsor.website = trimmed(self.website);
        sponsor.logo_url = trimmed(self.logo_url);
        sponsor.contact_name = trimmed(self.contact_name);
        sponsor.contact_email = trimmed(self.contact_email);
        sponsor.notes = trimmed(self.notes);
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn name_taken(sponsors: &[Sponsor], name: &str, except: Option<&str>) -> bool {
    sponsors
        .iter()
        .any(|s| s.name.eq_ignore_ascii_case(name) && Some(s.id.as_str()) != except)
}

fn sponsor_name(input: &SponsorInput) -> Result<String, AppError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Sponsor name cannot be empty".to_string()));
    }
    Ok(name.to_string())
}

pub async fn create_sponsor(store: &Store, input: SponsorInput) -> Result<Sponsor, AppError> {
    let name = sponsor_name(&input)?;
    let now = Utc::now();

    let mut sponsor = Sponsor {
        id: Uuid::new_v4().to_string(),
        name: String::new(),
        tier: input.tier,
        website: None,
        logo_url: None,
        contact_name: None,
        contact_email: None,
        notes: None,
        created_at: now,
        updated_at: now,
    };
    input.apply(&mut sponsor, name);

    let created = store
        .write(|txn| {
            if name_taken(&txn.list::<Sponsor>()?, &sponsor.name, None) {
                return Err(StoreError::Conflict(format!(
                    "Sponsor {} already exists",
                    sponsor.name
                )));
            }
            txn.insert(sponsor)
        })
        .await?;

    Ok(created)
}

/// All sponsors, most prominent tier first, then alphabetically
pub async fn list_sponsors(store: &Store) -> Result<Vec<Sponsor>, AppError> {
    let mut sponsors = store.list::<Sponsor>().await?;
    sponsors.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(sponsors)
}

pub async fn get_sponsor(store: &Store, id: &str) -> Result<Sponsor, AppError> {
    store
        .get::<Sponsor>(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Sponsor {id} not found")))
}

pub async fn update_sponsor(
    store: &Store,
    id: &str,
    input: SponsorInput,
) -> Result<Sponsor, AppError> {
    let name = sponsor_name(&input)?;

    let updated = store
        .write(|txn| {
            if name_taken(&txn.list::<Sponsor>()?, &name, Some(id)) {
                return Err(StoreError::Conflict(format!("Sponsor {name} already exists")));
            }
            txn.update(id, |sponsor: &mut Sponsor| {
                input.apply(sponsor, name);
                sponsor.updated_at = Utc::now();
                Ok(sponsor.clone())
            })
        })
        .await?;

    Ok(updated)
}

pub async fn delete_sponsor(store: &Store, id: &str) -> Result<Sponsor, AppError> {
    Ok(store.remove::<Sponsor>(id).await?)
}

#[cfg(feature = "web")]
pub use web::*;

#[cfg(feature = "web")]
mod web {
    use axum::{
        Json,
        extract::{Path, State},
        response::IntoResponse,
    };

    use super::*;
    use crate::app::{AppState, success};

    pub async fn handle_list_sponsors(
        State(state): State<AppState>,
    ) -> Result<impl IntoResponse, AppError> {
        success(list_sponsors(&state.store).await?)
    }

    pub async fn handle_create_sponsor(
        State(state): State<AppState>,
        Json(input): Json<SponsorInput>,
    ) -> Result<impl IntoResponse, AppError> {
        let sponsor = create_sponsor(&state.store, input).await?;
        tracing::info!(id = %sponsor.id, name = %sponsor.name, "sponsor added");
        success(sponsor)
    }

    pub async fn handle_get_sponsor(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse, AppError> {
        success(get_sponsor(&state.store, &id).await?)
    }

    pub async fn handle_update_sponsor(
        State(state): State<AppState>,
        Path(id): Path<String>,
        Json(input): Json<SponsorInput>,
    ) -> Result<impl IntoResponse, AppError> {
        success(update_sponsor(&state.store, &id, input).await?)
    }

    pub async fn handle_delete_sponsor(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse, AppError> {
        let removed = delete_sponsor(&state.store, &id).await?;
        tracing::info!(id = %removed.id, "sponsor removed");
        success(removed)
    }
}
