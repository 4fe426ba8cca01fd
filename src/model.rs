use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Prefix of ids fabricated on the device for trips the server has not seen yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

const MAX_TITLE_LENGTH: usize = 256;
const MAX_DESTINATION_LENGTH: usize = 256;
const MAX_DESCRIPTION_LENGTH: usize = 8192;

static LOCAL_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("trip id cannot be empty")]
    EmptyId,

    #[error("update carries no fields")]
    EmptyPatch,
}

/// Server-assigned or locally fabricated trip identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(String);

impl TripId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `local-<millis>-<seq><rand>`; unique even for creates issued within the same millisecond.
    pub fn generate_local() -> Self {
        let seq = LOCAL_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        let salt = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}{}-{}{}",
            LOCAL_ID_PREFIX,
            UnixTimeMs::now().0,
            seq,
            &salt[..6]
        ))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        Ok(())
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of `POST /trips`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripDraft {
    pub title: String,
    pub destination: String,
    pub start_date: String,
    pub end_date: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photos: Option<Vec<String>>,
}

impl TripDraft {
    pub fn new(title: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::Missing { field: "title" });
        }
        if self.destination.trim().is_empty() {
            return Err(ValidationError::Missing {
                field: "destination",
            });
        }
        check_len("title", &self.title, MAX_TITLE_LENGTH)?;
        check_len("destination", &self.destination, MAX_DESTINATION_LENGTH)?;
        check_len("description", &self.description, MAX_DESCRIPTION_LENGTH)?;
        Ok(())
    }
}

/// Body of `PUT /trips/{id}`: only the fields that are set go over the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photos: Option<Vec<String>>,
}

impl TripPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(ValidationError::Missing { field: "title" });
            }
            check_len("title", title, MAX_TITLE_LENGTH)?;
        }
        if let Some(destination) = &self.destination {
            if destination.trim().is_empty() {
                return Err(ValidationError::Missing {
                    field: "destination",
                });
            }
            check_len("destination", destination, MAX_DESTINATION_LENGTH)?;
        }
        if let Some(description) = &self.description {
            check_len("description", description, MAX_DESCRIPTION_LENGTH)?;
        }
        Ok(())
    }

    /// Overlay the set fields onto `trip`. Only used to shape optimistic results.
    pub fn apply_to(&self, trip: &mut Trip) {
        if let Some(v) = &self.title {
            trip.title = v.clone();
        }
        if let Some(v) = &self.destination {
            trip.destination = v.clone();
        }
        if let Some(v) = &self.start_date {
            trip.start_date = v.clone();
        }
        if let Some(v) = &self.end_date {
            trip.end_date = v.clone();
        }
        if let Some(v) = &self.description {
            trip.description = v.clone();
        }
        if let Some(v) = &self.image {
            trip.image = Some(v.clone());
        }
        if let Some(v) = &self.photos {
            trip.photos = Some(v.clone());
        }
    }
}

/// A trip as the server returns it. Fields the client does not model are kept in `extra`
/// so cached snapshots stay verbatim copies of the server payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: TripId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photos: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Trip {
    pub fn from_draft(id: TripId, draft: TripDraft) -> Self {
        Self {
            id,
            title: draft.title,
            destination: draft.destination,
            start_date: draft.start_date,
            end_date: draft.end_date,
            description: draft.description,
            image: draft.image,
            photos: draft.photos,
            extra: Map::new(),
        }
    }

    /// Trip carrying only an id and the patched fields; used when an offline update targets
    /// a trip absent from the cached snapshot.
    pub fn from_patch(id: TripId, patch: &TripPatch) -> Self {
        let mut trip = Self::from_draft(id, TripDraft::default());
        patch.apply_to(&mut trip);
        trip
    }
}

/// A mutation intent issued by the UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Create(TripDraft),
    Update { id: TripId, patch: TripPatch },
    Delete { id: TripId },
}

impl Mutation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Mutation::Create(draft) => draft.validate(),
            Mutation::Update { id, patch } => {
                id.validate()?;
                patch.validate()
            }
            Mutation::Delete { id } => id.validate(),
        }
    }

    /// Trip targeted by an update or delete.
    pub fn target(&self) -> Option<&TripId> {
        match self {
            Mutation::Create(_) => None,
            Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id),
        }
    }

    pub(crate) fn retarget(&mut self, new_id: TripId) {
        match self {
            Mutation::Create(_) => {}
            Mutation::Update { id, .. } | Mutation::Delete { id } => *id = new_id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
        }
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_ids_are_unique_and_flagged() {
        let a = TripId::generate_local();
        let b = TripId::generate_local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!TripId::new("42").is_local());
    }

    #[test]
    fn draft_requires_title_and_destination() {
        assert_eq!(
            TripDraft::new("  ", "Rome").validate(),
            Err(ValidationError::Missing { field: "title" })
        );
        assert_eq!(
            TripDraft::new("Rome", "").validate(),
            Err(ValidationError::Missing {
                field: "destination"
            })
        );
        assert!(TripDraft::new("Rome", "Italy").validate().is_ok());
    }

    #[test]
    fn draft_serializes_camel_case_without_absent_options() {
        let draft = TripDraft {
            start_date: "2025-05-01".into(),
            ..TripDraft::new("Rome", "Italy")
        };
        let value = serde_json::to_value(&draft).unwrap();
        assert_eq!(value["startDate"], "2025-05-01");
        assert!(value.get("image").is_none());
        assert!(value.get("photos").is_none());
    }

    #[test]
    fn patch_only_serializes_set_fields() {
        let value = serde_json::to_value(TripPatch::title("Rome Trip")).unwrap();
        assert_eq!(value, json!({ "title": "Rome Trip" }));
    }

    #[test]
    fn empty_patch_is_rejected() {
        assert_eq!(
            TripPatch::default().validate(),
            Err(ValidationError::EmptyPatch)
        );
    }

    #[test]
    fn trip_keeps_unknown_server_fields() {
        let raw = json!({
            "id": "7",
            "title": "Lisbon",
            "destination": "Portugal",
            "startDate": "2025-01-01",
            "endDate": "2025-01-05",
            "description": "",
            "userId": "u-1",
            "likes": 3
        });
        let trip: Trip = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(trip.id.as_str(), "7");
        assert_eq!(trip.extra["userId"], "u-1");
        assert_eq!(serde_json::to_value(&trip).unwrap(), raw);
    }

    #[test]
    fn patch_applies_over_trip() {
        let mut trip = Trip::from_draft(TripId::new("1"), TripDraft::new("Rome", "Italy"));
        TripPatch::title("Rome Trip").apply_to(&mut trip);
        assert_eq!(trip.title, "Rome Trip");
        assert_eq!(trip.destination, "Italy");
    }
}
