//! In-memory backend with scriptable failures.

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

use crate::capabilities::{ApiError, ImageUpload, RemoteApi};
use crate::model::{Trip, TripDraft, TripId, TripPatch};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    List,
    Create(TripDraft),
    Update(TripId, TripPatch),
    Delete(TripId),
    Upload(String),
}

impl RemoteCall {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RemoteCall::Create(_) | RemoteCall::Update(..) | RemoteCall::Delete(_)
        )
    }
}

#[derive(Debug, Default)]
struct FakeState {
    trips: Vec<Trip>,
    next_id: u64,
    calls: Vec<RemoteCall>,
    unreachable: bool,
    /// Mutations left to accept before the scripted failure fires once.
    scripted: Option<(usize, ApiError)>,
}

/// [`RemoteApi`] over a `Vec<Trip>`. Server ids are `srv-1`, `srv-2`, ...
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed(&self, trips: Vec<Trip>) {
        self.state().trips = trips;
    }

    pub fn trips(&self) -> Vec<Trip> {
        self.state().trips.clone()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<RemoteCall> {
        self.calls().into_iter().filter(RemoteCall::is_mutation).collect()
    }

    /// Every call fails as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Accept `ok` more mutations, then fail the next one with `error`.
    pub fn fail_after(&self, ok: usize, error: ApiError) {
        self.state().scripted = Some((ok, error));
    }

    fn begin(&self, call: RemoteCall) -> Result<MutexGuard<'_, FakeState>, ApiError> {
        let mut state = self.state();
        let mutation = call.is_mutation();
        state.calls.push(call);

        if state.unreachable {
            return Err(ApiError::NetworkUnreachable("connection refused".into()));
        }
        if mutation {
            if let Some((ok, error)) = state.scripted.take() {
                if ok == 0 {
                    return Err(error);
                }
                state.scripted = Some((ok - 1, error));
            }
        }
        Ok(state)
    }
}

fn not_found(id: &TripId) -> ApiError {
    ApiError::ServerRejected {
        status: 404,
        message: format!("trip {id} not found"),
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn list_trips(&self) -> Result<Vec<Trip>, ApiError> {
        let state = self.begin(RemoteCall::List)?;
        Ok(state.trips.clone())
    }

    async fn create_trip(&self, draft: &TripDraft) -> Result<Trip, ApiError> {
        let mut state = self.begin(RemoteCall::Create(draft.clone()))?;
        state.next_id += 1;
        let trip = Trip::from_draft(TripId::new(format!("srv-{}", state.next_id)), draft.clone());
        state.trips.push(trip.clone());
        Ok(trip)
    }

    async fn update_trip(&self, id: &TripId, patch: &TripPatch) -> Result<Trip, ApiError> {
        let mut state = self.begin(RemoteCall::Update(id.clone(), patch.clone()))?;
        let trip = state
            .trips
            .iter_mut()
            .find(|trip| &trip.id == id)
            .ok_or_else(|| not_found(id))?;
        patch.apply_to(trip);
        Ok(trip.clone())
    }

    async fn delete_trip(&self, id: &TripId) -> Result<(), ApiError> {
        let mut state = self.begin(RemoteCall::Delete(id.clone()))?;
        let before = state.trips.len();
        state.trips.retain(|trip| &trip.id != id);
        if state.trips.len() == before {
            return Err(not_found(id));
        }
        Ok(())
    }

    async fn upload_image(&self, image: ImageUpload) -> Result<String, ApiError> {
        self.begin(RemoteCall::Upload(image.file_name.clone()))?;
        Ok(format!("https://cdn.test/uploads/{}", image.file_name))
    }
}
