// lib.rs - offline-first trip sync engine

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! Keeps a trip-journal client usable without a network.
//!
//! Mutations issued through [`SyncOrchestrator::write`] hit the backend when
//! it is reachable and land in a durable SQLite queue when it is not. The
//! queue is replayed oldest-first on reconnect or on [`SyncOrchestrator::sync_now`],
//! halting at the first failure. Reads are served from the backend when
//! possible and from the last authoritative snapshot otherwise.
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod capabilities;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use capabilities::{
    ApiError, CredentialProvider, HttpProbe, HttpRemoteApi, ImageUpload, ManualProbe,
    ReachabilityProbe, RemoteApi, StaticCredentials, ValidatedUrl,
};
pub use config::{MonitorConfig, SyncConfig};
pub use connectivity::{ConnectivityMonitor, Debouncer, MonitorHandle};
pub use error::SyncError;
pub use model::{Mutation, Trip, TripDraft, TripId, TripPatch, UnixTimeMs, ValidationError};
pub use offline_store::{CacheStore, StoreError};
pub use outbox::{ActionId, ActionKind, ActionQueue, HttpMethod, OutboxError, QueuedAction};
pub use sync::{
    AutoSync, DrainReport, HaltReason, SyncOrchestrator, SyncState, WriteOutcome, WriteResult,
};
