//! Artifact storage, HTTP fetch utilities and the SQLite registry store.

pub mod artifact;
pub mod db;
pub mod http;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use db::{ArmigerStore, PersistenceError, SqliteStore, StateStore};
pub use http::{redact_url, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "armory-storage";
