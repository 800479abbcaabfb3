// ABOUTME: Core library for packsync, containing the domain types shared by every sync component.
// ABOUTME: Defines packs, outbox mutations, backend/manifest seams, connectivity, and the read cache.

pub mod backend;
pub mod cache;
pub mod connectivity;
pub mod listeners;
pub mod manifest;
pub mod mutation;
pub mod pack;
pub mod testing;

pub use backend::{Backend, BackendError};
pub use cache::{FetchError, FetchOptions, FetchStatus, ReadCache, Snapshot};
pub use connectivity::Connectivity;
pub use listeners::{ListenerRegistry, Subscription};
pub use manifest::{
    Manifest, ManifestEntry, ManifestError, ManifestSource, ReconcileReport, StalePack,
    version_is_older,
};
pub use mutation::{ActionRequest, Mutation, MutationError, OpKind, OutboxItem};
pub use pack::{KeyError, Pack, PackKey};
