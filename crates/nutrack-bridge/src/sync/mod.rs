//! Cloud sync helpers.

pub mod conflict;

pub use conflict::{
    ConflictCallbacks, ConflictResolution, DecisionSurface, SyncConflictCoordinator,
    DOWNLOAD_DATABASE_ENDPOINT, UPLOAD_DATABASE_ENDPOINT,
};
