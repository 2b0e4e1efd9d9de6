pub mod canonical;
pub mod envelope;
pub mod manager;
pub mod secret;
pub mod snapshot;

pub use manager::StateManager;
pub use secret::StateSecret;
pub use snapshot::{SignedEnvelope, SnapshotState, CURRENT_VERSION};
