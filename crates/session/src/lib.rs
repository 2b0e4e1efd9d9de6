pub mod agent;
pub mod cancel;
pub mod confirmation;
pub mod session;
pub mod sink;

pub use agent::{Agent, AgentFactory, StepRecord};
pub use cancel::{CancelMap, CancelToken};
pub use confirmation::{ConfirmationGate, ConfirmationOutcome, ConfirmationResponse};
pub use session::{SessionConfig, SessionHandle, SessionSnapshotFields};
pub use sink::EventSink;
