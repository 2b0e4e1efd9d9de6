pub mod codec;
pub mod event;
pub mod tag;

pub use codec::{decode, encode};
pub use event::{Event, InboundCheck};
pub use tag::{EventCategory, EventTag};
