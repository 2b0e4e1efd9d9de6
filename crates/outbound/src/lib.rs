pub mod channel;
pub mod history;
pub mod sink;

pub use channel::{OutboundChannel, OutboundConfig};
pub use history::HistoryRing;
pub use sink::FrameSink;
