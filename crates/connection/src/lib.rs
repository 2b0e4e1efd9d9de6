pub mod dispatch;
pub mod manager;
pub mod ws_sink;

pub use dispatch::EventDispatcher;
pub use manager::serve_connection;
pub use ws_sink::WsFrameSink;
