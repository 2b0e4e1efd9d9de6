use conduit_domain::Error;

use crate::event::Event;

/// JSON framing over UTF-8 text frames. The connection manager owns
/// the frame-size check (it needs the raw byte length before decoding);
/// this module only owns the JSON shape.
pub fn encode(event: &Event) -> Result<String, Error> {
    serde_json::to_string(event).map_err(Error::Json)
}

/// Decode one inbound frame. A JSON syntax error or an unknown `event` tag
/// both surface as `Error::InvalidFrame` — an unrecognised tag on ingress
/// is handled the same way as a parse failure, not silently dropped.
pub fn decode(frame: &str) -> Result<Event, Error> {
    serde_json::from_str(frame).map_err(|e| Error::InvalidFrame(e.to_string()))
}
