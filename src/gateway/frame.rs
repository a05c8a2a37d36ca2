use serde_json::Value;

use crate::error::RelayError;
use crate::pbx::StreamCall;

/// Everything a stream frame can turn out to be. Shapes are disambiguated by
/// field presence, not by any frame-level type tag.
#[derive(Debug)]
pub enum InboundFrame {
    /// Reply to our heartbeat; accepted and otherwise ignored.
    HeartbeatEcho,
    /// `{errcode: 0, ...}` acknowledgement (e.g. of the subscribe frame).
    Ack(String),
    /// `{errcode != 0, ...}` error envelope; logged, connection stays open.
    ErrorEnvelope(i64, String),
    /// Message envelope whose inner record carries a type discriminator.
    Record(StreamCall),
    /// Message envelope without a recognizable record; dropped.
    NonRecord,
}

/// Parses one inbound text frame. The inner record of a message envelope may
/// arrive double-encoded (a JSON string containing JSON); both encodings are
/// accepted. A parse failure only ever drops this frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, RelayError> {
    if text == "heartbeat response" {
        return Ok(InboundFrame::HeartbeatEcho);
    }

    let value: Value = serde_json::from_str(text)?;

    if let Some(errcode) = value.get("errcode").and_then(Value::as_i64) {
        let errmsg = value
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(if errcode == 0 {
            InboundFrame::Ack(errmsg)
        } else {
            InboundFrame::ErrorEnvelope(errcode, errmsg)
        });
    }

    let Some(msg) = value.get("msg") else {
        return Ok(InboundFrame::NonRecord);
    };

    let inner: Value = match msg {
        Value::String(raw) => serde_json::from_str(raw)?,
        other => other.clone(),
    };

    if inner.get("type").and_then(Value::as_str).is_none() {
        return Ok(InboundFrame::NonRecord);
    }

    let call: StreamCall = serde_json::from_value(inner)?;
    Ok(InboundFrame::Record(call))
}

/// A parsed record qualifies for pipeline processing iff the call was
/// answered and the recording reference is non-empty after trimming.
/// (The type discriminator was already required to parse at all.)
pub fn qualifies(call: &StreamCall) -> bool {
    let status = call.status.to_uppercase();
    let answered = !matches!(status.as_str(), "NO ANSWER" | "NO_ANSWER" | "NOANSWER");
    answered && !call.recording.trim().is_empty()
}
