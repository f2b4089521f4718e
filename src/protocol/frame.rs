//! Codec for the service's text framing.
//!
//! Inbound frames are SockJS-style envelopes: a JSON string inside a JSON
//! array, itself containing an escaped JSON object. The envelopes are matched
//! with the wire patterns directly rather than unescaping twice; only the
//! small sub-bodies (permission map, server error) go through `serde_json`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::errors::OrtcError;

static OPERATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^a\["\{\\"op\\":\\"([^"]+)\\",(.*)\}"\]$"#).expect("valid operation pattern")
});

static RECEIVED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^a\["\{\\"ch\\":\\"([^"]+)\\",\\"m\\":\\"([\s\S]*?)\\"\}"\]$"#)
        .expect("valid received pattern")
});

static CHANNEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\\"ch\\":\\"(.*)\\"$"#).expect("valid channel pattern"));

static PERMISSIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\\"up\\":(.*),\\"set\\":(.*)$"#).expect("valid permissions pattern"));

static EXCEPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\\"ex\\":(\{.*\})$"#).expect("valid exception pattern"));

static MULTI_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^_]+)_([^-]+)-([^_]+)_([\s\S]*)$").expect("valid part pattern"));

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// `"h"`, liveness only
    Heartbeat,
    /// `"o"`, the service is ready for the validate command
    Open,
    /// An operation envelope; the body still carries the escaped sub-fields
    Operation { op: Operation, body: String },
    /// A message pushed on a subscribed channel
    Received { channel: String, payload: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Validated,
    Subscribed,
    Unsubscribed,
    Error,
}

/// An error reported by the service inside an `ortc-error` envelope.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerError {
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerErrorOperation {
    Unexpected,
    Validate,
    Subscribe,
    SubscribeMaxSize,
    UnsubscribeMaxSize,
    SendMaxSize,
}

impl ServerError {
    pub(crate) fn operation_kind(&self) -> ServerErrorOperation {
        match self.operation.as_str() {
            "validate" => ServerErrorOperation::Validate,
            "subscribe" => ServerErrorOperation::Subscribe,
            "subscribe_maxsize" => ServerErrorOperation::SubscribeMaxSize,
            "unsubscribe_maxsize" => ServerErrorOperation::UnsubscribeMaxSize,
            "send_maxsize" => ServerErrorOperation::SendMaxSize,
            _ => ServerErrorOperation::Unexpected,
        }
    }
}

/// Decodes one inbound text frame. Anything that matches no pattern is a
/// protocol error and tears the connection down.
pub(crate) fn parse_frame(raw: &str) -> Result<Frame, OrtcError> {
    if raw == "h" {
        return Ok(Frame::Heartbeat);
    }
    if raw == "o" {
        return Ok(Frame::Open);
    }
    if let Some(caps) = OPERATION.captures(raw) {
        let op = match &caps[1] {
            "ortc-validated" => Operation::Validated,
            "ortc-subscribed" => Operation::Subscribed,
            "ortc-unsubscribed" => Operation::Unsubscribed,
            "ortc-error" => Operation::Error,
            other => {
                return Err(OrtcError::InvalidMessage(format!("Unknown operation: {other}")))
            }
        };
        return Ok(Frame::Operation { op, body: caps[2].to_string() });
    }
    if let Some(caps) = RECEIVED.captures(raw) {
        return Ok(Frame::Received { channel: caps[1].to_string(), payload: caps[2].to_string() });
    }
    Err(OrtcError::InvalidMessage(format!("Invalid message format: {raw}")))
}

/// The channel named in a subscribed / unsubscribed acknowledgement body.
pub(crate) fn channel_from_body(body: &str) -> Option<String> {
    CHANNEL.captures(body).map(|caps| caps[1].to_string())
}

/// The permission map carried by a `validated` body. A missing, `null` or
/// malformed map yields an empty one, which authorizes everything (the
/// unauthenticated mode).
pub(crate) fn permissions_from_body(body: &str) -> HashMap<String, String> {
    let Some(caps) = PERMISSIONS.captures(body) else {
        return HashMap::new();
    };
    let unescaped = caps[1].replace('\\', "");
    serde_json::from_str(&unescaped).unwrap_or_default()
}

/// The server error carried by an `ortc-error` body.
pub(crate) fn server_error_from_body(body: &str) -> Option<ServerError> {
    let caps = EXCEPTION.captures(body)?;
    let unescaped = caps[1].replace("\\\"", "\"");
    serde_json::from_str(&unescaped).ok()
}

/// Splits a received payload into `(id, part, total, chunk)`. `None` means
/// the payload carries no usable multi-part header and is a complete message
/// by itself.
pub(crate) fn split_multi_part(payload: &str) -> Option<(String, u32, u32, String)> {
    let caps = MULTI_PART.captures(payload)?;
    let part: u32 = caps[2].parse().ok()?;
    let total: u32 = caps[3].parse().ok()?;
    Some((caps[1].to_string(), part, total, caps[4].to_string()))
}

/// JSON-escapes an outbound payload and strips the surrounding quotes, so it
/// can be spliced into a frame body.
pub(crate) fn escape_payload(message: &str) -> String {
    let quoted = serde_json::to_string(message).expect("valid json");
    quoted[1..quoted.len() - 1].to_string()
}

// Every outbound command is a quoted literal sent as one text frame.
fn wrap(body: String) -> String {
    format!("\"{body}\"")
}

pub(crate) fn validate_command(
    application_key: &str,
    authentication_token: &str,
    announcement_subchannel: &str,
    metadata: &str,
) -> String {
    wrap(format!(
        "validate;{application_key};{authentication_token};{announcement_subchannel};;{metadata}"
    ))
}

pub(crate) fn subscribe_command(
    application_key: &str,
    authentication_token: &str,
    channel: &str,
    permission: &str,
) -> String {
    wrap(format!("subscribe;{application_key};{authentication_token};{channel};{permission}"))
}

pub(crate) fn unsubscribe_command(application_key: &str, channel: &str) -> String {
    wrap(format!("unsubscribe;{application_key};{channel}"))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn send_command(
    application_key: &str,
    authentication_token: &str,
    channel: &str,
    permission: &str,
    message_id: &str,
    part: u32,
    total: u32,
    escaped_chunk: &str,
) -> String {
    wrap(format!(
        "send;{application_key};{authentication_token};{channel};{permission};\
         {message_id}_{part}-{total}_{escaped_chunk}"
    ))
}
