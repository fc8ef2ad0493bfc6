use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub const DEFAULT_SOURCE_LANG: &str = "en";
pub const DEFAULT_TARGET_LANG: &str = "ja";
pub const DEFAULT_PRIORITY: &str = "normal";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_TIMEOUT: &str = "timeout";

/// One parsed client frame, routed by its `type` field. A frame without a
/// `type` is a translation request.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientAction {
    Translate(TranslationRequest),
    Ping,
    Stats,
    Health,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranslationRequest {
    pub request_id: String,
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub priority: String,
}

#[derive(Debug, PartialEq)]
pub enum RequestError {
    TypeMustBeString,
    UnknownType { actual: String },
    MissingText,
    FieldMustBeString { field: &'static str },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMustBeString => write!(f, "field 'type' must be a string"),
            Self::UnknownType { actual } => write!(f, "unknown request type '{actual}'"),
            Self::MissingText => write!(f, "missing required field 'text'"),
            Self::FieldMustBeString { field } => {
                write!(f, "field '{field}' must be a string")
            }
        }
    }
}

impl std::error::Error for RequestError {}

/// Routes a decoded envelope to an action. Translation requests get their
/// language and priority defaults filled in here and a generated request id
/// when the caller supplied none.
pub fn evaluate_request(raw: &Value) -> Result<ClientAction, RequestError> {
    let request_type = match raw.get("type") {
        None => "translation",
        Some(Value::String(name)) => name.as_str(),
        Some(_) => return Err(RequestError::TypeMustBeString),
    };

    match request_type {
        "translation" => Ok(ClientAction::Translate(parse_translation(raw)?)),
        "ping" => Ok(ClientAction::Ping),
        "stats" => Ok(ClientAction::Stats),
        "health" => Ok(ClientAction::Health),
        other => Err(RequestError::UnknownType {
            actual: other.to_owned(),
        }),
    }
}

/// Pulls a readable request id out of a raw envelope so error replies can
/// echo it even when the rest of the request is malformed.
pub fn echo_request_id(raw: &Value) -> Option<String> {
    raw.get("request_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

fn parse_translation(raw: &Value) -> Result<TranslationRequest, RequestError> {
    let text = match raw.get("text") {
        None | Some(Value::Null) => return Err(RequestError::MissingText),
        Some(Value::String(text)) => text.clone(),
        Some(_) => return Err(RequestError::FieldMustBeString { field: "text" }),
    };

    let request_id = match echo_request_id(raw) {
        Some(id) => id,
        None => Uuid::new_v4().to_string(),
    };

    Ok(TranslationRequest {
        request_id,
        text,
        source_lang: parse_string_or(raw, "source_lang", DEFAULT_SOURCE_LANG)?,
        target_lang: parse_string_or(raw, "target_lang", DEFAULT_TARGET_LANG)?,
        priority: parse_string_or(raw, "priority", DEFAULT_PRIORITY)?,
    })
}

fn parse_string_or(
    raw: &Value,
    field: &'static str,
    default: &str,
) -> Result<String, RequestError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(default.to_owned()),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(RequestError::FieldMustBeString { field }),
    }
}

pub fn translation_success(
    request_id: &str,
    translated_text: &str,
    processing_time_ms: u64,
) -> Value {
    json!({
        "request_id": request_id,
        "translated_text": translated_text,
        "status": STATUS_SUCCESS,
        "processing_time_ms": processing_time_ms,
    })
}

pub fn translation_failure(request_id: &str, message: &str, processing_time_ms: u64) -> Value {
    json!({
        "request_id": request_id,
        "error": message,
        "status": STATUS_ERROR,
        "processing_time_ms": processing_time_ms,
    })
}

pub fn translation_timeout(request_id: &str, timeout_ms: u64) -> Value {
    json!({
        "request_id": request_id,
        "error": format!("request timed out after {timeout_ms}ms"),
        "status": STATUS_TIMEOUT,
    })
}

pub fn pong_reply() -> Value {
    let now = Utc::now();
    json!({
        "type": "pong",
        "timestamp": now.timestamp_millis(),
        "server_time": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "status": "ok",
    })
}

pub fn stats_reply(
    server_stats: Value,
    processor_stats: Value,
    supported_languages: Value,
) -> Value {
    json!({
        "type": "stats",
        "server_stats": server_stats,
        "processor_stats": processor_stats,
        "supported_languages": supported_languages,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "status": "ok",
    })
}

/// Health replies start from the processor's own report and get the server
/// side fields layered on top.
pub fn health_reply(processor_report: Value, active_connections: u64) -> Value {
    let mut fields = match processor_report {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("processor".to_owned(), other);
            map
        }
    };

    fields.insert("type".to_owned(), Value::from("health"));
    fields.insert("server_status".to_owned(), Value::from("running"));
    fields.insert(
        "active_connections".to_owned(),
        Value::from(active_connections),
    );
    Value::Object(fields)
}

pub fn error_reply(request_id: Option<&str>, message: &str) -> Value {
    let mut reply = json!({
        "error": message,
        "status": STATUS_ERROR,
    });
    if let Some(id) = request_id {
        reply["request_id"] = Value::from(id);
    }
    reply
}
