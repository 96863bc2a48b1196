use serde_json::{Map, Value};

use super::Method;
use crate::error::DecodeError;

/// Anything this short cannot hold a method and a target.
const MIN_MESSAGE_LEN: usize = 10;

/// Request commands that sit between the method and the target.
const COMMANDS: [&str; 3] = ["VALUE", "INFO", "STATE"];

/// A decoded TATU message.
///
/// `target` is the sensor id for requests and for sensor responses, or
/// `CAN_CONNECT` for a handshake answer. `content` holds the JSON payload of
/// FLOW/SET/CONNECT requests and the full JSON of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TatuMessage {
    pub method: Method,
    pub target: String,
    pub content: String,
    pub is_response: bool,
}

impl TatuMessage {
    fn invalid(is_response: bool) -> Self {
        Self {
            method: Method::Invalid,
            target: String::new(),
            content: String::new(),
            is_response,
        }
    }

    /// Decodes a raw payload. Unknown or malformed input yields an `INVALID`
    /// message, an error is only returned when a valid method lacks its target.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        if raw.chars().count() <= MIN_MESSAGE_LEN {
            return Ok(Self::invalid(false));
        }

        let response = parse_response(raw);
        let is_response = response.is_some();
        let method = match &response {
            Some(object) => object
                .get("METHOD")
                .and_then(Value::as_str)
                .and_then(|m| m.parse().ok()),
            None => raw.split_whitespace().next().and_then(|m| m.parse().ok()),
        }
        .unwrap_or(Method::Invalid);

        if method == Method::Invalid {
            return Ok(Self::invalid(is_response));
        }

        let target = match &response {
            Some(object) => response_target(object, method)?,
            None => request_target(raw, method)?,
        };

        let stripped = raw.replace('\\', "");
        let content = if is_response {
            if parse_response(&stripped).is_some() {
                stripped
            } else {
                raw.to_string()
            }
        } else if method.carries_content() {
            stripped
                .find('{')
                .map(|start| stripped[start..].to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };

        Ok(Self {
            method,
            target,
            content,
            is_response,
        })
    }

    /// Parses `content` as a JSON object, `None` if it is not one.
    pub fn content_json(&self) -> Option<Map<String, Value>> {
        match serde_json::from_str(&self.content) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        }
    }
}

/// A response is a JSON object carrying `"CODE":"POST"` and an object `BODY`.
fn parse_response(raw: &str) -> Option<Map<String, Value>> {
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(raw) else {
        return None;
    };
    let is_post = object.get("CODE").and_then(Value::as_str) == Some("POST");
    let has_body = object.get("BODY").is_some_and(Value::is_object);
    (is_post && has_body).then_some(object)
}

fn response_target(object: &Map<String, Value>, method: Method) -> Result<String, DecodeError> {
    object
        .get("BODY")
        .and_then(Value::as_object)
        .and_then(|body| body.keys().find(|key| key.as_str() != "FLOW"))
        .cloned()
        .ok_or(DecodeError::MissingBodyKey { method })
}

fn request_target(raw: &str, method: Method) -> Result<String, DecodeError> {
    let tokens: Vec<&str> = raw.split_whitespace().take(3).collect();
    if tokens.len() < 3 {
        return Err(DecodeError::MissingTarget {
            method,
            raw: raw.to_string(),
        });
    }
    let target = if COMMANDS.contains(&tokens[1]) {
        tokens[2]
    } else {
        tokens[1]
    };
    Ok(target.to_string())
}
