//! TATU protocol codec.
//!
//! Two families share the device topics:
//! - requests, plain text `METHOD COMMAND TARGET [CONTENT]` (e.g. `FLOW VALUE temp {...}`)
//! - responses, JSON objects with `"CODE":"POST"` and an object `BODY`
//!
//! Everything in here is pure apart from the wall-clock `TIMESTAMP` stamped
//! into built responses.

mod builder;
mod message;
pub mod topics;

pub use builder::{
    build_connack, build_connect, build_flow_response, build_get_response, ConnectDevice,
};
pub use message::TatuMessage;

use std::fmt;
use std::str::FromStr;

/// Methods understood by the extended TATU protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Connack,
    Evt,
    Flow,
    Get,
    Set,
    Post,
    Invalid,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Connack => "CONNACK",
            Method::Evt => "EVT",
            Method::Flow => "FLOW",
            Method::Get => "GET",
            Method::Set => "SET",
            Method::Post => "POST",
            Method::Invalid => "INVALID",
        }
    }

    /// Request methods whose JSON payload follows the target token.
    fn carries_content(&self) -> bool {
        matches!(self, Method::Flow | Method::Set | Method::Connect)
    }
}

impl FromStr for Method {
    type Err = ();

    /// Case-sensitive, `get` is not `GET`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Method::Connect),
            "CONNACK" => Ok(Method::Connack),
            "EVT" => Ok(Method::Evt),
            "FLOW" => Ok(Method::Flow),
            "GET" => Ok(Method::Get),
            "SET" => Ok(Method::Set),
            "POST" => Ok(Method::Post),
            "INVALID" => Ok(Method::Invalid),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
