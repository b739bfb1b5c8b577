//! JSON-RPC 2.0 envelope types used on the language server wire.
//!
//! Only the shapes LSP traffic actually takes are modelled: single requests,
//! notifications, and responses. Batch envelopes are not part of the
//! protocol and are rejected as invalid calls.

use serde::de::{self, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes reserved by the JSON-RPC 2.0 specification, plus the LSP
/// extension range the client cares about.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The server received `$/cancelRequest` for this request.
    pub const REQUEST_CANCELLED: i64 = -32800;
}

// https://www.jsonrpc.org/specification#error_object
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    pub fn method_not_found(method: &str) -> Self {
        Error {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Error {
            code: error_codes::INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for Error {}

// https://www.jsonrpc.org/specification#request_object

/// Request ID. Outbound requests always carry `Num`; the other shapes exist
/// to decode whatever a server sends back.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    Null,
    Num(u64),
    Str(String),
}

/// Protocol version marker, always the literal `"2.0"`.
#[derive(Debug, PartialEq, Clone, Copy, Hash, Eq)]
pub enum Version {
    V2,
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match *self {
            Version::V2 => serializer.serialize_str("2.0"),
        }
    }
}

struct VersionVisitor;

impl<'v> Visitor<'v> for VersionVisitor {
    type Value = Version;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match value {
            "2.0" => Ok(Version::V2),
            _ => Err(de::Error::custom("invalid version")),
        }
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_identifier(VersionVisitor)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    None,
    Array(Vec<Value>),
    Map(serde_json::Map<String, Value>),
}

impl Params {
    pub fn parse<D>(self) -> Result<D, Error>
    where
        D: serde::de::DeserializeOwned,
    {
        let value: Value = self.into();
        serde_json::from_value(value)
            .map_err(|err| Error::invalid_params(format!("invalid params: {err}")))
    }
}

impl From<Params> for Value {
    fn from(params: Params) -> Value {
        match params {
            Params::Array(vec) => Value::Array(vec),
            Params::Map(map) => Value::Object(map),
            Params::None => Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MethodCall {
    pub jsonrpc: Option<Version>,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Params,
    pub id: Id,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    pub jsonrpc: Option<Version>,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Params,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Call {
    MethodCall(MethodCall),
    Notification(Notification),
    Invalid {
        // salvage the id out of an invalid request for better diagnostics
        #[serde(default = "default_id")]
        id: Id,
    },
}

fn default_params() -> Params {
    Params::None
}

fn default_id() -> Id {
    Id::Null
}

impl From<MethodCall> for Call {
    fn from(method_call: MethodCall) -> Self {
        Call::MethodCall(method_call)
    }
}

impl From<Notification> for Call {
    fn from(notification: Notification) -> Self {
        Call::Notification(notification)
    }
}

// https://www.jsonrpc.org/specification#response_object

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Success {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<Version>,
    pub result: Value,
    pub id: Id,
}

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct Failure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<Version>,
    pub error: Error,
    pub id: Id,
}

// Failure must come first: unknown fields are tolerated for compatibility
// with loose servers, so a response carrying both `result` and `error` has
// to decode as a `Failure`.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Output {
    Failure(Failure),
    Success(Success),
}

impl From<Output> for Result<Value, Error> {
    fn from(output: Output) -> Self {
        match output {
            Output::Success(success) => Ok(success.result),
            Output::Failure(failure) => Err(failure.error),
        }
    }
}

#[test]
fn method_call_serialize() {
    let call = MethodCall {
        jsonrpc: Some(Version::V2),
        method: "textDocument/hover".to_owned(),
        params: Params::Map(serde_json::Map::new()),
        id: Id::Num(7),
    };

    let serialized = serde_json::to_string(&call).unwrap();
    assert_eq!(
        serialized,
        r#"{"jsonrpc":"2.0","method":"textDocument/hover","params":{},"id":7}"#
    );
}

#[test]
fn method_call_round_trip() {
    let call = MethodCall {
        jsonrpc: Some(Version::V2),
        method: "initialize".to_owned(),
        params: Params::Map(
            serde_json::Map::from_iter([("processId".to_owned(), Value::from(1))]),
        ),
        id: Id::Num(1),
    };

    let serialized = serde_json::to_string(&call).unwrap();
    let deserialized: MethodCall = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, call);
}

#[test]
fn notification_serialize() {
    let notification = Notification {
        jsonrpc: Some(Version::V2),
        method: "exit".to_owned(),
        params: Params::None,
    };

    let serialized = serde_json::to_string(&notification).unwrap();
    assert_eq!(serialized, r#"{"jsonrpc":"2.0","method":"exit","params":null}"#);
}

#[test]
fn success_output_deserialize_with_extra_fields() {
    // loose servers attach extra keys to responses; they must not break decoding
    let raw = r#"{"jsonrpc":"2.0","result":1,"id":1,"requestMethod":"initialize"}"#;

    let deserialized: Output = serde_json::from_str(raw).unwrap();
    assert_eq!(
        deserialized,
        Output::Success(Success {
            jsonrpc: Some(Version::V2),
            result: Value::from(1),
            id: Id::Num(1)
        })
    );
}

#[test]
fn output_with_result_and_error_is_a_failure() {
    let raw = r#"{"jsonrpc":"2.0","result":null,"error":{"code":-32603,"message":"boom"},"id":4}"#;

    match serde_json::from_str::<Output>(raw).unwrap() {
        Output::Failure(failure) => {
            assert_eq!(failure.error.code, error_codes::INTERNAL_ERROR);
            assert_eq!(failure.id, Id::Num(4));
        }
        Output::Success(_) => panic!("expected a failure"),
    }
}

#[test]
fn invalid_call_salvages_id() {
    // a frame with no method cannot be a call or a notification
    let raw = r#"{"id":9}"#;

    let deserialized: Call = serde_json::from_str(raw).unwrap();
    assert_eq!(deserialized, Call::Invalid { id: Id::Num(9) });
}
