use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Error details in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

/// Envelope for all socket communication: request, response, or event,
/// multiplexed on one channel and tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Req(Request),
    Res(Response),
    Event(Event),
}

/// A request carrying a caller-chosen correlation id.
///
/// Ids are a per-connection incrementing counter; calls correlate per
/// connection, never globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A response paired to a request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// A fire-and-forget event. No correlation id; unknown names must be
/// safely ignorable by every receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    /// Creates a request with a serialized parameter map.
    pub fn new<T: Serialize>(
        id: u64,
        method: impl Into<String>,
        params: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let params = match params {
            Some(p) => Some(serde_json::to_value(p)?),
            None => None,
        };
        Ok(Self {
            id,
            method: method.into(),
            params,
        })
    }

    /// Deserializes the parameter map into the given type.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }

    /// Creates a success response for this request.
    pub fn reply<T: Serialize>(&self, payload: Option<&T>) -> Result<Response, serde_json::Error> {
        Response::success(self.id, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: impl Into<String>, message: impl Into<String>) -> Response {
        Response::failure(self.id, code, message)
    }
}

impl Response {
    /// Creates a success response.
    pub fn success<T: Serialize>(id: u64, payload: Option<&T>) -> Result<Self, serde_json::Error> {
        let payload = match payload {
            Some(p) => Some(serde_json::to_value(p)?),
            None => None,
        };
        Ok(Self {
            id,
            ok: true,
            payload,
            error: None,
        })
    }

    /// Creates a failure response with a structured error.
    pub fn failure(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            payload: None,
            error: Some(WireError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

impl Event {
    /// Creates an event with a serialized payload.
    pub fn new<T: Serialize>(
        event: impl Into<String>,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = match payload {
            Some(p) => Some(serde_json::to_value(p)?),
            None => None,
        };
        Ok(Self {
            event: event.into(),
            payload,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

impl Envelope {
    /// Serializes the envelope to its wire text form.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an envelope from wire text.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
