use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Topics ───────────────────────────────────────────────────────────

/// Topic prefix convention: WebSocket frames use `sdcp/...`, the
/// broker-mediated MQTT tree uses `/sdcp/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStyle {
    WebSocket,
    Mqtt,
}

/// The closed set of SDCP topic kinds. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Request,
    Response,
    Status,
    Attributes,
    Notice,
    Error,
    Unknown,
}

impl TopicKind {
    /// Split `sdcp/<kind>/<id>` (or `/sdcp/<kind>/<id>`) into kind and id.
    pub fn parse(topic: &str) -> (Self, Option<&str>) {
        let trimmed = topic.strip_prefix('/').unwrap_or(topic);
        let Some(rest) = trimmed.strip_prefix("sdcp/") else {
            return (Self::Unknown, None);
        };
        let (kind, id) = match rest.split_once('/') {
            Some((kind, id)) => (kind, Some(id).filter(|id| !id.is_empty())),
            None => (rest, None),
        };
        let kind = match kind {
            "request" => Self::Request,
            "response" => Self::Response,
            "status" => Self::Status,
            "attributes" => Self::Attributes,
            "notice" => Self::Notice,
            "error" => Self::Error,
            _ => Self::Unknown,
        };
        (kind, id)
    }

    fn segment(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Status => "status",
            Self::Attributes => "attributes",
            Self::Notice => "notice",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Build the full topic string for a mainboard id.
    pub fn topic(self, style: TopicStyle, mainboard_id: &str) -> String {
        match style {
            TopicStyle::WebSocket => format!("sdcp/{}/{mainboard_id}", self.segment()),
            TopicStyle::Mqtt => format!("/sdcp/{}/{mainboard_id}", self.segment()),
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// Outbound command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdcpRequest {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Data")]
    pub data: RequestData,
    #[serde(rename = "Topic", default)]
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    #[serde(rename = "Cmd")]
    pub cmd: u32,
    #[serde(rename = "Data", default)]
    pub data: Value,
    #[serde(rename = "RequestID", default)]
    pub request_id: String,
    #[serde(rename = "MainboardID", default)]
    pub mainboard_id: String,
    #[serde(rename = "TimeStamp", default)]
    pub timestamp: i64,
    #[serde(rename = "From", default)]
    pub from: i64,
}

/// Fresh hex correlation id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl SdcpRequest {
    pub fn new(
        connection_id: &str,
        mainboard_id: &str,
        cmd: u32,
        data: Value,
        style: TopicStyle,
    ) -> Self {
        let data = if data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            data
        };
        Self {
            id: connection_id.to_owned(),
            data: RequestData {
                cmd,
                data,
                request_id: new_request_id(),
                mainboard_id: mainboard_id.to_owned(),
                timestamp: chrono::Utc::now().timestamp(),
                from: 0,
            },
            topic: TopicKind::Request.topic(style, mainboard_id),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.data.request_id
    }

    pub fn to_json(&self) -> String {
        // A struct of strings, integers and a `Value` always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Responses ────────────────────────────────────────────────────────

/// A decoded `sdcp/response/<id>` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdcpResponse {
    #[serde(rename = "Cmd")]
    pub cmd: u32,
    #[serde(rename = "Data", default)]
    pub data: Value,
    #[serde(rename = "RequestID", default)]
    pub request_id: String,
    #[serde(rename = "MainboardID", default)]
    pub mainboard_id: String,
    #[serde(rename = "TimeStamp", default)]
    pub timestamp: i64,
}

impl SdcpResponse {
    /// Status code from `Data.Ack`; missing means success.
    pub fn ack(&self) -> i64 {
        self.data.get("Ack").and_then(Value::as_i64).unwrap_or(0)
    }
}

// ── Inbound message kinds ────────────────────────────────────────────

/// An inbound frame decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SdcpMessage {
    Response(SdcpResponse),
    Status {
        mainboard_id: Option<String>,
        status: Value,
    },
    Attributes {
        mainboard_id: Option<String>,
        attributes: Value,
    },
    Notice(Value),
    Error(Value),
    /// A request echoed back to us, e.g. by a broker fan-out.
    Request(Box<SdcpRequest>),
    Unknown {
        topic: String,
        body: Value,
    },
}

impl SdcpMessage {
    pub fn decode(text: &str) -> Result<Self, Error> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::malformed(e.to_string(), text))?;
        Self::from_value(value)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            Error::malformed(e.to_string(), String::from_utf8_lossy(bytes).into_owned())
        })?;
        Self::decode(text)
    }

    pub fn from_value(value: Value) -> Result<Self, Error> {
        let topic = value
            .get("Topic")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let (kind, _) = TopicKind::parse(&topic);

        // Some firmware omits the topic on pushes; infer from the payload key.
        let kind = match kind {
            TopicKind::Unknown if topic.is_empty() => {
                if value.get("Status").is_some() {
                    TopicKind::Status
                } else if value.get("Attributes").is_some() {
                    TopicKind::Attributes
                } else {
                    TopicKind::Unknown
                }
            }
            other => other,
        };

        let mainboard_id = value
            .get("MainboardID")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(match kind {
            TopicKind::Response => {
                let data = value
                    .get("Data")
                    .cloned()
                    .ok_or_else(|| Error::malformed("response without Data", value.to_string()))?;
                let response: SdcpResponse = serde_json::from_value(data)
                    .map_err(|e| Error::malformed(e.to_string(), value.to_string()))?;
                Self::Response(response)
            }
            TopicKind::Status => Self::Status {
                mainboard_id,
                status: value.get("Status").cloned().unwrap_or(Value::Null),
            },
            TopicKind::Attributes => Self::Attributes {
                mainboard_id,
                attributes: value.get("Attributes").cloned().unwrap_or(Value::Null),
            },
            TopicKind::Notice => Self::Notice(value),
            TopicKind::Error => Self::Error(value),
            TopicKind::Request => {
                let request: SdcpRequest = serde_json::from_value(value.clone())
                    .map_err(|e| Error::malformed(e.to_string(), value.to_string()))?;
                Self::Request(Box::new(request))
            }
            TopicKind::Unknown => Self::Unknown { topic, body: value },
        })
    }
}

// ── Outbound push encoding (gateway bridging) ────────────────────────

/// Encode a status or attributes push the way a WebSocket printer would.
pub fn encode_push(kind: TopicKind, style: TopicStyle, mainboard_id: &str, body: &Value) -> Value {
    let key = match kind {
        TopicKind::Attributes => "Attributes",
        _ => "Status",
    };
    serde_json::json!({
        key: body,
        "MainboardID": mainboard_id,
        "TimeStamp": chrono::Utc::now().timestamp(),
        "Topic": kind.topic(style, mainboard_id),
    })
}

/// Encode a response frame for a request that was answered out of band.
pub fn encode_response(style: TopicStyle, connection_id: &str, response: &SdcpResponse) -> Value {
    serde_json::json!({
        "Id": connection_id,
        "Data": response,
        "Topic": TopicKind::Response.topic(style, &response.mainboard_id),
    })
}

// ── Tests ────────────────────────────────────────────────────────────
