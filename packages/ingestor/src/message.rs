//! Message and Wire Types
//!
//! Platform-delivered SMS messages, queued parse jobs, and the JSON
//! request/response contract of the remote parsing service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// SMS as delivered by the platform message source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Message text
    pub body: String,
    /// Originating address, empty when the platform did not report one
    #[serde(default)]
    pub sender: String,
    /// Unix timestamp in milliseconds when the message was received
    pub timestamp_millis: i64,
}

impl RawMessage {
    pub fn new(body: impl Into<String>, sender: impl Into<String>, timestamp_millis: i64) -> Self {
        Self {
            body: body.into(),
            sender: sender.into(),
            timestamp_millis,
        }
    }
}

/// Unit of work held by the durable queue
///
/// Serialized as JSON inside the queue so the attempt count survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseJob {
    pub body: String,
    pub sender: String,
    pub timestamp_millis: i64,
    /// Zero-based count of attempts already made
    #[serde(default)]
    pub attempt: u32,
}

impl ParseJob {
    /// Fresh job for a newly received message
    pub fn from_message(message: RawMessage) -> Self {
        Self {
            body: message.body,
            sender: message.sender,
            timestamp_millis: message.timestamp_millis,
            attempt: 0,
        }
    }

    /// The same job with its attempt counter bumped
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Wire request for this job
    pub fn to_request(&self) -> ParseRequest {
        ParseRequest::new(&self.body, &self.sender, self.timestamp_millis)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Request body for `POST /api/v1/transactions/parse`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseRequest {
    pub sender: String,
    pub body: String,
    /// Reserved for client-supplied dedup keys, always empty today
    pub unique_identifier: String,
    /// Epoch millis of the original message
    pub timestamp: i64,
}

impl ParseRequest {
    pub fn new(body: &str, sender: &str, timestamp_millis: i64) -> Self {
        Self {
            sender: sender.to_string(),
            body: body.to_string(),
            unique_identifier: String::new(),
            timestamp: timestamp_millis,
        }
    }
}

/// Outcome reported by the parsing service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParseStatus {
    /// A new transaction draft was created server-side
    Created,
    /// The message was already seen; no new draft
    Duplicate,
    /// Server-side extraction failed
    Error,
    /// Any other (or missing) status string
    Unknown(String),
}

impl ParseStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ParseStatus::Created => "CREATED",
            ParseStatus::Duplicate => "DUPLICATE",
            ParseStatus::Error => "ERROR",
            ParseStatus::Unknown(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ParseStatus::Created)
    }
}

impl Default for ParseStatus {
    fn default() -> Self {
        ParseStatus::Unknown(String::new())
    }
}

impl From<String> for ParseStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CREATED" => ParseStatus::Created,
            "DUPLICATE" => ParseStatus::Duplicate,
            "ERROR" => ParseStatus::Error,
            _ => ParseStatus::Unknown(value),
        }
    }
}

impl From<ParseStatus> for String {
    fn from(status: ParseStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Structured transaction extracted by the service
///
/// The schema belongs to the service, so the payload is kept verbatim.
/// Accessors cover the fields the service currently emits. Only JSON
/// objects decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ParsedTransaction(pub Value);

impl TryFrom<Value> for ParsedTransaction {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err(format!("parsedTransaction must be an object, got {}", value))
        }
    }
}

impl From<ParsedTransaction> for Value {
    fn from(transaction: ParsedTransaction) -> Self {
        transaction.0
    }
}

impl ParsedTransaction {
    fn text(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn bank(&self) -> Option<&str> {
        self.text("bank")
    }

    pub fn amount(&self) -> Option<&str> {
        self.text("amount")
    }

    pub fn merchant(&self) -> Option<&str> {
        self.text("merchant")
    }

    pub fn last_four(&self) -> Option<&str> {
        self.text("lastFour")
    }

    pub fn date_time(&self) -> Option<&str> {
        self.text("dateTime")
    }

    pub fn available_limit(&self) -> Option<&str> {
        self.text("availableLimit")
    }

    pub fn reference_id(&self) -> Option<&str> {
        self.text("referenceId")
    }

    pub fn confidence(&self) -> Option<f64> {
        self.0.get("confidence").and_then(Value::as_f64)
    }
}

/// Response body of the parse endpoint
///
/// Must be a JSON object. Every field is optional on the wire; absent
/// fields take their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Map<String, Value>")]
pub struct ParseResponse {
    pub status: ParseStatus,
    pub unique_identifier: String,
    pub parsed_transaction: Option<ParsedTransaction>,
}

/// Field layout of a response object
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseFields {
    #[serde(default)]
    status: ParseStatus,
    #[serde(default)]
    unique_identifier: String,
    #[serde(default)]
    parsed_transaction: Option<ParsedTransaction>,
}

impl TryFrom<Map<String, Value>> for ParseResponse {
    type Error = serde_json::Error;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let fields: ResponseFields = serde_json::from_value(Value::Object(fields))?;
        Ok(Self {
            status: fields.status,
            unique_identifier: fields.unique_identifier,
            parsed_transaction: fields.parsed_transaction,
        })
    }
}

impl ParseResponse {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
