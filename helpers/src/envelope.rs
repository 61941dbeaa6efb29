use std::{collections::HashMap, fmt};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Queue payloads are URL-safe base64; peers are inconsistent about
// `=` padding so decoding must tolerate both forms.
const URL_SAFE_TOLERANT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encodes bytes as padded URL-safe base64 for a queue envelope field.
pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE_TOLERANT.encode(data)
}

/// Decodes a URL-safe base64 envelope field, tolerating missing padding.
pub fn b64_decode(value: &str) -> Result<Vec<u8>, EnvelopeError> {
    URL_SAFE_TOLERANT
        .decode(value.as_bytes())
        .map_err(EnvelopeError::Base64)
}

/// The target service of an outbound job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEndpoint {
    pub url: String,
}

/// An outbound delivery job as stored on the outbound queue and the
/// delayed-retry sorted set.
///
/// `retries` counts the delivery attempts that have already failed and only
/// ever grows; a job is destroyed on successful dispatch or once the retry
/// budget is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundJob {
    pub service: ServiceEndpoint,
    /// URL-safe base64 of the wire payload bytes.
    pub payload: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub retries: u32,
}

impl OutboundJob {
    pub fn new(url: &str, payload: &[u8], headers: HashMap<String, String>) -> Self {
        OutboundJob {
            service: ServiceEndpoint {
                url: url.to_string(),
            },
            payload: b64_encode(payload),
            headers,
            retries: 0,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Json)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Json)
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        b64_decode(&self.payload)
    }

    /// The URL scheme of the target endpoint, used to select the dispatch
    /// transport.
    pub fn endpoint_scheme(&self) -> Option<&str> {
        self.service
            .url
            .split_once("://")
            .map(|(scheme, _)| scheme)
    }
}

/// The wire transport an inbound message arrived on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TransportType {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "ws")]
    Ws,
}

/// An inbound message as enqueued for the agent.
///
/// `txn_id` is present iff the sender requested a direct response; the
/// envelope's lifetime ends when the agent dequeues it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    /// URL-safe base64 of the wire payload bytes.
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
    pub transport_type: TransportType,
}

impl InboundEnvelope {
    pub fn new(payload: &[u8], txn_id: Option<String>, transport_type: TransportType) -> Self {
        InboundEnvelope {
            payload: b64_encode(payload),
            txn_id,
            transport_type,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Json)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Json)
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        b64_decode(&self.payload)
    }
}

/// The body of a direct response produced by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseData {
    /// URL-safe base64 of the response bytes.
    pub response: String,
    #[serde(rename = "content-type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A synchronous response record, produced by the agent and consumed
/// exactly once by the relay instance holding the originating connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectResponse {
    pub txn_id: String,
    pub response_data: ResponseData,
}

impl DirectResponse {
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Json)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Json)
    }
}

/// Extracts the recipient routing key from a packed message.
///
/// The packed message is JSON with a base64url `protected` header that
/// itself decodes to JSON carrying a `recipients` list; the routing key is
/// the comma-joined `header.kid` of every recipient, in order.
pub fn extract_recipient_key(packed_message: &[u8]) -> Result<String, EnvelopeError> {
    let wrapper: Value = serde_json::from_slice(packed_message).map_err(EnvelopeError::Json)?;
    let protected = wrapper
        .get("protected")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField("protected"))?;

    let decoded = b64_decode(protected)?;
    let protected_header: Value = serde_json::from_slice(&decoded).map_err(EnvelopeError::Json)?;
    let recipients = protected_header
        .get("recipients")
        .and_then(Value::as_array)
        .ok_or(EnvelopeError::MissingField("recipients"))?;

    let kids = recipients
        .iter()
        .map(|recipient| {
            recipient
                .get("header")
                .and_then(|header| header.get("kid"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(EnvelopeError::MissingField("recipients[].header.kid"))
        })
        .collect::<Result<Vec<String>, EnvelopeError>>()?;

    Ok(kids.join(","))
}

/// Provides a custom error type to be used for failures
/// in encoding and decoding queue envelopes.
#[derive(Debug)]
pub enum EnvelopeError {
    Json(serde_json::Error),
    Base64(base64::DecodeError),
    MissingField(&'static str),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EnvelopeError::Json(json_error) => write!(f, "envelope error: {json_error}"),
            EnvelopeError::Base64(decode_error) => write!(f, "envelope error: {decode_error}"),
            EnvelopeError::MissingField(field) => {
                write!(f, "envelope error: missing field `{field}`")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_decodes_base64_with_and_without_padding() {
        let encoded = b64_encode(b"payload?");
        assert_eq!(encoded, "cGF5bG9hZD8=");
        assert_eq!(b64_decode("cGF5bG9hZD8=").unwrap(), b"payload?");
        assert_eq!(b64_decode("cGF5bG9hZD8").unwrap(), b"payload?");
    }

    #[test]
    fn test_outbound_job_round_trip_defaults_retries() {
        let raw = "{\"service\":{\"url\":\"https://agents.example.com/endpoint\"},\
            \"payload\":\"eA==\",\"headers\":{\"x-api-key\":\"secret\"}}";
        let job = OutboundJob::from_json(raw).unwrap();
        assert_eq!(job.service.url, "https://agents.example.com/endpoint");
        assert_eq!(job.payload_bytes().unwrap(), b"x");
        assert_eq!(job.retries, 0);
        assert_eq!(job.endpoint_scheme(), Some("https"));
    }

    #[test]
    fn test_outbound_job_missing_service_url_is_rejected() {
        let raw = "{\"payload\":\"eA==\",\"headers\":{}}";
        assert!(matches!(
            OutboundJob::from_json(raw),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn test_inbound_envelope_omits_absent_txn_id() {
        let envelope = InboundEnvelope::new(b"message", None, TransportType::Http);
        let raw = envelope.to_json().unwrap();
        assert!(!raw.contains("txn_id"));
        assert!(raw.contains("\"transport_type\":\"http\""));

        let with_txn =
            InboundEnvelope::new(b"message", Some("txn-1".to_string()), TransportType::Ws);
        let decoded = InboundEnvelope::from_json(&with_txn.to_json().unwrap()).unwrap();
        assert_eq!(decoded.txn_id, Some("txn-1".to_string()));
        assert_eq!(decoded.transport_type, TransportType::Ws);
    }

    #[test]
    fn test_direct_response_requires_txn_id_and_response_data() {
        let raw = "{\"response_data\":{\"response\":\"eA==\"}}";
        assert!(matches!(
            DirectResponse::from_json(raw),
            Err(EnvelopeError::Json(_))
        ));

        let raw = "{\"txn_id\":\"txn-1\",\"response_data\":\
            {\"response\":\"eA==\",\"content-type\":\"application/json\"}}";
        let record = DirectResponse::from_json(raw).unwrap();
        assert_eq!(
            record.response_data.content_type,
            Some("application/json".to_string())
        );
    }

    fn packed_message_for(kids: &[&str]) -> Vec<u8> {
        let recipients = kids
            .iter()
            .map(|kid| serde_json::json!({"header": {"kid": kid}}))
            .collect::<Vec<Value>>();
        let protected = serde_json::json!({"recipients": recipients});
        let wrapper = serde_json::json!({
            "protected": b64_encode(protected.to_string().as_bytes()),
            "iv": "aXY=",
            "ciphertext": "Y2lwaGVydGV4dA==",
        });
        wrapper.to_string().into_bytes()
    }

    #[test]
    fn test_extracts_single_recipient_key() {
        let packed = packed_message_for(&["BDg8S6gkvnwDB75v5royCE1XrWn42Spx885aV7cxaNJL"]);
        assert_eq!(
            extract_recipient_key(&packed).unwrap(),
            "BDg8S6gkvnwDB75v5royCE1XrWn42Spx885aV7cxaNJL"
        );
    }

    #[test]
    fn test_joins_multiple_recipient_keys_in_order() {
        let packed = packed_message_for(&["key-one", "key-two"]);
        assert_eq!(extract_recipient_key(&packed).unwrap(), "key-one,key-two");
    }

    #[test]
    fn test_recipient_extraction_surfaces_parse_failures() {
        assert!(matches!(
            extract_recipient_key(b"not json"),
            Err(EnvelopeError::Json(_))
        ));
        assert!(matches!(
            extract_recipient_key(b"{\"no_protected\":true}"),
            Err(EnvelopeError::MissingField("protected"))
        ));
    }
}
