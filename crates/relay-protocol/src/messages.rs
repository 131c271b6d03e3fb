use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    ConnectionId, ConsumerDescriptor, ConsumerId, DtlsParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportOptions,
};

/// Outer frame of every message: `{ "type": ..., "data": ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Why an inbound frame could not be turned into a [`ClientMessage`]
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or JSON without a string `type`
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Known `type` whose `data` does not have the expected shape
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default)]
    pub rtp_capabilities: Option<RtpCapabilities>,
    /// Producer to consume; the most recent live producer when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ProducerId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    /// Consumer to resume; the connection's most recent consumer when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<ConsumerId>,
}

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    GetRouterRtpCapabilities,

    /// Request to create the send transport
    GetProducerRtpCapabilities,

    ConnectProducerTransport(ConnectTransportRequest),

    Produce(ProduceRequest),

    CreateConsumerTransport,

    ConnectConsumerTransport(ConnectTransportRequest),

    Consume(ConsumeRequest),

    Resume(ResumeRequest),
}

impl ClientMessage {
    /// Parse a raw text frame
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, DecodeError> {
        let Envelope { kind, data } = envelope;

        fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
            serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload {
                kind: kind.to_string(),
                source,
            })
        }

        fn optional_payload<T: serde::de::DeserializeOwned + Default>(
            kind: &str,
            data: Value,
        ) -> Result<T, DecodeError> {
            if data.is_null() {
                Ok(T::default())
            } else {
                payload(kind, data)
            }
        }

        let message = match kind.as_str() {
            "getRouterRtpCapabilities" => ClientMessage::GetRouterRtpCapabilities,
            "getProducerRtpCapabilities" => ClientMessage::GetProducerRtpCapabilities,
            "connectProducerTransport" => ClientMessage::ConnectProducerTransport(payload(&kind, data)?),
            "produce" => ClientMessage::Produce(payload(&kind, data)?),
            "createConsumerTransport" => ClientMessage::CreateConsumerTransport,
            "connectConsumerTransport" => ClientMessage::ConnectConsumerTransport(payload(&kind, data)?),
            "consume" => ClientMessage::Consume(optional_payload(&kind, data)?),
            "resume" => ClientMessage::Resume(optional_payload(&kind, data)?),
            _ => return Err(DecodeError::UnknownType(kind)),
        };

        Ok(message)
    }

    /// Wire name of the message
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientMessage::GetProducerRtpCapabilities => "getProducerRtpCapabilities",
            ClientMessage::ConnectProducerTransport(_) => "connectProducerTransport",
            ClientMessage::Produce(_) => "produce",
            ClientMessage::CreateConsumerTransport => "createConsumerTransport",
            ClientMessage::ConnectConsumerTransport(_) => "connectConsumerTransport",
            ClientMessage::Consume(_) => "consume",
            ClientMessage::Resume(_) => "resume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerAnnouncement {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerClosedNotice {
    pub id: ProducerId,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Greeting sent once on accept
    Welcome(Welcome),

    RouterCapabilities(RtpCapabilities),

    CreateProducerTransport(TransportOptions),

    ProducerConnected(String),

    Produced(ProducerId),

    /// Another connection started producing
    NewProducer(ProducerAnnouncement),

    /// A producer went away together with its connection or transport
    ProducerClosed(ProducerClosedNotice),

    CreateConsumerTransport(TransportOptions),

    ConsumerConnected(String),

    Subscribed(ConsumerDescriptor),

    Resumed(String),

    Error(String),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(message.into())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Welcome(_) => "welcome",
            ServerMessage::RouterCapabilities(_) => "routerCapabilities",
            ServerMessage::CreateProducerTransport(_) => "createProducerTransport",
            ServerMessage::ProducerConnected(_) => "producerConnected",
            ServerMessage::Produced(_) => "produced",
            ServerMessage::NewProducer(_) => "newProducer",
            ServerMessage::ProducerClosed(_) => "producerClosed",
            ServerMessage::CreateConsumerTransport(_) => "createConsumerTransport",
            ServerMessage::ConsumerConnected(_) => "consumerConnected",
            ServerMessage::Subscribed(_) => "subscribed",
            ServerMessage::Resumed(_) => "resumed",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_unit_messages_with_or_without_data() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"getRouterRtpCapabilities"}"#),
            Ok(ClientMessage::GetRouterRtpCapabilities)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"createConsumerTransport","data":{"forceTcp":false}}"#),
            Ok(ClientMessage::CreateConsumerTransport)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"resume"}"#),
            Ok(ClientMessage::Resume(ResumeRequest { consumer_id: None }))
        ));
    }

    #[test]
    fn test_parse_produce() {
        let text = json!({
            "type": "produce",
            "data": {
                "kind": "video",
                "rtpParameters": {
                    "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }],
                    "encodings": [{ "ssrc": 42 }]
                }
            }
        })
        .to_string();

        match ClientMessage::parse(&text).unwrap() {
            ClientMessage::Produce(request) => {
                assert_eq!(request.kind, MediaKind::Video);
                assert_eq!(request.rtp_parameters.codecs[0].payload_type, 101);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_distinguishes_failure_kinds() {
        assert!(matches!(
            ClientMessage::parse("not json at all"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"data":{}}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"dance"}"#),
            Err(DecodeError::UnknownType(kind)) if kind == "dance"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"produce","data":{"kind":"smell"}}"#),
            Err(DecodeError::InvalidPayload { kind, .. }) if kind == "produce"
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"connectProducerTransport"}"#),
            Err(DecodeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_consume_without_capabilities_still_parses() {
        for frame in [r#"{"type":"consume","data":{}}"#, r#"{"type":"consume"}"#] {
            match ClientMessage::parse(frame).unwrap() {
                ClientMessage::Consume(request) => {
                    assert!(request.rtp_capabilities.is_none());
                    assert!(request.producer_id.is_none());
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[test]
    fn test_server_message_envelope() {
        let id = ProducerId::new();
        let value = serde_json::to_value(ServerMessage::Produced(id)).unwrap();
        assert_eq!(value, json!({ "type": "produced", "data": id.to_string() }));

        let value = serde_json::to_value(ServerMessage::error("Producer not available")).unwrap();
        assert_eq!(value, json!({ "type": "error", "data": "Producer not available" }));

        let value = serde_json::to_value(ServerMessage::NewProducer(ProducerAnnouncement {
            id,
            kind: MediaKind::Audio,
        }))
        .unwrap();
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["data"]["id"], id.to_string());
        assert_eq!(value["data"]["kind"], "audio");
    }

    #[test]
    fn test_client_message_serializes_as_envelope() {
        let value = serde_json::to_value(ClientMessage::GetProducerRtpCapabilities).unwrap();
        assert_eq!(value, json!({ "type": "getProducerRtpCapabilities" }));

        let value = serde_json::to_value(ClientMessage::Resume(ResumeRequest::default())).unwrap();
        assert_eq!(value, json!({ "type": "resume", "data": {} }));
    }
}
