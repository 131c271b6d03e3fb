//! Codec capability computation and matching

use super::EngineError;
use relay_protocol::{
    MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpParameters,
};

/// First dynamic payload type handed out to router codecs
const FIRST_PAYLOAD_TYPE: u8 = 100;

pub fn is_rtx(mime_type: &str) -> bool {
    mime_type
        .split_once('/')
        .map(|(_, name)| name.eq_ignore_ascii_case("rtx"))
        .unwrap_or(false)
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind: Some(kind),
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
        direction: Some("sendrecv".to_string()),
    };

    vec![
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(
            MediaKind::Audio,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            5,
        ),
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
    ]
}

/// Builds the router capability set from the configured media codecs.
///
/// Configured parameters are kept verbatim; payload types and RTCP feedback are
/// filled in where the configuration leaves them out.
pub fn build_router_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities, EngineError> {
    if media_codecs.is_empty() {
        return Err(EngineError::UnsupportedCodec("no media codecs configured".to_string()));
    }

    let mut codecs: Vec<RtpCodecCapability> = Vec::with_capacity(media_codecs.len());
    let mut next_payload_type = Some(FIRST_PAYLOAD_TYPE);

    for codec in media_codecs {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} is not a {} codec",
                codec.mime_type, codec.kind
            )));
        }
        if codecs.iter().any(|existing| existing.same_codec(codec)) {
            return Err(EngineError::UnsupportedCodec(format!(
                "duplicate codec {}",
                codec.mime_type
            )));
        }

        let payload_type = match codec.preferred_payload_type {
            Some(pt) => pt,
            None => {
                let exhausted =
                    || EngineError::UnsupportedCodec("no dynamic payload type left".to_string());
                let mut pt = next_payload_type.ok_or_else(exhausted)?;
                while codecs.iter().any(|c| c.preferred_payload_type == Some(pt)) {
                    pt = pt.checked_add(1).ok_or_else(exhausted)?;
                }
                next_payload_type = pt.checked_add(1);
                pt
            }
        };

        let mut codec = codec.clone();
        codec.preferred_payload_type = Some(payload_type);
        if codec.rtcp_feedback.is_empty() {
            codec.rtcp_feedback = default_rtcp_feedback(codec.kind);
        }
        codecs.push(codec);
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: default_header_extensions(),
    })
}

/// Router codec a producer codec maps onto
pub fn find_router_codec<'a>(
    router: &'a RtpCapabilities,
    codec: &RtpCodecParameters,
) -> Option<&'a RtpCodecCapability> {
    router.codecs.iter().find(|c| c.matches(codec))
}

/// Remote codec able to receive `codec` of the given kind
pub fn find_remote_codec<'a>(
    remote: &'a RtpCapabilities,
    kind: MediaKind,
    codec: &RtpCodecParameters,
) -> Option<&'a RtpCodecCapability> {
    remote
        .codecs
        .iter()
        .find(|c| c.kind == kind && c.matches(codec))
}

/// Whether `remote` can receive at least one media codec of the producer
pub fn shares_codec(remote: &RtpCapabilities, kind: MediaKind, producer: &RtpParameters) -> bool {
    producer
        .codecs
        .iter()
        .filter(|codec| !is_rtx(&codec.mime_type))
        .any(|codec| find_remote_codec(remote, kind, codec).is_some())
}

/// RTP parameters of a consumer for `producer`, as seen by the `remote` endpoint.
///
/// Returns `None` when no codec is shared.
pub fn consumer_rtp_parameters(
    router: &RtpCapabilities,
    kind: MediaKind,
    producer: &RtpParameters,
    remote: &RtpCapabilities,
    ssrc: u32,
) -> Option<RtpParameters> {
    let (producer_codec, remote_codec) = producer
        .codecs
        .iter()
        .filter(|codec| !is_rtx(&codec.mime_type))
        .find_map(|codec| find_remote_codec(remote, kind, codec).map(|remote| (codec, remote)))?;

    let router_codec = find_router_codec(router, producer_codec);

    let payload_type = remote_codec
        .preferred_payload_type
        .or_else(|| router_codec.and_then(|c| c.preferred_payload_type))
        .unwrap_or(producer_codec.payload_type);

    // Only feedback both ends understand
    let rtcp_feedback = match router_codec {
        Some(router_codec) => remote_codec
            .rtcp_feedback
            .iter()
            .filter(|fb| router_codec.rtcp_feedback.contains(fb))
            .cloned()
            .collect(),
        None => remote_codec.rtcp_feedback.clone(),
    };

    let mut parameters = producer_codec.parameters.clone();
    if let Some(router_codec) = router_codec {
        for (key, value) in &router_codec.parameters {
            parameters.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    let header_extensions = producer
        .header_extensions
        .iter()
        .filter(|ext| {
            remote
                .header_extensions
                .iter()
                .any(|r| r.uri == ext.uri && r.kind.is_none_or(|k| k == kind))
        })
        .cloned()
        .collect();

    Some(RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters {
            mime_type: producer_codec.mime_type.clone(),
            payload_type,
            clock_rate: producer_codec.clock_rate,
            channels: producer_codec.channels,
            parameters,
            rtcp_feedback,
        }],
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: producer.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::CodecParameters;
    use serde_json::json;

    fn configured() -> Vec<RtpCodecCapability> {
        let mut vp8_params = CodecParameters::new();
        vp8_params.insert("x-google-start-bitrate".to_string(), json!(1000));
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: None,
                clock_rate: 48000,
                channels: Some(2),
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: None,
                clock_rate: 90000,
                channels: None,
                parameters: vp8_params,
                rtcp_feedback: vec![],
            },
        ]
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![RtcpFeedback::new("nack", "")],
            }],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1234),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("client".to_string()),
                reduced_size: true,
            },
        }
    }

    #[test]
    fn test_router_capabilities_keep_configured_codecs() {
        let caps = build_router_capabilities(&configured()).unwrap();

        assert_eq!(caps.codecs.len(), 2);
        assert_eq!(caps.codecs[0].mime_type, "audio/opus");
        assert_eq!(caps.codecs[0].clock_rate, 48000);
        assert_eq!(caps.codecs[0].channels, Some(2));
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].mime_type, "video/VP8");
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert_eq!(caps.codecs[1].parameters["x-google-start-bitrate"], json!(1000));
        assert!(caps.codecs[1].rtcp_feedback.contains(&RtcpFeedback::new("nack", "pli")));
        assert!(!caps.header_extensions.is_empty());
    }

    #[test]
    fn test_router_capabilities_reject_bad_config() {
        assert!(build_router_capabilities(&[]).is_err());

        let mut codecs = configured();
        codecs[0].kind = MediaKind::Video;
        assert!(matches!(
            build_router_capabilities(&codecs),
            Err(EngineError::UnsupportedCodec(_))
        ));

        let mut codecs = configured();
        codecs.push(codecs[1].clone());
        assert!(build_router_capabilities(&codecs).is_err());
    }

    #[test]
    fn test_payload_types_run_out() {
        let codecs: Vec<RtpCodecCapability> = (0..200)
            .map(|i| RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: None,
                clock_rate: 90000 + i,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: vec![],
            })
            .collect();

        assert!(build_router_capabilities(&codecs[..156]).is_ok());
        assert!(matches!(
            build_router_capabilities(&codecs),
            Err(EngineError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_shares_codec() {
        let router = build_router_capabilities(&configured()).unwrap();
        assert!(shares_codec(&router, MediaKind::Video, &vp8_parameters()));

        let audio_only = RtpCapabilities {
            codecs: vec![router.codecs[0].clone()],
            header_extensions: vec![],
        };
        assert!(!shares_codec(&audio_only, MediaKind::Video, &vp8_parameters()));
    }

    #[test]
    fn test_consumer_parameters_use_remote_payload_type() {
        let router = build_router_capabilities(&configured()).unwrap();
        let mut remote = router.clone();
        remote.codecs[1].preferred_payload_type = Some(120);
        remote.codecs[1].rtcp_feedback = vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("made-up", ""),
        ];

        let params =
            consumer_rtp_parameters(&router, MediaKind::Video, &vp8_parameters(), &remote, 777)
                .unwrap();

        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.codecs[0].payload_type, 120);
        assert_eq!(params.codecs[0].rtcp_feedback, vec![RtcpFeedback::new("nack", "")]);
        assert_eq!(params.codecs[0].parameters["x-google-start-bitrate"], json!(1000));
        assert_eq!(params.encodings[0].ssrc, Some(777));
        assert_eq!(params.rtcp.cname.as_deref(), Some("client"));
    }

    #[test]
    fn test_rtx_is_never_selected() {
        assert!(is_rtx("video/rtx"));
        assert!(is_rtx("video/RTX"));
        assert!(!is_rtx("video/VP8"));
    }
}
