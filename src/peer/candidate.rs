//! ICE Candidates und ICE Server

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Öffentliche Google STUN Server
pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

pub fn default_stun_urls() -> Vec<String> {
    DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect()
}

/// Baut die ICE-Server-Liste für die Peer Connection
pub fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

/// ICE Candidate wie er über das Signaling läuft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDescriptor {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl CandidateDescriptor {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for CandidateDescriptor {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateDescriptor> for RTCIceCandidateInit {
    fn from(descriptor: CandidateDescriptor) -> Self {
        RTCIceCandidateInit {
            candidate: descriptor.candidate,
            sdp_mid: descriptor.sdp_mid,
            sdp_mline_index: descriptor.sdp_mline_index,
            username_fragment: descriptor.username_fragment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_wire_names() {
        let candidate = CandidateDescriptor {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_ice_servers_from_urls() {
        let servers = ice_servers(&default_stun_urls());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 3);
        assert!(ice_servers(&[]).is_empty());
    }
}
