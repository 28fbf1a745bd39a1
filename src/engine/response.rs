use std::fmt;

use crate::cache::{RegionKind, Snapshot};

pub const OFFLINE_STATUS: u16 = 503;

const OFFLINE_TEXT: &str = "Offline: the dashboard is unreachable and no cached copy is available.";
const OFFLINE_JSON: &str = r#"{"offline":true,"error":"network unavailable"}"#;

/// Where an intercepted response came from. Exposed to pages through the
/// `x-sideline-source` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSource {
    Network,
    Precache,
    Runtime,
    OfflineDocument,
    Synthesized,
}

impl ResponseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Precache => "precache",
            ResponseSource::Runtime => "runtime",
            ResponseSource::OfflineDocument => "offline-document",
            ResponseSource::Synthesized => "synthesized",
        }
    }
}

impl From<RegionKind> for ResponseSource {
    fn from(kind: RegionKind) -> Self {
        match kind {
            RegionKind::Precache => ResponseSource::Precache,
            RegionKind::Runtime => ResponseSource::Runtime,
        }
    }
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body shape of the synthesized last-resort response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineFlavor {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub snapshot: Snapshot,
    pub source: ResponseSource,
}

impl EngineResponse {
    pub fn new(snapshot: Snapshot, source: ResponseSource) -> Self {
        Self { snapshot, source }
    }

    pub fn network(snapshot: Snapshot) -> Self {
        Self::new(snapshot, ResponseSource::Network)
    }

    /// The fixed unavailable response used when nothing else is left.
    pub fn offline(flavor: OfflineFlavor) -> Self {
        let (content_type, body) = match flavor {
            OfflineFlavor::Text => ("text/plain; charset=utf-8", OFFLINE_TEXT),
            OfflineFlavor::Json => ("application/json", OFFLINE_JSON),
        };
        let snapshot = Snapshot::new(
            OFFLINE_STATUS,
            vec![
                ("content-type".to_string(), content_type.to_string()),
                ("cache-control".to_string(), "no-store".to_string()),
            ],
            body,
        );
        Self::new(snapshot, ResponseSource::Synthesized)
    }

    pub fn is_synthesized(&self) -> bool {
        self.source == ResponseSource::Synthesized
    }
}
