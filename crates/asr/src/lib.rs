//! Realtime duplex streaming client for the DashScope speech-recognition API.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
mod worker;

pub use config::AsrConfig;
pub use error::AsrError;
pub use session::{EventReceiver, SessionStatus, SpeechSession};
pub use transport::{AsrTransport, TransportEvent, WsTransport};

use serde::{Deserialize, Serialize};

/// A chunk of raw audio handed to the session by the capture pipeline.
///
/// Ownership transfers into the outbound queue; the payload is released
/// after transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Little-endian 16-bit mono PCM bytes.
    pub data: Vec<u8>,
    /// Number of samples in `data`.
    pub samples: usize,
}

impl AudioFrame {
    /// Wraps already-encoded s16le bytes.
    pub fn new(data: Vec<u8>) -> Self {
        let samples = data.len() / 2;
        Self { data, samples }
    }

    /// Encodes 16-bit samples as the little-endian payload the service expects.
    pub fn from_pcm(samples: &[i16]) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self {
            data,
            samples: samples.len(),
        }
    }
}

/// A transcript emitted by the recognition service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    /// Whether this is a final transcript or an interim (growing) result.
    pub is_final: bool,
    pub language: Option<String>,
    pub confidence: Option<f64>,
}
