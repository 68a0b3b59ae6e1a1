use serde::{Deserialize, Serialize};

use crate::error::AsrError;

/// Configuration for a realtime recognition session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// WebSocket inference endpoint.
    pub endpoint: String,
    /// DashScope API key (Bearer credential).
    pub api_key: String,
    /// Recognition model name.
    pub model: String,
    /// Language hints for recognition (e.g. "zh", "en").
    pub language_hints: Vec<String>,
    /// PCM sample rate in Hz. The service expects 16 kHz mono s16le.
    pub sample_rate: u32,
    /// How long to wait for task-started before failing the session.
    pub start_timeout_ms: u64,
    /// Silence (ms) after which the service closes the current sentence.
    pub max_sentence_silence_ms: u32,
    pub punctuation_prediction_enabled: bool,
    pub inverse_text_normalization_enabled: bool,
    /// Capacity of the outbound audio frame queue.
    pub frame_queue_capacity: usize,
    /// Capacity of the transcript event queue.
    pub event_queue_capacity: usize,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://dashscope.aliyuncs.com/api-ws/v1/inference".to_string(),
            api_key: String::new(),
            model: "paraformer-realtime-v2".to_string(),
            language_hints: vec!["zh".to_string()],
            sample_rate: 16_000,
            start_timeout_ms: 10_000,
            max_sentence_silence_ms: 800,
            punctuation_prediction_enabled: true,
            inverse_text_normalization_enabled: true,
            frame_queue_capacity: 64,
            event_queue_capacity: 64,
        }
    }
}

impl AsrConfig {
    /// Loads configuration from `VOICEKIT__ASR__*` environment variables,
    /// reading a `.env` file first when one is present.
    pub fn from_env() -> Result<Self, AsrError> {
        dotenvy::dotenv().ok();
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("VOICEKIT__ASR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("language_hints"),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| AsrError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = AsrConfig::default();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.start_timeout_ms, 10_000);
        assert_eq!(config.max_sentence_silence_ms, 800);
        assert_eq!(config.model, "paraformer-realtime-v2");
        assert!(config.endpoint.starts_with("wss://"));
        assert!(config.punctuation_prediction_enabled);
        assert!(config.inverse_text_normalization_enabled);
    }
}
