//! Message envelope for the duplex recognition protocol.
//!
//! Outbound commands (`run-task`, `finish-task`) go out as text frames;
//! audio goes out as raw binary frames with no extra framing. Inbound
//! events arrive as text frames and are decoded into [`InboundEvent`].

use serde::Deserialize;
use serde_json::json;

use crate::config::AsrConfig;
use crate::error::AsrError;

/// Builds the `run-task` command that opens a recognition task.
pub fn run_task(task_id: &str, config: &AsrConfig) -> String {
    json!({
        "header": {
            "action": "run-task",
            "task_id": task_id,
            "streaming": "duplex",
        },
        "payload": {
            "task_group": "audio",
            "task": "asr",
            "function": "recognition",
            "model": config.model,
            "parameters": {
                "format": "pcm",
                "sample_rate": config.sample_rate,
                "language_hints": config.language_hints,
                "disfluency_removal_enabled": false,
                "semantic_punctuation_enabled": false,
                "punctuation_prediction_enabled": config.punctuation_prediction_enabled,
                "inverse_text_normalization_enabled": config.inverse_text_normalization_enabled,
                "max_sentence_silence": config.max_sentence_silence_ms,
            },
            "input": {},
        },
    })
    .to_string()
}

/// Builds the `finish-task` command that ends the audio stream.
pub fn finish_task(task_id: &str) -> String {
    json!({
        "header": {
            "action": "finish-task",
            "task_id": task_id,
            "streaming": "duplex",
        },
        "payload": {
            "input": {},
        },
    })
    .to_string()
}

/// One recognized sentence, possibly still growing.
#[derive(Debug, Clone, Deserialize)]
pub struct Sentence {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sentence_end: bool,
    /// Keepalive marker; carries no transcript.
    #[serde(default)]
    pub heartbeat: bool,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A decoded inbound service event.
#[derive(Debug)]
pub enum InboundEvent {
    TaskStarted {
        task_id: Option<String>,
    },
    ResultGenerated {
        sentence: Option<Sentence>,
    },
    TaskFinished,
    TaskFailed {
        code: String,
        message: String,
    },
    /// Event name this client does not handle; skipped by the receiver.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    header: InboundHeader,
    #[serde(default)]
    payload: InboundPayload,
}

#[derive(Debug, Deserialize)]
struct InboundHeader {
    event: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundPayload {
    #[serde(default)]
    output: Option<Output>,
}

#[derive(Debug, Deserialize)]
struct Output {
    #[serde(default)]
    sentence: Option<Sentence>,
}

/// Decodes an inbound text frame.
///
/// Undecodable frames violate the remote contract and are fatal for the
/// current task.
pub fn parse_inbound(text: &str) -> Result<InboundEvent, AsrError> {
    let message: InboundMessage = serde_json::from_str(text)
        .map_err(|e| AsrError::Protocol(format!("undecodable message: {e}")))?;

    Ok(match message.header.event.as_str() {
        "task-started" => InboundEvent::TaskStarted {
            task_id: message.header.task_id,
        },
        "result-generated" => InboundEvent::ResultGenerated {
            sentence: message.payload.output.and_then(|o| o.sentence),
        },
        "task-finished" => InboundEvent::TaskFinished,
        "task-failed" => InboundEvent::TaskFailed {
            code: message.header.error_code.unwrap_or_else(|| "unknown".to_string()),
            message: message.header.error_message.unwrap_or_default(),
        },
        other => InboundEvent::Unknown(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn run_task_envelope() {
        let config = AsrConfig::default();
        let msg: Value = serde_json::from_str(&run_task("task-1", &config)).unwrap();

        assert_eq!(msg["header"]["action"], "run-task");
        assert_eq!(msg["header"]["task_id"], "task-1");
        assert_eq!(msg["header"]["streaming"], "duplex");
        assert_eq!(msg["payload"]["task_group"], "audio");
        assert_eq!(msg["payload"]["task"], "asr");
        assert_eq!(msg["payload"]["function"], "recognition");
        assert_eq!(msg["payload"]["model"], "paraformer-realtime-v2");
        assert_eq!(msg["payload"]["parameters"]["format"], "pcm");
        assert_eq!(msg["payload"]["parameters"]["sample_rate"], 16_000);
        assert_eq!(msg["payload"]["parameters"]["language_hints"][0], "zh");
        assert_eq!(msg["payload"]["parameters"]["max_sentence_silence"], 800);
        assert!(msg["payload"]["input"].as_object().unwrap().is_empty());
    }

    #[test]
    fn finish_task_envelope() {
        let msg: Value = serde_json::from_str(&finish_task("task-2")).unwrap();
        assert_eq!(msg["header"]["action"], "finish-task");
        assert_eq!(msg["header"]["task_id"], "task-2");
        assert_eq!(msg["header"]["streaming"], "duplex");
        assert!(msg["payload"]["input"].as_object().unwrap().is_empty());
    }

    #[test]
    fn parses_task_started() {
        let event = parse_inbound(r#"{"header": {"event": "task-started", "task_id": "t"}}"#)
            .unwrap();
        assert!(matches!(event, InboundEvent::TaskStarted { task_id: Some(id) } if id == "t"));
    }

    #[test]
    fn parses_result_sentence() {
        let event = parse_inbound(
            r#"{
                "header": {"event": "result-generated", "task_id": "t"},
                "payload": {"output": {"sentence": {"text": "你好", "sentence_end": true}}}
            }"#,
        )
        .unwrap();
        let InboundEvent::ResultGenerated { sentence: Some(sentence) } = event else {
            panic!("expected a sentence, got {event:?}");
        };
        assert_eq!(sentence.text, "你好");
        assert!(sentence.sentence_end);
        assert!(!sentence.heartbeat);
        assert!(sentence.confidence.is_none());
    }

    #[test]
    fn parses_task_failed_diagnostics() {
        let event = parse_inbound(
            r#"{"header": {"event": "task-failed", "task_id": "t",
                "error_code": "InvalidParameter", "error_message": "bad sample rate"}}"#,
        )
        .unwrap();
        let InboundEvent::TaskFailed { code, message } = event else {
            panic!("expected task-failed, got {event:?}");
        };
        assert_eq!(code, "InvalidParameter");
        assert_eq!(message, "bad sample rate");
    }

    #[test]
    fn unknown_event_is_not_fatal() {
        let event = parse_inbound(r#"{"header": {"event": "speech-detected"}}"#).unwrap();
        assert!(matches!(event, InboundEvent::Unknown(name) if name == "speech-detected"));
    }

    #[test]
    fn malformed_message_is_a_protocol_error() {
        let err = parse_inbound("not json").unwrap_err();
        assert!(matches!(err, AsrError::Protocol(_)));

        let err = parse_inbound(r#"{"no_header": true}"#).unwrap_err();
        assert!(matches!(err, AsrError::Protocol(_)));
    }
}
