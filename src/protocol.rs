//! Wire codec for the worker subprocess.
//!
//! The worker speaks newline-delimited JSON: commands flow to its stdin, one
//! object per line tagged with `"command"`; events flow back on its stdout
//! tagged with `"event"`. The schema is flat and versionless; changes require
//! a coordinated update of the worker binary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Commands written to the worker, one per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Init,
    StartRecording,
    StopAndTranscribe { audio_path: PathBuf },
    CancelCurrent,
    SetConfig { config: WorkerConfig },
    Healthcheck,
    Shutdown,
}

/// Runtime options forwarded with `set_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub language_mode: String,
    pub popup_timeout_sec: u64,
}

/// Events parsed from the worker's stdout, one per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready {
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    RecordingStarted,
    RecordingStopped,
    PartialTranscript {
        text: String,
    },
    FinalTranscript {
        text: String,
    },
    JobCancelled,
    Error {
        message: String,
    },
    Metrics {
        #[serde(default)]
        latency_ms: Option<u64>,
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
}

/// A line from the worker that does not parse as an event. Non-fatal: the
/// reader logs it and keeps going.
#[derive(Debug, Error)]
#[error("unparseable worker line {line:?}: {source}")]
pub struct ProtocolError {
    pub line: String,
    #[source]
    pub source: serde_json::Error,
}

/// Serialize a command as a single wire line, trailing newline included.
pub fn encode_command(cmd: &Command) -> String {
    // Command serialization cannot fail: no maps with non-string keys, no
    // non-finite floats.
    let mut line = serde_json::to_string(cmd).expect("command is always serializable");
    line.push('\n');
    line
}

/// Parse one stdout line into an event. Tolerates trailing CR from Windows
/// pipes; the caller is expected to skip empty lines.
pub fn parse_event(line: &str) -> Result<WorkerEvent, ProtocolError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    serde_json::from_str(trimmed).map_err(|source| ProtocolError {
        line: trimmed.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_the_sidecar_wire_tags() {
        assert_eq!(encode_command(&Command::Init), "{\"command\":\"init\"}\n");
        assert_eq!(
            encode_command(&Command::StartRecording),
            "{\"command\":\"start_recording\"}\n"
        );
        let stop = Command::StopAndTranscribe {
            audio_path: PathBuf::from("/tmp/take.wav"),
        };
        assert_eq!(
            encode_command(&stop),
            "{\"command\":\"stop_and_transcribe\",\"audio_path\":\"/tmp/take.wav\"}\n"
        );
    }

    #[test]
    fn set_config_carries_the_config_payload() {
        let cmd = Command::SetConfig {
            config: WorkerConfig {
                language_mode: "ru".into(),
                popup_timeout_sec: 10,
            },
        };
        let line = encode_command(&cmd);
        assert!(line.contains("\"command\":\"set_config\""));
        assert!(line.contains("\"language_mode\":\"ru\""));
        assert!(line.contains("\"popup_timeout_sec\":10"));
    }

    #[test]
    fn parses_lifecycle_events() {
        assert_eq!(
            parse_event("{\"event\":\"recording_started\"}").unwrap(),
            WorkerEvent::RecordingStarted
        );
        assert_eq!(
            parse_event("{\"event\":\"partial_transcript\",\"text\":\"hel\"}").unwrap(),
            WorkerEvent::PartialTranscript { text: "hel".into() }
        );
        assert_eq!(
            parse_event("{\"event\":\"final_transcript\",\"text\":\"hello\"}\r\n").unwrap(),
            WorkerEvent::FinalTranscript {
                text: "hello".into()
            }
        );
    }

    #[test]
    fn ready_and_metrics_fields_are_optional() {
        let ready = parse_event("{\"event\":\"ready\"}").unwrap();
        assert_eq!(
            ready,
            WorkerEvent::Ready {
                device: None,
                model: None
            }
        );

        let metrics =
            parse_event("{\"event\":\"metrics\",\"latency_ms\":420,\"device\":\"cuda\"}").unwrap();
        assert_eq!(
            metrics,
            WorkerEvent::Metrics {
                latency_ms: Some(420),
                device: Some("cuda".into()),
                model: None,
            }
        );
    }

    #[test]
    fn malformed_and_unknown_lines_are_distinct_errors_not_panics() {
        let err = parse_event("not json at all").unwrap_err();
        assert_eq!(err.line, "not json at all");

        // Valid JSON but an unknown tag is still a protocol error.
        assert!(parse_event("{\"event\":\"telepathy\"}").is_err());
        // Missing required field.
        assert!(parse_event("{\"event\":\"final_transcript\"}").is_err());
    }
}
