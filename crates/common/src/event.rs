//! Run events and their wire format
//!
//! Every state transition of a run travels as one [`RunEvent`]. On the wire an
//! event is a flat JSON object discriminated by a `type` string:
//!
//! ```text
//! {"type":"step-start","runId":"..","stepId":"..","index":0,"name":"..","ts":1700000000000}
//! {"type":"frame","runId":"..","stepId":"..","url":"..","ts":..}
//! {"type":"step-end","runId":"..","stepId":"..","status":"PASSED","ts":..}
//! {"type":"run-finished","runId":"..","status":"FAILED","video":"..","trace":"..","ts":..}
//! ```
//!
//! Older producers spell the same events differently (`step_start`, `stepEnd`,
//! `screenshot`, `run-complete`, ...). All spellings are folded into one
//! variant while decoding so nothing downstream has to know about aliases.

use serde::{Deserialize, Serialize};

use crate::types::{RunStatus, StepError, StepStatus};
use crate::{Error, Result};

/// Immutable, timestamped fact about a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub enum RunEvent {
    StepStart {
        run_id: String,
        step_id: String,
        index: Option<usize>,
        name: Option<String>,
        ts: i64,
    },
    Frame {
        run_id: String,
        step_id: String,
        url: String,
        ts: i64,
    },
    StepEnd {
        run_id: String,
        step_id: String,
        status: StepStatus,
        index: Option<usize>,
        error: Option<StepError>,
        ts: i64,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        video: Option<String>,
        trace: Option<String>,
        ts: i64,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::StepStart { run_id, .. }
            | RunEvent::Frame { run_id, .. }
            | RunEvent::StepEnd { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            RunEvent::StepStart { step_id, .. }
            | RunEvent::Frame { step_id, .. }
            | RunEvent::StepEnd { step_id, .. } => Some(step_id),
            RunEvent::RunFinished { .. } => None,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            RunEvent::StepStart { ts, .. }
            | RunEvent::Frame { ts, .. }
            | RunEvent::StepEnd { ts, .. }
            | RunEvent::RunFinished { ts, .. } => *ts,
        }
    }

    /// Canonical wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::StepStart { .. } => "step-start",
            RunEvent::Frame { .. } => "frame",
            RunEvent::StepEnd { .. } => "step-end",
            RunEvent::RunFinished { .. } => "run-finished",
        }
    }

    pub fn is_run_finished(&self) -> bool {
        matches!(self, RunEvent::RunFinished { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    StepStart,
    Frame,
    StepEnd,
    RunFinished,
}

/// Map every known spelling of an event type to its canonical kind.
fn canonical_kind(raw: &str) -> Option<EventKind> {
    let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
    match normalized.as_str() {
        "step-start" | "stepstart" | "step-started" => Some(EventKind::StepStart),
        "frame" | "screenshot" | "step-frame" => Some(EventKind::Frame),
        "step-end" | "stepend" | "step-finished" | "step-complete" | "step-completed" => {
            Some(EventKind::StepEnd)
        }
        "run-finished" | "runfinished" | "run-complete" | "run-completed" | "done" => {
            Some(EventKind::RunFinished)
        }
        _ => None,
    }
}

/// Flat wire record of a [`RunEvent`]; every field optional so aliases and
/// omissions can be checked in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "run_id", skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(default, alias = "step_id", skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, alias = "screenshot", skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default, alias = "videoUrl", skip_serializing_if = "Option::is_none")]
    video: Option<String>,
    #[serde(default, alias = "traceUrl", skip_serializing_if = "Option::is_none")]
    trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(default, alias = "timestamp")]
    ts: Option<i64>,
}

/// Step error as producers send it: a bare message, or the persisted
/// `{message, stack?}` shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum WireError {
    Message(String),
    Detail(StepError),
}

impl WireError {
    fn into_step_error(self, stack: Option<String>) -> StepError {
        match self {
            WireError::Message(message) => StepError { message, stack },
            WireError::Detail(error) => StepError {
                stack: error.stack.or(stack),
                ..error
            },
        }
    }
}

fn required<T>(value: Option<T>, field: &str, kind: &str) -> Result<T> {
    value.ok_or_else(|| Error::InvalidEvent(format!("{} event is missing `{}`", kind, field)))
}

impl TryFrom<WireEvent> for RunEvent {
    type Error = Error;

    fn try_from(wire: WireEvent) -> Result<Self> {
        let kind = canonical_kind(&wire.kind)
            .ok_or_else(|| Error::InvalidEvent(format!("unknown event type: {}", wire.kind)))?;
        let label = wire.kind.as_str();
        let run_id = required(wire.run_id, "runId", label)?;
        let ts = required(wire.ts, "ts", label)?;

        let event = match kind {
            EventKind::StepStart => RunEvent::StepStart {
                run_id,
                step_id: required(wire.step_id, "stepId", label)?,
                index: wire.index,
                name: wire.name,
                ts,
            },
            EventKind::Frame => RunEvent::Frame {
                run_id,
                step_id: required(wire.step_id, "stepId", label)?,
                url: required(wire.url, "url", label)?,
                ts,
            },
            EventKind::StepEnd => RunEvent::StepEnd {
                run_id,
                step_id: required(wire.step_id, "stepId", label)?,
                status: required(wire.status, "status", label)?.parse()?,
                index: wire.index,
                error: wire.error.map(|error| error.into_step_error(wire.stack)),
                ts,
            },
            EventKind::RunFinished => {
                let status: RunStatus = required(wire.status, "status", label)?.parse()?;
                if !status.is_terminal() {
                    return Err(Error::InvalidEvent(format!(
                        "run-finished with non-terminal status {}",
                        status
                    )));
                }
                RunEvent::RunFinished {
                    run_id,
                    status,
                    video: wire.video.filter(|v| !v.is_empty()),
                    trace: wire.trace.filter(|v| !v.is_empty()),
                    ts,
                }
            }
        };
        Ok(event)
    }
}

impl From<RunEvent> for WireEvent {
    fn from(event: RunEvent) -> Self {
        let kind = event.kind().to_string();
        match event {
            RunEvent::StepStart { run_id, step_id, index, name, ts } => WireEvent {
                kind,
                run_id: Some(run_id),
                step_id: Some(step_id),
                index,
                name,
                ts: Some(ts),
                ..WireEvent::default()
            },
            RunEvent::Frame { run_id, step_id, url, ts } => WireEvent {
                kind,
                run_id: Some(run_id),
                step_id: Some(step_id),
                url: Some(url),
                ts: Some(ts),
                ..WireEvent::default()
            },
            RunEvent::StepEnd { run_id, step_id, status, index, error, ts } => {
                let (error, stack) = match error {
                    Some(e) => (Some(WireError::Message(e.message)), e.stack),
                    None => (None, None),
                };
                WireEvent {
                    kind,
                    run_id: Some(run_id),
                    step_id: Some(step_id),
                    status: Some(status.to_string()),
                    index,
                    error,
                    stack,
                    ts: Some(ts),
                    ..WireEvent::default()
                }
            }
            RunEvent::RunFinished { run_id, status, video, trace, ts } => WireEvent {
                kind,
                run_id: Some(run_id),
                status: Some(status.to_string()),
                video,
                trace,
                ts: Some(ts),
                ..WireEvent::default()
            },
        }
    }
}

/// One push message from the server to a viewer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Acknowledgement sent when a subscription opens
    Connected { run_id: String },
    Event(RunEvent),
    /// End-of-stream sentinel; the channel closes after it
    End { run_id: String },
}

impl StreamMessage {
    pub fn run_id(&self) -> &str {
        match self {
            StreamMessage::Connected { run_id } | StreamMessage::End { run_id } => run_id,
            StreamMessage::Event(event) => event.run_id(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        match self {
            StreamMessage::Connected { run_id } => {
                Ok(serde_json::json!({ "type": "connected", "runId": run_id }).to_string())
            }
            StreamMessage::End { run_id } => {
                Ok(serde_json::json!({ "type": "end", "runId": run_id }).to_string())
            }
            StreamMessage::Event(event) => event.to_json(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let run_id = value
            .get("runId")
            .and_then(|r| r.as_str())
            .map(str::to_string);
        let missing = || Error::InvalidEvent(format!("{} message is missing `runId`", kind));
        match kind.as_str() {
            "connected" => Ok(StreamMessage::Connected {
                run_id: run_id.ok_or_else(missing)?,
            }),
            "end" => Ok(StreamMessage::End {
                run_id: run_id.ok_or_else(missing)?,
            }),
            _ => Ok(StreamMessage::Event(serde_json::from_value(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_encoding() {
        let event = RunEvent::StepEnd {
            run_id: "r1".into(),
            step_id: "s1".into(),
            status: StepStatus::Passed,
            index: None,
            error: None,
            ts: 42,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step-end");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["stepId"], "s1");
        assert_eq!(json["status"], "PASSED");
        assert_eq!(json["ts"], 42);
        assert!(json.get("video").is_none());
    }

    #[test]
    fn test_aliases_normalize_to_one_variant() {
        let spellings = [
            r#"{"type":"step-start","runId":"r","stepId":"a","index":0,"ts":1}"#,
            r#"{"type":"step_start","runId":"r","stepId":"a","index":0,"ts":1}"#,
            r#"{"type":"stepStart","run_id":"r","step_id":"a","index":0,"timestamp":1}"#,
        ];
        let decoded: Vec<RunEvent> = spellings
            .iter()
            .map(|raw| RunEvent::from_json(raw).unwrap())
            .collect();
        assert!(decoded.iter().all(|e| e == &decoded[0]));
        assert_eq!(decoded[0].kind(), "step-start");
    }

    #[test]
    fn test_legacy_frame_and_finish_fields() {
        let frame = RunEvent::from_json(
            r#"{"type":"screenshot","runId":"r","stepId":"a","screenshot":"http://x/1.png","ts":5}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            RunEvent::Frame {
                run_id: "r".into(),
                step_id: "a".into(),
                url: "http://x/1.png".into(),
                ts: 5,
            }
        );

        let done = RunEvent::from_json(
            r#"{"type":"run-complete","runId":"r","status":"success","videoUrl":"v.webm","traceUrl":"","ts":9}"#,
        )
        .unwrap();
        match done {
            RunEvent::RunFinished { status, video, trace, .. } => {
                assert_eq!(status, RunStatus::Passed);
                assert_eq!(video.as_deref(), Some("v.webm"));
                assert_eq!(trace, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_step_error_travels_flat() {
        let event = RunEvent::StepEnd {
            run_id: "r".into(),
            step_id: "a".into(),
            status: StepStatus::Error,
            index: Some(2),
            error: Some(StepError {
                message: "boom".into(),
                stack: Some("at step (a.js:1)".into()),
            }),
            ts: 7,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["error"], "boom");
        assert_eq!(json["stack"], "at step (a.js:1)");
        assert_eq!(json["index"], 2);
        assert_eq!(RunEvent::from_json(&json.to_string()).unwrap(), event);
    }

    #[test]
    fn test_step_error_accepts_object_form() {
        let decoded = RunEvent::from_json(
            r##"{"type":"step-end","runId":"r","stepId":"pay","status":"FAILED",
                "error":{"message":"#pay not found","stack":"at pay"},"ts":4}"##,
        )
        .unwrap();
        let bare = RunEvent::from_json(
            r##"{"type":"step-end","runId":"r","stepId":"pay","status":"FAILED",
                "error":"#pay not found","stack":"at pay","ts":4}"##,
        )
        .unwrap();
        assert_eq!(decoded, bare);
        match decoded {
            RunEvent::StepEnd { error: Some(error), .. } => {
                assert_eq!(error.message, "#pay not found");
                assert_eq!(error.stack.as_deref(), Some("at pay"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let no_stack = RunEvent::from_json(
            r#"{"type":"step-end","runId":"r","stepId":"a","status":"ERROR","error":{"message":"boom"},"ts":4}"#,
        )
        .unwrap();
        assert!(matches!(
            no_stack,
            RunEvent::StepEnd { error: Some(StepError { stack: None, .. }), .. }
        ));
        assert!(RunEvent::from_json(
            r#"{"type":"step-end","runId":"r","stepId":"a","status":"ERROR","error":{"code":1},"ts":4}"#
        )
        .is_err());
    }

    #[test]
    fn test_rejects_malformed_events() {
        assert!(RunEvent::from_json(r#"{"type":"explode","runId":"r","ts":1}"#).is_err());
        assert!(RunEvent::from_json(r#"{"type":"frame","runId":"r","stepId":"a","ts":1}"#).is_err());
        assert!(RunEvent::from_json(r#"{"type":"step-end","runId":"r","stepId":"a","ts":1}"#).is_err());
        assert!(
            RunEvent::from_json(r#"{"type":"run-finished","runId":"r","status":"RUNNING","ts":1}"#)
                .is_err()
        );
    }

    #[test]
    fn test_stream_messages() {
        let connected = StreamMessage::Connected { run_id: "r".into() };
        let raw = connected.encode().unwrap();
        assert_eq!(StreamMessage::decode(&raw).unwrap(), connected);

        let end = StreamMessage::decode(r#"{"type":"end","runId":"r"}"#).unwrap();
        assert_eq!(end, StreamMessage::End { run_id: "r".into() });

        let event = StreamMessage::decode(r#"{"type":"done","runId":"r","status":"ERROR","ts":3}"#)
            .unwrap();
        assert_eq!(event.run_id(), "r");
        assert!(matches!(event, StreamMessage::Event(RunEvent::RunFinished { .. })));
    }
}
