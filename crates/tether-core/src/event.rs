//! Run-event stream model.
//!
//! Two layers live here. [`TimelineEvent`] is the frame a runner child
//! process emits on stdout, one JSON object per line; it has no task or
//! sequence identity. The worker translates each frame into a [`RunEvent`]
//! by stamping the owning task/run ids, a per-task strictly increasing
//! `seq` starting at 1, and the current timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RunCounts;

/// One element of a task's append-only event stream.
///
/// Within one task, `seq` is strictly increasing; a batch submitted to the
/// control plane is an ordered contiguous chunk of the task's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub task_id: String,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Type-tagged event payload, serialized as `{"type": ..., "payload": ...}`
/// so consumers can switch exhaustively on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    Log(LogPayload),
    Assert(AssertPayload),
    Trace(TracePayload),
    Metric(MetricPayload),
    Summary(SummaryPayload),
    Result(ResultPayload),
    StepStart(StepStartPayload),
    StepEnd(StepEndPayload),
    System(SystemPayload),
}

impl EventBody {
    /// Wire name of the event type, for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::Log(_) => "log",
            EventBody::Assert(_) => "assert",
            EventBody::Trace(_) => "trace",
            EventBody::Metric(_) => "metric",
            EventBody::Summary(_) => "summary",
            EventBody::Result(_) => "result",
            EventBody::StepStart(_) => "step_start",
            EventBody::StepEnd(_) => "step_end",
            EventBody::System(_) => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertPayload {
    pub test_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracePayload {
    pub test_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPayload {
    pub test_id: String,
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<RunCounts>,
}

/// Per-test terminal status inside a `result` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub test_id: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStartPayload {
    pub test_id: String,
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEndPayload {
    pub test_id: String,
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// One frame from a runner child's stdout, newline-delimited JSON.
///
/// Frames carry no task identity; the worker stamps `testId`, `seq` and
/// `ts` during translation into [`RunEvent`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    #[serde(rename_all = "camelCase")]
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Assert {
        #[serde(default)]
        name: Option<String>,
        passed: bool,
        #[serde(default)]
        expected: Option<Value>,
        #[serde(default)]
        actual: Option<Value>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Trace {
        name: String,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        attrs: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Metric {
        name: String,
        value: f64,
        #[serde(default)]
        unit: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StepStart {
        step_index: u32,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StepEnd {
        step_index: u32,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Summary {
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        assertions: Option<u64>,
        #[serde(default)]
        failed_assertions: Option<u64>,
    },
}

impl TimelineEvent {
    /// Translate a child frame into an event body owned by `test_id`.
    pub fn into_body(self, test_id: &str) -> EventBody {
        match self {
            TimelineEvent::Log { level, message } => EventBody::Log(LogPayload {
                level,
                message,
                test_id: Some(test_id.to_string()),
            }),
            TimelineEvent::Assert {
                name,
                passed,
                expected,
                actual,
                message,
            } => EventBody::Assert(AssertPayload {
                test_id: test_id.to_string(),
                name,
                passed,
                expected,
                actual,
                message,
            }),
            TimelineEvent::Trace {
                name,
                duration_ms,
                attrs,
            } => EventBody::Trace(TracePayload {
                test_id: test_id.to_string(),
                name,
                duration_ms,
                attrs,
            }),
            TimelineEvent::Metric { name, value, unit } => EventBody::Metric(MetricPayload {
                test_id: test_id.to_string(),
                name,
                value,
                unit,
            }),
            TimelineEvent::StepStart { step_index, name } => {
                EventBody::StepStart(StepStartPayload {
                    test_id: test_id.to_string(),
                    step_index,
                    name,
                })
            }
            TimelineEvent::StepEnd {
                step_index,
                status,
                duration_ms,
            } => EventBody::StepEnd(StepEndPayload {
                test_id: test_id.to_string(),
                step_index,
                status,
                duration_ms,
            }),
            TimelineEvent::Summary { duration_ms, .. } => EventBody::Summary(SummaryPayload {
                test_id: Some(test_id.to_string()),
                duration_ms,
                counts: None,
            }),
        }
    }
}
