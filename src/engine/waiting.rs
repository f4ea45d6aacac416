//! Wait-condition evaluation.
//!
//! A paused conversation holds a boolean tree of wait leaves. The reducer
//! re-evaluates the tree against the buffered external events each time one
//! arrives; fulfillment is monotonic because the buffer only grows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    Timeout,
    External,
    Handover,
}

impl WaitKind {
    fn as_str(self) -> &'static str {
        match self {
            WaitKind::Timeout => "timeout",
            WaitKind::External => "external",
            WaitKind::Handover => "handover",
        }
    }
}

/// How a leaf's expected value is compared against an event's value.
/// `Superset` accepts any event value containing every expected key with an
/// equal value; extra keys on the event are ignored. For non-object expected
/// values the two modes coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    #[default]
    Superset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitBranch {
    pub op: WaitOp,
    pub vars: Vec<WaitCondition>,
    #[serde(
        default,
        rename = "notifyPermission",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub notify_permission: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitLeaf {
    #[serde(rename = "type")]
    pub kind: WaitKind,
    /// For timeouts: an absolute epoch-ms deadline or a relative duration
    /// string ("1h"). For external/handover: the expected event value.
    #[serde(default)]
    pub value: Value,
    #[serde(default, rename = "match")]
    pub mode: MatchMode,
    #[serde(
        default,
        rename = "notifyPermission",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub notify_permission: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitCondition {
    Branch(WaitBranch),
    Leaf(WaitLeaf),
}

impl WaitCondition {
    pub fn leaf(kind: WaitKind, value: Value) -> Self {
        WaitCondition::Leaf(WaitLeaf {
            kind,
            value,
            mode: MatchMode::default(),
            notify_permission: false,
        })
    }

    /// Whether resolving this wait consumes a one-time notification token.
    pub fn notify_permission(&self) -> bool {
        match self {
            WaitCondition::Branch(branch) => branch.notify_permission,
            WaitCondition::Leaf(leaf) => leaf.notify_permission,
        }
    }

    /// Evaluate the tree against the buffered events. `wait_start` anchors
    /// relative timeout durations.
    pub fn fulfilled(&self, events: &[Event], wait_start: i64) -> bool {
        match self {
            WaitCondition::Branch(branch) => match branch.op {
                WaitOp::And => branch.vars.iter().all(|v| v.fulfilled(events, wait_start)),
                WaitOp::Or => branch.vars.iter().any(|v| v.fulfilled(events, wait_start)),
            },
            WaitCondition::Leaf(leaf) => leaf_fulfilled(leaf, events, wait_start),
        }
    }
}

fn leaf_fulfilled(leaf: &WaitLeaf, events: &[Event], wait_start: i64) -> bool {
    let relevant: Vec<Value> = events
        .iter()
        .filter_map(normalize)
        .filter(|(kind, _)| kind == leaf.kind.as_str())
        .map(|(_, value)| value)
        .collect();

    match leaf.kind {
        WaitKind::Timeout => {
            let Some(latest) = relevant.iter().filter_map(value_as_millis).max() else {
                return false;
            };
            let Some(deadline) = timeout_deadline(&leaf.value, wait_start) else {
                return false;
            };
            latest >= deadline
        }
        WaitKind::External | WaitKind::Handover => relevant
            .iter()
            .any(|actual| value_matches(actual, &leaf.value, leaf.mode)),
    }
}

/// The moment a timeout leaf fires: either the encoded absolute deadline or
/// the wait anchor plus a parsed duration.
fn timeout_deadline(value: &Value, wait_start: i64) -> Option<i64> {
    match value {
        Value::Number(_) => value_as_millis(value),
        Value::String(spec) => {
            let duration = humantime::parse_duration(spec).ok()?;
            Some(wait_start + duration.as_millis() as i64)
        }
        _ => None,
    }
}

fn value_as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_matches(actual: &Value, expected: &Value, mode: MatchMode) -> bool {
    // An absent or empty expectation matches any event of the right kind.
    let unconstrained = match expected {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if unconstrained {
        return !actual.is_null();
    }

    match mode {
        MatchMode::Exact => actual == expected,
        MatchMode::Superset => match (actual, expected) {
            (Value::Object(actual), Value::Object(expected)) => expected
                .iter()
                .all(|(key, value)| actual.get(key) == Some(value)),
            _ => actual == expected,
        },
    }
}

/// Normalize an event into the `{type, value}` shape the evaluator matches
/// on. Hand-over envelopes are mapped into a synthetic-looking handover
/// value first.
fn normalize(event: &Event) -> Option<(String, Value)> {
    if let Some(synthetic) = &event.synthetic {
        return Some((synthetic.kind.clone(), synthetic.value.clone()));
    }

    let control = event.pass_thread_control.as_ref()?;
    let mut value = Map::new();
    if let Some(ts) = event.timestamp {
        value.insert("timestamp".to_string(), Value::from(ts));
    }
    if let Some(raw) = control.metadata.as_deref() {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(parsed)) => value.extend(parsed),
            _ => {
                value.insert("metadata".to_string(), Value::String(raw.to_string()));
            }
        }
    }
    if let Some(target) = &control.new_owner_app_id {
        value.insert("target_app_id".to_string(), Value::String(target.clone()));
    }
    Some(("handover".to_string(), Value::Object(value)))
}
