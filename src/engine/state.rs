//! Conversation state and reducer output types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{
    event::{Event, WatermarkKind},
    waiting::WaitCondition,
};

/// Where a single user's conversation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Start,
    Responding,
    Qout,
    WaitExternalEvent,
    End,
    Blocked,
    Error,
    UserBlocked,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "START",
            Phase::Responding => "RESPONDING",
            Phase::Qout => "QOUT",
            Phase::WaitExternalEvent => "WAIT_EXTERNAL_EVENT",
            Phase::End => "END",
            Phase::Blocked => "BLOCKED",
            Phase::Error => "ERROR",
            Phase::UserBlocked => "USER_BLOCKED",
        }
    }
}

/// A classified upstream error, as carried by machine reports and stored on
/// blocked/errored conversations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorDetail {
    pub fn tagged(tag: &str, message: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.to_string()),
            message: Some(message.into()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Validation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn invalid(message: Option<String>) -> Self {
        Self {
            valid: false,
            message,
        }
    }
}

/// Payload of a RESPOND action. Stored verbatim as `previousOutput` so a
/// redo can replay it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Respond {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md: Option<Map<String, Value>>,
    /// One-time notification token consumed by this response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Replacement token queue, when this response pushed or consumed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_wait: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub follow_up: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchForm {
    pub form: String,
    pub md: Map<String, Value>,
    /// Token queue carried into the new form (stitches keep them; blank
    /// starts drop them).
    pub tokens: Option<Vec<String>>,
    pub token: Option<String>,
}

/// Reducer output: what should happen in response to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Respond(Respond),
    RespondAgain {
        respond: Respond,
        retries: Vec<i64>,
    },
    /// Echo of a normal question confirmed delivered: the question is now
    /// outstanding.
    WaitResponse {
        question: String,
    },
    WaitExternalEvent {
        question: Option<String>,
        wait: WaitCondition,
        wait_start: i64,
        external_events: Option<Vec<Event>>,
        md: Option<Map<String, Value>>,
    },
    SwitchForm(SwitchForm),
    Reset {
        pointer: i64,
    },
    /// Reset that parks the user and remembers which forms they had entered.
    BlockUser {
        pointer: i64,
    },
    Unblock {
        phase: Phase,
    },
    Blocked {
        error: ErrorDetail,
    },
    Error {
        error: ErrorDetail,
    },
    End {
        question: Option<String>,
    },
    Watermark {
        kind: WatermarkKind,
        mark: i64,
    },
    UpdateState {
        external_events: Vec<Event>,
        md: Option<Map<String, Value>>,
    },
    MakePayment {
        question: String,
    },
    None,
}

impl Action {
    pub fn is_none(&self) -> bool {
        matches!(self, Action::None)
    }

    /// The (question, value) pair this action appends to the transcript,
    /// if any.
    pub fn answer(&self) -> Option<(String, Value)> {
        let Action::Respond(respond) = self else {
            return None;
        };
        let question = respond.question.clone()?;
        match &respond.response_value {
            Some(value) if !value.is_null() => Some((question, value.clone())),
            _ => None,
        }
    }
}

/// Per-user conversation state, derived from the event log. Owned
/// exclusively by that user's processing lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub state: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default)]
    pub qa: Vec<(String, Value)>,
    #[serde(default)]
    pub forms: Vec<String>,
    #[serde(default)]
    pub md: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitCondition>,
    #[serde(default, rename = "waitStart", skip_serializing_if = "Option::is_none")]
    pub wait_start: Option<i64>,
    #[serde(
        default,
        rename = "externalEvents",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub external_events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<i64>,
    #[serde(
        default,
        rename = "previousOutput",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_output: Option<Respond>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<i64>,
}

impl State {
    pub fn initial() -> Self {
        Self {
            state: Phase::Start,
            question: None,
            qa: Vec::new(),
            forms: Vec::new(),
            md: Map::new(),
            wait: None,
            wait_start: None,
            external_events: Vec::new(),
            tokens: Vec::new(),
            retries: Vec::new(),
            error: None,
            pointer: None,
            previous_output: None,
            read: None,
            delivery: None,
        }
    }

    /// Last entered form; the one the conversation is currently in.
    pub fn current_form(&self) -> Option<&str> {
        self.forms.last().map(String::as_str)
    }

    pub fn has_form(&self, form: &str) -> bool {
        self.forms.iter().any(|f| f == form)
    }

    pub fn start_time(&self) -> Option<i64> {
        self.md.get("startTime").and_then(Value::as_i64)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::initial()
    }
}
