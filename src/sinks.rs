//! Downstream publication.
//!
//! Four outlets: machine reports loop back to the event intake over HTTP
//! so the reducer can react to its own failures, while state snapshots,
//! response records and payment directives are published to NATS subjects
//! for the warehouse consumers.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::engine::executor::SideEffect;
use crate::engine::state::State;
use crate::transition::{Report, ResponseRecord};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("payload failed to serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Nats(#[from] async_nats::PublishError),
    #[error("report feedback failed: {0}")]
    Feedback(#[from] reqwest::Error),
}

/// Everything one processed event may publish.
#[async_trait]
pub trait EventSinks: Send + Sync {
    /// Feed the report back into the intake as a `machine_report` event.
    async fn publish_report(&self, report: &Report) -> Result<(), SinkError>;

    async fn publish_state(&self, user: &str, page: &str, updated: i64, state: &State)
        -> Result<(), SinkError>;

    async fn publish_responses(&self, records: &[ResponseRecord]) -> Result<(), SinkError>;

    async fn publish_payment(&self, payment: &SideEffect) -> Result<(), SinkError>;

    async fn publish_handoff(&self, handoff: &SideEffect) -> Result<(), SinkError>;
}

/// Wire shape the report travels in: the intake parses it like any other
/// webhook delivery, so it wears the synthetic-event envelope.
pub fn report_envelope(report: &Report) -> Value {
    json!({
        "user": report.user,
        "page": report.page,
        "event": {
            "type": "machine_report",
            "value": report,
        }
    })
}

/// Snapshot row for the state subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRow {
    pub userid: String,
    pub pageid: String,
    pub updated: i64,
    pub current_state: String,
    pub state_json: Value,
}

pub fn state_row(user: &str, page: &str, updated: i64, state: &State) -> Result<StateRow, SinkError> {
    Ok(StateRow {
        userid: user.to_string(),
        pageid: page.to_string(),
        updated,
        current_state: state.state.as_str().to_string(),
        state_json: serde_json::to_value(state)?,
    })
}

#[derive(Debug, Clone)]
pub struct SinkSubjects {
    pub state: String,
    pub responses: String,
    pub payments: String,
    pub handoffs: String,
}

pub struct NatsSinks {
    nats: async_nats::Client,
    subjects: SinkSubjects,
    http: reqwest::Client,
    feedback_url: String,
}

impl NatsSinks {
    pub fn new(
        nats: async_nats::Client,
        subjects: SinkSubjects,
        feedback_url: impl Into<String>,
    ) -> Self {
        Self {
            nats,
            subjects,
            http: reqwest::Client::new(),
            feedback_url: feedback_url.into(),
        }
    }

    async fn publish(&self, subject: &str, payload: &impl Serialize) -> Result<(), SinkError> {
        let bytes = Bytes::from(serde_json::to_vec(payload)?);
        self.nats.publish(subject.to_string(), bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl EventSinks for NatsSinks {
    async fn publish_report(&self, report: &Report) -> Result<(), SinkError> {
        self.http
            .post(&self.feedback_url)
            .json(&report_envelope(report))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn publish_state(
        &self,
        user: &str,
        page: &str,
        updated: i64,
        state: &State,
    ) -> Result<(), SinkError> {
        let row = state_row(user, page, updated, state)?;
        self.publish(&self.subjects.state, &row).await
    }

    async fn publish_responses(&self, records: &[ResponseRecord]) -> Result<(), SinkError> {
        for record in records {
            self.publish(&self.subjects.responses, record).await?;
        }
        Ok(())
    }

    async fn publish_payment(&self, payment: &SideEffect) -> Result<(), SinkError> {
        self.publish(&self.subjects.payments, payment).await
    }

    async fn publish_handoff(&self, handoff: &SideEffect) -> Result<(), SinkError> {
        self.publish(&self.subjects.handoffs, handoff).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::engine::state::Phase;

    #[test]
    fn report_envelope_wears_the_synthetic_event_shape() {
        let mut report = Report {
            publish: true,
            user: "101".to_string(),
            page: Some("202".to_string()),
            timestamp: 55,
            new_state: None,
            messages: Vec::new(),
            responses: Vec::new(),
            payment: None,
            handoff: None,
            error: None,
        };
        report.error = Some(crate::transition::ReportError {
            tag: "INTERNAL".to_string(),
            message: "boom".to_string(),
            detail: None,
        });

        let envelope = report_envelope(&report);
        assert_eq!(envelope["user"], json!("101"));
        assert_eq!(envelope["event"]["type"], json!("machine_report"));
        assert_eq!(envelope["event"]["value"]["error"]["tag"], json!("INTERNAL"));
    }

    #[test]
    fn state_rows_carry_the_phase_and_the_full_snapshot() {
        let mut state = State::initial();
        state.state = Phase::Qout;
        state.question = Some("foo".to_string());
        state.md = Map::new();

        let row = state_row("101", "202", 99, &state).expect("row should build");
        assert_eq!(row.current_state, "QOUT");
        assert_eq!(row.updated, 99);
        assert_eq!(row.state_json["question"], json!("foo"));
    }
}
