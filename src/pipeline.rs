//! The lane pipeline.
//!
//! Each lane consumes its partition of ingested entries and drives them
//! through the full path: append to the log, derive the prior state,
//! orchestrate the transition, publish whatever came out. Failures here
//! are logged and absorbed; an event that cannot be processed must not
//! take the lane down with it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::ingress::IngressEntry;
use crate::sinks::EventSinks;
use crate::statestore::{EventLog, StateStore};
use crate::supervisor::{LaneFactory, LaneWorker, SupervisorError};
use crate::transition::Orchestrator;

pub struct PipelineDeps {
    pub log: Arc<dyn EventLog>,
    pub store: StateStore,
    pub orchestrator: Orchestrator,
    pub sinks: Arc<dyn EventSinks>,
}

pub struct LanePipeline {
    lane: usize,
    deps: Arc<PipelineDeps>,
    rx: Arc<Mutex<mpsc::Receiver<IngressEntry>>>,
}

impl LanePipeline {
    async fn process(&self, entry: &IngressEntry) {
        let deps = &self.deps;
        if let Err(error) = deps.log.append(&entry.user, &entry.raw).await {
            tracing::error!(target: "pipeline", user = %entry.user, error = %error, "log_append_failed");
            return;
        }

        let state = match deps.store.get_state(&entry.user, &entry.raw).await {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(target: "pipeline", user = %entry.user, error = %error, "state_derivation_failed");
                return;
            }
        };

        let report = deps.orchestrator.run(&state, &entry.user, &entry.raw).await;

        if let Some(new_state) = &report.new_state {
            deps.store.update_state(&entry.user, new_state).await;
            let page = report.page.as_deref().unwrap_or_default();
            if let Err(error) = deps
                .sinks
                .publish_state(&entry.user, page, report.timestamp, new_state)
                .await
            {
                tracing::error!(target: "pipeline", user = %entry.user, error = %error, "state_publish_failed");
            }
        }

        if report.publish {
            if let Err(error) = deps.sinks.publish_report(&report).await {
                tracing::error!(target: "pipeline", user = %entry.user, error = %error, "report_publish_failed");
            }
        }

        if !report.responses.is_empty() {
            if let Err(error) = deps.sinks.publish_responses(&report.responses).await {
                tracing::error!(target: "pipeline", user = %entry.user, error = %error, "response_publish_failed");
            }
        }

        if let Some(payment) = &report.payment {
            if let Err(error) = deps.sinks.publish_payment(payment).await {
                tracing::error!(target: "pipeline", user = %entry.user, error = %error, "payment_publish_failed");
            }
        }

        if let Some(handoff) = &report.handoff {
            if let Err(error) = deps.sinks.publish_handoff(handoff).await {
                tracing::error!(target: "pipeline", user = %entry.user, error = %error, "handoff_publish_failed");
            }
        }
    }
}

#[async_trait]
impl LaneWorker for LanePipeline {
    async fn run(self: Box<Self>, shutdown: CancellationToken) {
        let mut rx = self.rx.lock().await;
        tracing::debug!(target: "pipeline", lane = self.lane, "lane_running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                entry = rx.recv() => match entry {
                    Some(entry) => self.process(&entry).await,
                    None => {
                        tracing::info!(target: "pipeline", lane = self.lane, "intake_closed");
                        return;
                    }
                },
            }
        }
    }
}

/// Builds a fresh worker per lane. The receiving half of each lane channel
/// is shared with the workers behind a mutex so a rebuilt lane picks up
/// exactly where the crashed one stopped.
pub struct PipelineFactory {
    deps: Arc<PipelineDeps>,
    receivers: Vec<Arc<Mutex<mpsc::Receiver<IngressEntry>>>>,
}

impl PipelineFactory {
    pub fn new(deps: Arc<PipelineDeps>, receivers: Vec<mpsc::Receiver<IngressEntry>>) -> Self {
        Self {
            deps,
            receivers: receivers
                .into_iter()
                .map(|rx| Arc::new(Mutex::new(rx)))
                .collect(),
        }
    }
}

#[async_trait]
impl LaneFactory for PipelineFactory {
    async fn build(&self, lane: usize) -> Result<Box<dyn LaneWorker>, SupervisorError> {
        let rx = self.receivers.get(lane).ok_or(SupervisorError::Build {
            lane,
            message: "no intake channel for lane".to_string(),
        })?;
        Ok(Box::new(LanePipeline {
            lane,
            deps: self.deps.clone(),
            rx: rx.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, Value, json};

    use super::*;
    use crate::channel::{ChannelError, ChannelPort, OutboundMessage};
    use crate::config::EngineSettings;
    use crate::engine::executor::SideEffect;
    use crate::engine::forms::{FormDefinition, PlainTextTranslator};
    use crate::engine::state::State;
    use crate::sinks::SinkError;
    use crate::statestore::InMemoryEventLog;
    use crate::transition::{CredentialStore, FormSource, LookupError, Report, ResponseRecord};

    struct OkChannel;

    #[async_trait]
    impl ChannelPort for OkChannel {
        async fn send_message(
            &self,
            _credential: &str,
            _message: &OutboundMessage,
        ) -> Result<Value, ChannelError> {
            Ok(json!({"message_id": "m1"}))
        }

        async fn user_profile(
            &self,
            _credential: &str,
            user: &str,
        ) -> Result<Map<String, Value>, ChannelError> {
            let mut profile = Map::new();
            profile.insert("id".to_string(), json!(user));
            Ok(profile)
        }
    }

    struct OneForm(FormDefinition);

    #[async_trait]
    impl FormSource for OneForm {
        async fn form(
            &self,
            _page: &str,
            _shortcode: &str,
            _as_of: Option<i64>,
        ) -> Result<(FormDefinition, String), LookupError> {
            Ok((self.0.clone(), "survey-1".to_string()))
        }
    }

    struct OneCredential;

    #[async_trait]
    impl CredentialStore for OneCredential {
        async fn page_credential(&self, _page: &str) -> Result<String, LookupError> {
            Ok("token-202".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingSinks {
        reports: Mutex<Vec<Report>>,
        states: Mutex<Vec<(String, String)>>,
        responses: Mutex<Vec<ResponseRecord>>,
        payments: Mutex<Vec<SideEffect>>,
    }

    #[async_trait]
    impl EventSinks for RecordingSinks {
        async fn publish_report(&self, report: &Report) -> Result<(), SinkError> {
            self.reports.lock().await.push(report.clone());
            Ok(())
        }

        async fn publish_state(
            &self,
            user: &str,
            _page: &str,
            _updated: i64,
            state: &State,
        ) -> Result<(), SinkError> {
            self.states
                .lock()
                .await
                .push((user.to_string(), state.state.as_str().to_string()));
            Ok(())
        }

        async fn publish_responses(&self, records: &[ResponseRecord]) -> Result<(), SinkError> {
            self.responses.lock().await.extend(records.iter().cloned());
            Ok(())
        }

        async fn publish_payment(&self, payment: &SideEffect) -> Result<(), SinkError> {
            self.payments.lock().await.push(payment.clone());
            Ok(())
        }

        async fn publish_handoff(&self, _handoff: &SideEffect) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            fallback_form: "FALLBACK".to_string(),
            reset_shortcode: "reset".to_string(),
            app_id: None,
        }
    }

    fn form() -> FormDefinition {
        serde_json::from_value(json!({
            "id": "FOO",
            "fields": [
                {"ref": "foo", "type": "short_text", "title": "What is foo?"},
                {"ref": "bar", "type": "short_text", "title": "And bar?"}
            ]
        }))
        .expect("form should parse")
    }

    fn deps() -> (Arc<PipelineDeps>, Arc<RecordingSinks>) {
        let log: Arc<InMemoryEventLog> = Arc::new(InMemoryEventLog::default());
        let sinks = Arc::new(RecordingSinks::default());
        let store = StateStore::new(settings(), log.clone(), Duration::from_secs(3600), 100);
        let orchestrator = Orchestrator::new(
            settings(),
            Arc::new(OkChannel),
            Arc::new(OneForm(form())),
            Arc::new(OneCredential),
            Arc::new(PlainTextTranslator),
            Duration::from_secs(60),
        );
        let deps = Arc::new(PipelineDeps {
            log,
            store,
            orchestrator,
            sinks: sinks.clone(),
        });
        (deps, sinks)
    }

    fn entry(value: Value) -> IngressEntry {
        IngressEntry {
            user: "101".to_string(),
            raw: value.to_string(),
        }
    }

    fn referral(ts: i64) -> IngressEntry {
        entry(json!({
            "sender": {"id": "101"},
            "recipient": {"id": "202"},
            "timestamp": ts,
            "referral": {"ref": "form.FOO"}
        }))
    }

    fn echo(ts: i64, md: &str) -> IngressEntry {
        entry(json!({
            "sender": {"id": "202"},
            "recipient": {"id": "101"},
            "timestamp": ts,
            "message": {"is_echo": true, "text": "q", "metadata": md}
        }))
    }

    fn text(ts: i64, body: &str) -> IngressEntry {
        entry(json!({
            "sender": {"id": "101"},
            "recipient": {"id": "202"},
            "timestamp": ts,
            "message": {"text": body}
        }))
    }

    #[tokio::test]
    async fn a_conversation_flows_through_to_the_sinks() {
        let (deps, sinks) = deps();
        let pipeline = LanePipeline {
            lane: 0,
            deps,
            rx: Arc::new(Mutex::new(mpsc::channel(1).1)),
        };

        pipeline.process(&referral(10)).await;
        pipeline.process(&echo(11, "{\"ref\":\"foo\"}")).await;
        pipeline.process(&text(12, "hello")).await;

        let states = sinks.states.lock().await;
        // referral responds, echo moves to QOUT, answer responds again
        assert_eq!(states.len(), 3);
        assert_eq!(states[1].1, "QOUT");

        let responses = sinks.responses.lock().await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].question_ref, "foo");
        assert_eq!(responses[0].response, json!("hello"));
    }

    #[tokio::test]
    async fn duplicate_answers_refresh_state_without_a_report() {
        let (deps, sinks) = deps();
        let pipeline = LanePipeline {
            lane: 0,
            deps,
            rx: Arc::new(Mutex::new(mpsc::channel(1).1)),
        };

        pipeline.process(&referral(10)).await;
        sinks.reports.lock().await.clear();

        // a text while RESPONDING hits the duplicate-answer guard
        pipeline.process(&text(11, "too early")).await;
        assert!(sinks.reports.lock().await.is_empty());
        assert_eq!(sinks.states.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn worker_drains_its_channel_until_shutdown() {
        let (deps, sinks) = deps();
        let (tx, rx) = mpsc::channel(8);
        let worker: Box<dyn LaneWorker> = Box::new(LanePipeline {
            lane: 0,
            deps,
            rx: Arc::new(Mutex::new(rx)),
        });

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let task = tokio::spawn(worker.run(shutdown));

        tx.send(referral(10)).await.expect("send should succeed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sinks.states.lock().await.len(), 1);

        stopper.cancel();
        task.await.expect("worker should stop");
    }

    #[tokio::test]
    async fn rebuilt_lane_reuses_the_same_intake() {
        let (deps, _sinks) = deps();
        let (_tx, rx) = mpsc::channel::<IngressEntry>(1);
        let factory = PipelineFactory::new(deps, vec![rx]);

        assert!(factory.build(0).await.is_ok());
        // a second build for the same lane shares the receiver
        assert!(factory.build(0).await.is_ok());
        assert!(matches!(
            factory.build(1).await,
            Err(SupervisorError::Build { lane: 1, .. })
        ));
    }
}
