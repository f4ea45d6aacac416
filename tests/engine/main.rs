//! End-to-end conversation flow through a full lane: intake entries drive
//! the log, the reducer, the executor and the sinks exactly as the running
//! service wires them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use replyflow::channel::{ChannelError, ChannelPort, OutboundMessage};
use replyflow::config::EngineSettings;
use replyflow::engine::executor::SideEffect;
use replyflow::engine::forms::{FormDefinition, PlainTextTranslator};
use replyflow::engine::state::State;
use replyflow::ingress::IngressEntry;
use replyflow::pipeline::{PipelineDeps, PipelineFactory};
use replyflow::sinks::{EventSinks, SinkError};
use replyflow::statestore::{InMemoryEventLog, StateStore};
use replyflow::supervisor::LaneFactory;
use replyflow::transition::{
    CredentialStore, FormSource, LookupError, Orchestrator, Report, ResponseRecord,
};

struct RecordingChannel {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl ChannelPort for RecordingChannel {
    async fn send_message(
        &self,
        _credential: &str,
        message: &OutboundMessage,
    ) -> Result<Value, ChannelError> {
        self.sent.lock().await.push(message.clone());
        Ok(json!({"message_id": "m1"}))
    }

    async fn user_profile(
        &self,
        _credential: &str,
        user: &str,
    ) -> Result<Map<String, Value>, ChannelError> {
        let mut profile = Map::new();
        profile.insert("id".to_string(), json!(user));
        profile.insert("first_name".to_string(), json!("Ada"));
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
    states: Mutex<Vec<String>>,
    responses: Mutex<Vec<ResponseRecord>>,
}

#[async_trait]
impl EventSinks for RecordingSinks {
    async fn publish_report(&self, report: &Report) -> Result<(), SinkError> {
        self.reports.lock().await.push(report.clone());
        Ok(())
    }

    async fn publish_state(
        &self,
        _user: &str,
        _page: &str,
        _updated: i64,
        state: &State,
    ) -> Result<(), SinkError> {
        self.states
            .lock()
            .await
            .push(state.state.as_str().to_string());
        Ok(())
    }

    async fn publish_responses(&self, records: &[ResponseRecord]) -> Result<(), SinkError> {
        self.responses.lock().await.extend(records.iter().cloned());
        Ok(())
    }

    async fn publish_payment(&self, _payment: &SideEffect) -> Result<(), SinkError> {
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

/// foo and baz are ordinary questions; bar is a statement that parks the
/// conversation behind a one-hour timeout.
fn waiting_form() -> FormDefinition {
    let bar_config = json!({
        "type": "wait",
        "wait": {"type": "timeout", "value": "1h"}
    })
    .to_string();
    serde_json::from_value(json!({
        "id": "FOO",
        "fields": [
            {"ref": "foo", "type": "short_text", "title": "What is foo?"},
            {
                "ref": "bar",
                "type": "statement",
                "title": "Come back in an hour.",
                "properties": {"description": bar_config}
            },
            {"ref": "baz", "type": "short_text", "title": "And baz?"}
        ]
    }))
    .expect("form should parse")
}

struct Harness {
    channel: Arc<RecordingChannel>,
    sinks: Arc<RecordingSinks>,
    tx: mpsc::Sender<IngressEntry>,
    shutdown: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
}

async fn harness(form: FormDefinition) -> Harness {
    let channel = Arc::new(RecordingChannel {
        sent: Mutex::new(Vec::new()),
    });
    let sinks = Arc::new(RecordingSinks::default());
    let log: Arc<InMemoryEventLog> = Arc::new(InMemoryEventLog::default());

    let deps = Arc::new(PipelineDeps {
        log: log.clone(),
        store: StateStore::new(settings(), log, Duration::from_secs(3600), 500),
        orchestrator: Orchestrator::new(
            settings(),
            channel.clone(),
            Arc::new(OneForm(form)),
            Arc::new(OneCredential),
            Arc::new(PlainTextTranslator),
            Duration::from_secs(60),
        ),
        sinks: sinks.clone(),
    });

    let (tx, rx) = mpsc::channel(64);
    let factory = PipelineFactory::new(deps, vec![rx]);
    let worker = factory.build(0).await.expect("lane should build");
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();
    let worker = tokio::spawn(worker.run(worker_shutdown));

    Harness {
        channel,
        sinks,
        tx,
        shutdown,
        worker,
    }
}

impl Harness {
    async fn deliver(&self, value: Value) {
        self.tx
            .send(IngressEntry {
                user: "101".to_string(),
                raw: value.to_string(),
            })
            .await
            .expect("lane should accept the entry");
    }

    async fn settle(&self) {
        // the lane runs concurrently; give it a moment to drain
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.tx.capacity() == self.tx.max_capacity() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn stop(self) -> (Arc<RecordingChannel>, Arc<RecordingSinks>) {
        self.shutdown.cancel();
        self.worker.await.expect("worker should stop");
        (self.channel, self.sinks)
    }
}

fn referral(ts: i64) -> Value {
    json!({
        "sender": {"id": "101"},
        "recipient": {"id": "202"},
        "timestamp": ts,
        "referral": {"ref": "form.FOO"}
    })
}

fn echo(ts: i64, metadata: Value) -> Value {
    json!({
        "sender": {"id": "202"},
        "recipient": {"id": "101"},
        "timestamp": ts,
        "message": {"is_echo": true, "text": "q", "metadata": metadata.to_string()}
    })
}

fn text(ts: i64, body: &str) -> Value {
    json!({
        "sender": {"id": "101"},
        "recipient": {"id": "202"},
        "timestamp": ts,
        "message": {"text": body}
    })
}

fn timeout_event(ts: i64) -> Value {
    json!({
        "source": "synthetic",
        "user": "101",
        "page": "202",
        "timestamp": ts,
        "event": {"type": "timeout", "value": ts}
    })
}

#[tokio::test]
async fn a_survey_runs_from_referral_through_a_timeout_wait() {
    let h = harness(waiting_form()).await;
    let hour = 60 * 60 * 1000;

    // referral starts the form and asks the first question
    h.deliver(referral(1_000)).await;
    // the platform echoes the question back; the conversation is now QOUT
    h.deliver(echo(2_000, json!({"ref": "foo"}))).await;
    // the user answers; the statement with the wait goes out next
    h.deliver(text(3_000, "hello")).await;
    // the echo of the waiting statement parks the conversation
    h.deliver(echo(
        4_000,
        json!({
            "ref": "bar",
            "type": "wait",
            "wait": {"type": "timeout", "value": "1h"}
        }),
    ))
    .await;
    // the timeout fires; the conversation resumes past the statement
    h.deliver(timeout_event(4_000 + hour + 1)).await;
    h.settle().await;

    let (channel, sinks) = h.stop().await;

    let sent = channel.sent.lock().await;
    let texts: Vec<&str> = sent.iter().map(|m| m.message.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["What is foo?", "Come back in an hour.", "And baz?"]
    );

    let states = sinks.states.lock().await;
    assert!(states.contains(&"WAIT_EXTERNAL_EVENT".to_string()));
    assert_eq!(states.last().map(String::as_str), Some("RESPONDING"));

    let responses = sinks.responses.lock().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].question_ref, "foo");
    assert_eq!(responses[0].response, json!("hello"));
}

#[tokio::test]
async fn redelivered_webhooks_do_not_answer_twice() {
    let h = harness(waiting_form()).await;

    h.deliver(referral(1_000)).await;
    h.deliver(echo(2_000, json!({"ref": "foo"}))).await;
    let answer = text(3_000, "hello");
    h.deliver(answer.clone()).await;
    // the platform re-delivers the same webhook verbatim
    h.deliver(answer).await;
    h.settle().await;

    let (_channel, sinks) = h.stop().await;
    let responses = sinks.responses.lock().await;
    assert_eq!(responses.len(), 1);
}

#[tokio::test]
async fn an_invalid_answer_repeats_the_question() {
    let number_form: FormDefinition = serde_json::from_value(json!({
        "id": "FOO",
        "fields": [
            {"ref": "age", "type": "number", "title": "How old are you?"}
        ]
    }))
    .expect("form should parse");

    let h = harness(number_form).await;
    h.deliver(referral(1_000)).await;
    h.deliver(echo(2_000, json!({"ref": "age"}))).await;
    h.deliver(text(3_000, "not a number")).await;
    h.settle().await;

    let (channel, sinks) = h.stop().await;
    let sent = channel.sent.lock().await;
    // question, invalid-answer notice, question again
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].message.text, "How old are you?");

    // the transcript keeps what the user said even when it was rejected
    let responses = sinks.responses.lock().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response, json!("not a number"));
}
