//! The transition orchestrator.
//!
//! One call per log entry: derive the action, advance the state, render and
//! send the outbound batch, and describe everything that happened in a
//! [`Report`]. This boundary never returns an error; every failure mode is
//! a report with a tagged error, and the caller decides what to do with it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::cache::TtlCache;
use crate::channel::{ChannelError, ChannelPort, OutboundMessage};
use crate::config::EngineSettings;
use crate::engine::event::Event;
use crate::engine::executor::{self, ActionBundle, ExecutorError, SideEffect};
use crate::engine::forms::{FieldTranslator, FormContext, FormDefinition};
use crate::engine::machine::{self, MachineError};
use crate::engine::state::{Action, State};

pub const CORRUPTED_MESSAGE_TAG: &str = "CORRUPTED_MESSAGE";
pub const INTERNAL_TAG: &str = "INTERNAL";
pub const STATE_TRANSITION_TAG: &str = "STATE_TRANSITION";
pub const STATE_ACTIONS_TAG: &str = "STATE_ACTIONS";

#[derive(Debug, Error)]
#[error("{0}")]
pub struct LookupError(pub String);

/// Source of form definitions plus the survey they belong to, versioned by
/// the conversation's start time.
#[async_trait]
pub trait FormSource: Send + Sync {
    async fn form(
        &self,
        page: &str,
        shortcode: &str,
        as_of: Option<i64>,
    ) -> Result<(FormDefinition, String), LookupError>;
}

/// Source of per-page channel credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn page_credential(&self, page: &str) -> Result<String, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportError {
    pub tag: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ReportError {
    fn new(tag: &str, message: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// One answered question, ready for the response sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    pub userid: String,
    pub pageid: String,
    pub surveyid: String,
    pub shortcode: String,
    pub question_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_idx: Option<usize>,
    pub response: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub timestamp: i64,
    pub metadata: Map<String, Value>,
}

/// Everything one processed event produced. `publish=false` only on the
/// NONE-action happy path; every other outcome is worth re-ingesting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub publish: bool,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<State>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<OutboundMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<ResponseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<SideEffect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<SideEffect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl Report {
    fn base(user: &str, page: Option<String>, timestamp: i64) -> Self {
        Self {
            publish: true,
            user: user.to_string(),
            page,
            timestamp,
            new_state: None,
            messages: Vec::new(),
            responses: Vec::new(),
            payment: None,
            handoff: None,
            error: None,
        }
    }
}

enum RunFailure {
    Internal(LookupError),
    Channel(ChannelError),
    Actions(ExecutorError),
}

impl From<LookupError> for RunFailure {
    fn from(error: LookupError) -> Self {
        RunFailure::Internal(error)
    }
}

impl RunFailure {
    fn report_error(self) -> ReportError {
        match self {
            RunFailure::Internal(error) => ReportError::new(INTERNAL_TAG, error.to_string()),
            RunFailure::Channel(error) => {
                ReportError::new(error.tag(), error.to_string()).with_detail(error.detail())
            }
            RunFailure::Actions(error) => ReportError::new(STATE_ACTIONS_TAG, error.to_string()),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn placeholder_profile(user: &str) -> Map<String, Value> {
    let mut profile = Map::new();
    profile.insert("id".to_string(), Value::String(user.to_string()));
    profile.insert("name".to_string(), Value::String("_".to_string()));
    profile.insert("first_name".to_string(), Value::String("_".to_string()));
    profile.insert("last_name".to_string(), Value::String("_".to_string()));
    profile
}

/// Payment directive carried on an incoming echo's metadata (first send of
/// a payment field). Repeats are skipped so a payment is made once.
fn incoming_payment(
    user: &str,
    page: Option<&str>,
    timestamp: i64,
    event: &Event,
) -> Option<SideEffect> {
    let md = event.message.as_ref()?.metadata()?;
    if md.is_repeat {
        return None;
    }
    let Some(Value::Object(payment)) = md.payment else {
        return None;
    };
    payment.get("provider")?;
    Some(SideEffect {
        userid: user.to_string(),
        pageid: page.unwrap_or_default().to_string(),
        timestamp,
        data: payment,
    })
}

pub struct Orchestrator {
    settings: EngineSettings,
    channel: Arc<dyn ChannelPort>,
    forms: Arc<dyn FormSource>,
    credentials: Arc<dyn CredentialStore>,
    translator: Arc<dyn FieldTranslator>,
    form_cache: TtlCache<(FormDefinition, String)>,
    credential_cache: TtlCache<String>,
    profile_cache: TtlCache<Map<String, Value>>,
}

impl Orchestrator {
    pub fn new(
        settings: EngineSettings,
        channel: Arc<dyn ChannelPort>,
        forms: Arc<dyn FormSource>,
        credentials: Arc<dyn CredentialStore>,
        translator: Arc<dyn FieldTranslator>,
        lookup_ttl: Duration,
    ) -> Self {
        Self {
            settings,
            channel,
            forms,
            credentials,
            translator,
            form_cache: TtlCache::new(lookup_ttl),
            credential_cache: TtlCache::new(lookup_ttl),
            profile_cache: TtlCache::new(lookup_ttl),
        }
    }

    async fn credential(&self, page: &str) -> Result<String, LookupError> {
        self.credential_cache
            .get_or_try_load(page, || self.credentials.page_credential(page))
            .await
    }

    async fn form(
        &self,
        page: &str,
        shortcode: &str,
        as_of: Option<i64>,
    ) -> Result<(FormDefinition, String), LookupError> {
        let key = format!("{page}:{shortcode}:{}", as_of.unwrap_or_default());
        self.form_cache
            .get_or_try_load(&key, || self.forms.form(page, shortcode, as_of))
            .await
    }

    /// Profile failures are tolerated: interpolation falls back to
    /// placeholder fields rather than stalling the conversation.
    async fn profile(&self, credential: &str, user: &str) -> Map<String, Value> {
        let loaded = self
            .profile_cache
            .get_or_try_load(user, || self.channel.user_profile(credential, user))
            .await;
        match loaded {
            Ok(profile) => profile,
            Err(error) => {
                tracing::warn!(target: "transition", user, error = %error, "profile_lookup_failed");
                placeholder_profile(user)
            }
        }
    }

    async fn execute(
        &self,
        state: &State,
        new_state: &State,
        action: &Action,
        user: &str,
        page: &str,
        timestamp: i64,
    ) -> Result<(ActionBundle, Vec<ResponseRecord>), RunFailure> {
        let credential = self.credential(page).await?;
        let shortcode = new_state
            .current_form()
            .ok_or_else(|| LookupError(format!("user {user} has no active form")))?
            .to_string();
        let (form, surveyid) = self.form(page, &shortcode, new_state.start_time()).await?;
        let profile = self.profile(&credential, user).await;

        let ctx = FormContext {
            form,
            user: profile,
            page: page.to_string(),
            md: state.md.clone(),
            timestamp,
        };
        let bundle = executor::act(self.translator.as_ref(), &ctx, state, action)
            .map_err(RunFailure::Actions)?;

        for message in &bundle.messages {
            self.channel
                .send_message(&credential, message)
                .await
                .map_err(RunFailure::Channel)?;
        }

        let responses = self.response_records(new_state, action, &ctx, &surveyid, &shortcode);
        Ok((bundle, responses))
    }

    fn response_records(
        &self,
        new_state: &State,
        action: &Action,
        ctx: &FormContext,
        surveyid: &str,
        shortcode: &str,
    ) -> Vec<ResponseRecord> {
        let Some((question_ref, response)) = action.answer() else {
            return Vec::new();
        };
        let question_idx = ctx
            .form
            .fields
            .iter()
            .position(|f| f.r#ref == question_ref);
        vec![ResponseRecord {
            userid: ctx.user_id().to_string(),
            pageid: ctx.page.clone(),
            surveyid: surveyid.to_string(),
            shortcode: shortcode.to_string(),
            question_ref,
            question_idx,
            response,
            seed: new_state.md.get("seed").and_then(Value::as_u64),
            timestamp: ctx.timestamp,
            metadata: new_state.md.clone(),
        }]
    }

    /// Process one raw log entry against `state`. Never fails; the outcome
    /// is always a report.
    pub async fn run(&self, state: &State, user: &str, raw_event: &str) -> Report {
        let event = match Event::parse(raw_event) {
            Ok(event) => event,
            Err(error) => {
                let mut report = Report::base(user, None, now_ms());
                report.error = Some(
                    ReportError::new(CORRUPTED_MESSAGE_TAG, error.to_string())
                        .with_detail(json!({ "event": raw_event })),
                );
                return report;
            }
        };

        let Some(timestamp) = event.timestamp else {
            let mut report = Report::base(user, event.page_id().map(String::from), now_ms());
            report.error = Some(
                ReportError::new(CORRUPTED_MESSAGE_TAG, "event has no timestamp")
                    .with_detail(json!({ "event": raw_event })),
            );
            return report;
        };

        let page = event.page_id().map(String::from);
        let mut report = Report::base(user, page.clone(), timestamp);
        report.payment = incoming_payment(user, page.as_deref(), timestamp, &event);

        let action = match machine::exec(&self.settings, state, &event) {
            Ok(action) => action,
            Err(error) => {
                report.error = Some(state_transition_error(error, state, &event));
                return report;
            }
        };
        let new_state = machine::apply(state, &action);

        match &action {
            // nothing changed that anyone downstream needs to hear about
            Action::None => {
                report.publish = false;
                report.new_state = Some(new_state);
                return report;
            }
            // a reset has no actions or responses, but the wiped state is news
            Action::Reset { .. } => {
                report.new_state = Some(new_state);
                return report;
            }
            _ => {}
        }

        let page = match &page {
            Some(page) => page.clone(),
            None => {
                report.error = Some(
                    ReportError::new(INTERNAL_TAG, "event carries no page id")
                        .with_detail(json!({ "event": raw_event })),
                );
                return report;
            }
        };

        match self
            .execute(state, &new_state, &action, user, &page, timestamp)
            .await
        {
            Ok((bundle, responses)) => {
                report.new_state = Some(new_state);
                report.messages = bundle.messages;
                report.responses = responses;
                report.payment = report.payment.take().or(bundle.payment);
                report.handoff = bundle.handoff;
            }
            Err(failure) => {
                // lookups failed before anything ran: the transition never
                // happened, so the state must not advance
                if matches!(failure, RunFailure::Internal(_)) {
                    report.error = Some(failure.report_error());
                    return report;
                }
                // the reduction already succeeded; only the side effect
                // failed. Keep the advance and let a redo re-send.
                report.new_state = Some(new_state);
                report.error = Some(failure.report_error());
            }
        }
        report
    }
}

fn state_transition_error(error: MachineError, state: &State, event: &Event) -> ReportError {
    ReportError::new(STATE_TRANSITION_TAG, error.to_string()).with_detail(json!({
        "state": state,
        "event": event,
    }))
}
