//! The pure reducer: one event in, one action out, fold to a state.
//!
//! `exec` decides what an event means given the current state, `apply` folds
//! the resulting action back into the state, and `reduce` replays a whole
//! log. Nothing in here performs IO; the executor renders actions into
//! outbound messages separately.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::EngineSettings;
use crate::engine::event::{classify, Event, EventCategory};
use crate::engine::state::{Action, ErrorDetail, Phase, Respond, State, SwitchForm, Validation};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("event has no timestamp")]
    MissingTimestamp,
    #[error("malformed {kind} event: {detail}")]
    Malformed { kind: &'static str, detail: String },
}

/// Classification tag for errors the channel itself reported. Reports with
/// this tag park the conversation as BLOCKED instead of ERROR.
pub const CHANNEL_ERROR_TAG: &str = "CHANNEL";

fn timestamp(event: &Event) -> Result<i64, MachineError> {
    event.timestamp.ok_or(MachineError::MissingTimestamp)
}

fn repeat(state: &State) -> Action {
    Action::Respond(Respond {
        question: state.question.clone(),
        validation: Some(Validation::invalid(None)),
        ..Respond::default()
    })
}

fn blank_start(settings: &EngineSettings, event: &Event) -> Action {
    Action::SwitchForm(SwitchForm {
        form: event.form_ref(&settings.fallback_form),
        md: event.entry_metadata(&settings.fallback_form),
        tokens: None,
        token: None,
    })
}

/// Mid-form switch to another form: keeps accumulated metadata (seed, entry
/// params) but stamps a fresh start time, and carries the token queue over.
fn stitch(
    state: &State,
    form: String,
    metadata: &Map<String, Value>,
    now: i64,
) -> Action {
    let mut md = state.md.clone();
    md.extend(metadata.clone());
    md.insert("startTime".to_string(), Value::from(now));

    let mut switch = SwitchForm {
        form,
        md,
        tokens: Some(state.tokens.clone()),
        token: None,
    };
    if let Some((token, rest)) = consume_token(state) {
        switch.token = Some(token);
        switch.tokens = Some(rest);
    }
    Action::SwitchForm(switch)
}

/// Pops the head of the token queue when the current wait asked for notify
/// permission. Returns the consumed token and the remaining queue.
fn consume_token(state: &State) -> Option<(String, Vec<String>)> {
    let wait = state.wait.as_ref()?;
    if !wait.notify_permission() || state.tokens.is_empty() {
        return None;
    }
    let mut rest = state.tokens.clone();
    let token = rest.remove(0);
    Some((token, rest))
}

fn error_detail(value: &Value) -> ErrorDetail {
    match serde_json::from_value(value.clone()) {
        Ok(detail) => detail,
        Err(_) => ErrorDetail {
            tag: None,
            message: Some(value.to_string()),
            extra: Map::new(),
        },
    }
}

fn handle_external(state: &State, event: &Event, include_metadata: bool) -> Action {
    let mut buffered = state.external_events.clone();
    buffered.push(event.clone());
    let md = if include_metadata {
        event.external_metadata()
    } else {
        None
    };

    if state.state != Phase::WaitExternalEvent {
        return Action::UpdateState {
            external_events: buffered,
            md,
        };
    }

    // A waiting state always carries its condition; a missing one means the
    // log was produced by an older build, so keep buffering.
    let Some(wait) = state.wait.clone() else {
        return Action::UpdateState {
            external_events: buffered,
            md,
        };
    };
    let wait_start = state
        .wait_start
        .or(event.timestamp)
        .unwrap_or_default();

    if !wait.fulfilled(&buffered, wait_start) {
        return Action::WaitExternalEvent {
            question: state.question.clone(),
            wait,
            wait_start,
            external_events: Some(buffered),
            md,
        };
    }

    let mut respond = Respond {
        question: state.question.clone(),
        validation: Some(Validation::valid()),
        md,
        clear_wait: true,
        ..Respond::default()
    };
    if let Some((token, rest)) = consume_token(state) {
        respond.token = Some(token);
        respond.tokens = Some(rest);
    }
    Action::Respond(respond)
}

/// Decide what `event` means given `state`. Pure and total over classified
/// events; unknown events produce `Action::None`.
pub fn exec(
    settings: &EngineSettings,
    state: &State,
    event: &Event,
) -> Result<Action, MachineError> {
    match classify(event) {
        EventCategory::Referral => {
            let form = event.form_ref(&settings.fallback_form);

            if form == settings.reset_shortcode {
                return Ok(Action::Reset {
                    pointer: timestamp(event)?,
                });
            }

            // Re-entry into a form already on the history is a no-op, so
            // webhook redelivery of a referral cannot restart a survey.
            if state.has_form(&form) {
                if state.state == Phase::Qout {
                    return Ok(repeat(state));
                }
                return Ok(Action::None);
            }

            // A shared link clicked by its own referrer must not loop the
            // conversation back on itself.
            if event.self_referral() {
                return Ok(Action::None);
            }

            Ok(blank_start(settings, event))
        }

        EventCategory::PlatformResponse => {
            let error = event
                .synthetic
                .as_ref()
                .and_then(|s| s.value.get("response"))
                .and_then(|r| r.get("error"));
            match error {
                Some(err) if state.state != Phase::Blocked => Ok(Action::Blocked {
                    error: error_detail(err),
                }),
                _ => Ok(Action::None),
            }
        }

        EventCategory::MachineReport => {
            // Once parked, stay parked; BLOCKED and ERROR are mutually
            // unreachable without an explicit unblock.
            if state.state == Phase::Error || state.state == Phase::Blocked {
                return Ok(Action::None);
            }
            let Some(error) = event.synthetic.as_ref().and_then(|s| s.value.get("error"))
            else {
                return Ok(Action::None);
            };
            let detail = error_detail(error);
            if detail.tag.as_deref() == Some(CHANNEL_ERROR_TAG) {
                Ok(Action::Blocked { error: detail })
            } else {
                Ok(Action::Error { error: detail })
            }
        }

        EventCategory::Watermark => {
            let Some((kind, mark)) = event.watermark() else {
                return Ok(Action::None);
            };
            let current = match kind {
                crate::engine::event::WatermarkKind::Read => state.read,
                crate::engine::event::WatermarkKind::Delivery => state.delivery,
            };
            if current.is_some_and(|existing| existing >= mark) {
                return Ok(Action::None);
            }
            Ok(Action::Watermark { kind, mark })
        }

        EventCategory::Redo => {
            // Nothing to re-send while a question is out or the form ended.
            if matches!(state.state, Phase::Qout | Phase::End) {
                return Ok(Action::None);
            }
            let mut retries = state.retries.clone();
            retries.push(timestamp(event)?);
            Ok(Action::RespondAgain {
                respond: state.previous_output.clone().unwrap_or_default(),
                retries,
            })
        }

        EventCategory::RepeatPayment => {
            let question = event
                .synthetic
                .as_ref()
                .and_then(|s| s.value.get("question"))
                .and_then(Value::as_str)
                .ok_or_else(|| MachineError::Malformed {
                    kind: "repeat_payment",
                    detail: "missing question ref".to_string(),
                })?;
            Ok(Action::MakePayment {
                question: question.to_string(),
            })
        }

        EventCategory::FollowUp => {
            if state.state != Phase::Qout {
                return Ok(Action::None);
            }
            let target = event.synthetic.as_ref().map(|s| &s.value);
            if target.and_then(|v| v.as_str()) != state.question.as_deref() {
                return Ok(Action::None);
            }
            Ok(Action::Respond(Respond {
                question: state.question.clone(),
                follow_up: true,
                ..Respond::default()
            }))
        }

        EventCategory::Handover => {
            // Only hand-overs addressed to this app count; some webhook
            // payloads omit the owner id, and those pass.
            let new_owner = event
                .pass_thread_control
                .as_ref()
                .and_then(|c| c.new_owner_app_id.as_deref());
            if let (Some(owner), Some(app_id)) = (new_owner, settings.app_id.as_deref()) {
                if owner != app_id {
                    tracing::info!(target: "engine", owner, "handover_other_app");
                    return Ok(Action::None);
                }
            }
            Ok(handle_external(state, event, true))
        }

        EventCategory::ExternalEvent => Ok(handle_external(state, event, true)),

        EventCategory::Bailout => {
            let value = event
                .synthetic
                .as_ref()
                .map(|s| &s.value)
                .ok_or_else(|| MachineError::Malformed {
                    kind: "bailout",
                    detail: "missing value".to_string(),
                })?;
            let form = value
                .get("form")
                .and_then(Value::as_str)
                .ok_or_else(|| MachineError::Malformed {
                    kind: "bailout",
                    detail: "missing form".to_string(),
                })?;
            let metadata = match value.get("metadata") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            Ok(stitch(
                state,
                form.to_string(),
                &metadata,
                timestamp(event)?,
            ))
        }

        EventCategory::Unblock => {
            if state.state != Phase::Blocked {
                return Ok(Action::None);
            }
            let phase = event
                .synthetic
                .as_ref()
                .and_then(|s| s.value.get("state"))
                .cloned()
                .map(serde_json::from_value::<Phase>)
                .transpose()
                .map_err(|e| MachineError::Malformed {
                    kind: "unblock",
                    detail: e.to_string(),
                })?
                .unwrap_or(Phase::Responding);
            Ok(Action::Unblock { phase })
        }

        EventCategory::BlockUser => {
            if state.state == Phase::Start {
                return Ok(Action::None);
            }
            Ok(Action::BlockUser {
                pointer: timestamp(event)?,
            })
        }

        EventCategory::Echo => {
            // An echo before any form was entered is a leftover from a
            // reset; ignore it.
            if state.state == Phase::Start {
                return Ok(Action::None);
            }
            let md = event.message.as_ref().and_then(|m| m.metadata());
            let Some(md) = md else {
                return Ok(Action::None);
            };
            // Repeats, statements and keep-moving sends never change what
            // question is outstanding.
            if md.repeat || md.keep_moving || md.kind.as_deref() == Some("statement") {
                return Ok(Action::None);
            }

            if md.kind.as_deref() == Some("thankyou_screen") {
                return Ok(Action::End { question: md.r#ref });
            }

            if let Some(stitch_md) = md.stitch {
                return Ok(stitch(
                    state,
                    stitch_md.form,
                    &stitch_md.metadata,
                    timestamp(event)?,
                ));
            }

            if let Some(wait) = md.wait {
                return Ok(Action::WaitExternalEvent {
                    question: md.r#ref,
                    wait,
                    wait_start: state.wait_start.map_or_else(|| timestamp(event), Ok)?,
                    external_events: None,
                    md: None,
                });
            }

            let Some(question) = md.r#ref else {
                return Ok(Action::None);
            };
            Ok(Action::WaitResponse { question })
        }

        EventCategory::Optin => {
            let optin = event.optin.as_ref().ok_or_else(|| MachineError::Malformed {
                kind: "optin",
                detail: "missing payload".to_string(),
            })?;
            if optin.kind.as_deref() != Some("one_time_notif_req") {
                return Ok(Action::None);
            }
            let token =
                optin
                    .one_time_notif_token
                    .clone()
                    .ok_or_else(|| MachineError::Malformed {
                        kind: "optin",
                        detail: "missing token".to_string(),
                    })?;
            let mut tokens = state.tokens.clone();
            tokens.push(token);
            Ok(Action::Respond(Respond {
                question: state.question.clone(),
                response: optin.payload.clone(),
                response_value: Some(Value::String("optin".to_string())),
                tokens: Some(tokens),
                ..Respond::default()
            }))
        }

        EventCategory::Postback => {
            if matches!(state.state, Phase::Responding | Phase::UserBlocked) {
                return Ok(Action::None);
            }
            let payload = event
                .postback
                .as_ref()
                .map(|p| p.payload.clone())
                .unwrap_or(Value::Null);
            let response_value = payload.get("value").cloned();
            Ok(Action::Respond(Respond {
                question: state.question.clone(),
                response: Some(payload),
                response_value,
                ..Respond::default()
            }))
        }

        EventCategory::QuickReply => {
            if matches!(state.state, Phase::Responding | Phase::UserBlocked) {
                return Ok(Action::None);
            }
            let payload = event
                .message
                .as_ref()
                .and_then(|m| m.quick_reply.as_ref())
                .map(|qr| qr.payload.clone())
                .unwrap_or(Value::Null);
            let response = payload.get("value").cloned().unwrap_or(payload);
            Ok(Action::Respond(Respond {
                question: state.question.clone(),
                response: Some(response.clone()),
                response_value: Some(response),
                ..Respond::default()
            }))
        }

        EventCategory::Text => {
            if matches!(state.state, Phase::Responding | Phase::UserBlocked) {
                return Ok(Action::None);
            }
            // Testers text without ever clicking a referral link; treat it
            // as entering the fallback form.
            if state.state == Phase::Start {
                return Ok(blank_start(settings, event));
            }
            let text = event
                .message
                .as_ref()
                .and_then(|m| m.text.clone())
                .map(Value::String);
            Ok(Action::Respond(Respond {
                question: state.question.clone(),
                response: text.clone(),
                response_value: text,
                ..Respond::default()
            }))
        }

        EventCategory::Media => {
            if matches!(state.state, Phase::Responding | Phase::UserBlocked) {
                return Ok(Action::None);
            }
            if state.state == Phase::Start {
                return Ok(blank_start(settings, event));
            }
            let attachment = event
                .message
                .as_ref()
                .and_then(|m| m.attachments.as_ref())
                .and_then(|a| a.first());
            let response = attachment
                .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            let response_value = attachment
                .and_then(|a| a.url())
                .map(|url| Value::String(url.to_string()));
            Ok(Action::Respond(Respond {
                question: state.question.clone(),
                response: Some(response),
                response_value,
                ..Respond::default()
            }))
        }

        EventCategory::Reaction | EventCategory::Unknown => Ok(Action::None),
    }
}

/// Fold an action back into the state. Infallible: unknown combinations
/// leave the state untouched.
pub fn apply(state: &State, action: &Action) -> State {
    match action {
        Action::Watermark { kind, mark } => {
            let mut next = state.clone();
            match kind {
                crate::engine::event::WatermarkKind::Read => next.read = Some(*mark),
                crate::engine::event::WatermarkKind::Delivery => next.delivery = Some(*mark),
            }
            next
        }

        Action::UpdateState {
            external_events,
            md,
        } => {
            let mut next = state.clone();
            next.external_events = external_events.clone();
            if let Some(md) = md {
                next.md.extend(md.clone());
            }
            next
        }

        Action::Respond(respond) => {
            let mut next = state.clone();
            next.state = Phase::Responding;
            next.question = respond.question.clone();
            if let Some(md) = &respond.md {
                next.md.extend(md.clone());
            }
            if let Some(tokens) = &respond.tokens {
                next.tokens = tokens.clone();
            }
            if respond.clear_wait {
                next.wait = None;
                next.wait_start = None;
            }
            // Answering resets the redo backoff bookkeeping.
            next.error = None;
            next.retries = Vec::new();
            next.previous_output = Some(respond.clone());
            if let Some(answer) = action.answer() {
                next.qa.push(answer);
            }
            next
        }

        Action::RespondAgain { retries, .. } => {
            let mut next = state.clone();
            next.state = Phase::Responding;
            next.retries = retries.clone();
            next
        }

        Action::Reset { pointer } => {
            let mut next = State::initial();
            next.pointer = Some(*pointer);
            next
        }

        Action::BlockUser { pointer } => {
            let mut next = State::initial();
            next.state = Phase::UserBlocked;
            next.pointer = Some(*pointer);
            next.forms = state.forms.clone();
            next
        }

        Action::SwitchForm(switch) => {
            let mut next = State::initial();
            next.state = Phase::Responding;
            next.forms = state.forms.clone();
            next.forms.push(switch.form.clone());
            // the pointer survives every form switch
            next.pointer = state.pointer;
            next.md = switch.md.clone();
            next.tokens = switch.tokens.clone().unwrap_or_default();
            next
        }

        Action::WaitResponse { question } => {
            let mut next = state.clone();
            next.state = Phase::Qout;
            next.question = Some(question.clone());
            next
        }

        Action::WaitExternalEvent {
            question,
            wait,
            wait_start,
            external_events,
            md,
        } => {
            let mut next = state.clone();
            next.state = Phase::WaitExternalEvent;
            next.question = question.clone();
            next.wait = Some(wait.clone());
            next.wait_start = Some(*wait_start);
            if let Some(buffered) = external_events {
                next.external_events = buffered.clone();
            }
            if let Some(md) = md {
                next.md.extend(md.clone());
            }
            next
        }

        Action::End { question } => {
            let mut next = state.clone();
            next.state = Phase::End;
            next.question = question.clone();
            next
        }

        Action::Blocked { error } => {
            let mut next = state.clone();
            next.state = Phase::Blocked;
            next.error = Some(error.clone());
            next
        }

        Action::Unblock { phase } => {
            let mut next = state.clone();
            next.state = *phase;
            next.error = None;
            next
        }

        Action::Error { error } => {
            let mut next = state.clone();
            next.state = Phase::Error;
            next.error = Some(error.clone());
            next
        }

        Action::MakePayment { .. } | Action::None => state.clone(),
    }
}

/// Replay a log from the blank start. Identical logs always produce
/// identical states.
pub fn reduce(settings: &EngineSettings, events: &[Event]) -> Result<State, MachineError> {
    let mut state = State::initial();
    for event in events {
        let action = exec(settings, &state, event)?;
        state = apply(&state, &action);
    }
    Ok(state)
}
