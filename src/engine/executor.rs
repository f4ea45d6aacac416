//! Action execution: turning reducer output into outbound messages and
//! side-effect payloads.
//!
//! `act` never touches the network; it renders everything the orchestrator
//! should send and lets the channel client do the sending.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::channel::{OutboundMessage, Recipient};
use crate::engine::event::MessageMetadata;
use crate::engine::forms::{
    FieldTranslator, FormContext, FormError, MessageBody, DEFAULT_FOLLOW_UP_MESSAGE,
    DEFAULT_INVALID_MESSAGE, DEFAULT_OFF_MESSAGE,
};
use crate::engine::machine;
use crate::engine::state::{Action, Respond, State};

/// Upper bound on statement/keep-moving auto-advance hops for one action.
/// Form logic can express a cycle; this turns an infinite send loop into a
/// classified failure.
pub const MAX_AUTO_ADVANCE: usize = 25;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Form(#[from] FormError),
    #[error("auto-advance exceeded {MAX_AUTO_ADVANCE} hops in form {form}")]
    FormLogicCycle { form: String },
    #[error("outbound metadata did not round-trip: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// A payment or hand-off directive lifted out of a field's metadata,
/// stamped with enough context for the downstream consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideEffect {
    pub userid: String,
    pub pageid: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionBundle {
    pub messages: Vec<OutboundMessage>,
    pub payment: Option<SideEffect>,
    pub handoff: Option<SideEffect>,
}

fn wrap_side_effect(ctx: &FormContext, data: &Value) -> Option<SideEffect> {
    let Value::Object(map) = data else {
        return None;
    };
    Some(SideEffect {
        userid: ctx.user_id().to_string(),
        pageid: ctx.page.clone(),
        timestamp: ctx.timestamp,
        data: map.clone(),
    })
}

fn message_metadata(message: &OutboundMessage) -> Result<MessageMetadata, ExecutorError> {
    Ok(serde_json::from_str(&message.message.metadata)?)
}

fn repeat_body(question: &str, text: &str) -> Result<MessageBody, ExecutorError> {
    let md = MessageMetadata {
        r#ref: Some(question.to_string()),
        repeat: true,
        ..MessageMetadata::default()
    };
    Ok(MessageBody::new(text, &md)?)
}

fn off_body(question: &str, text: &str) -> Result<MessageBody, ExecutorError> {
    let md = MessageMetadata {
        r#ref: Some(question.to_string()),
        off: true,
        ..MessageMetadata::default()
    };
    Ok(MessageBody::new(text, &md)?)
}

fn with_recipient(ctx: &FormContext, token: Option<&str>, body: MessageBody) -> OutboundMessage {
    let recipient = match token {
        Some(token) => Recipient::OneTimeNotifToken {
            one_time_notif_token: token.to_string(),
        },
        None => Recipient::Id {
            id: ctx.user_id().to_string(),
        },
    };
    OutboundMessage {
        recipient,
        message: body,
    }
}

fn next_question(
    translator: &dyn FieldTranslator,
    ctx: &FormContext,
    qa: &[(String, Value)],
    current: &str,
) -> Result<Option<MessageBody>, ExecutorError> {
    match ctx.form.next_field(ctx, qa, current)? {
        Some(field) => Ok(Some(translator.render(ctx, qa, field, false)?)),
        None => Ok(None),
    }
}

/// The single message a RESPOND directly produces: the first question, a
/// repeat, a follow-up nudge, the survey-closed notice, or the next
/// question after a valid answer.
fn initial_response(
    translator: &dyn FieldTranslator,
    ctx: &FormContext,
    qa: &[(String, Value)],
    respond: &Respond,
) -> Result<Option<OutboundMessage>, ExecutorError> {
    let token = respond.token.as_deref();

    // A closed survey answers everything with the off notice.
    if ctx.form.off_time.is_some_and(|off| ctx.timestamp > off) {
        let question = match respond.question.as_deref() {
            Some(q) => q.to_string(),
            None => ctx.form.first_field()?.r#ref.clone(),
        };
        let text = ctx
            .form
            .custom_message("label.survey.off", DEFAULT_OFF_MESSAGE)
            .to_string();
        return Ok(Some(with_recipient(ctx, None, off_body(&question, &text)?)));
    }

    // Nothing asked yet: open with the first field.
    let Some(question) = respond.question.as_deref() else {
        let body = translator.render(ctx, qa, ctx.form.first_field()?, false)?;
        return Ok(Some(with_recipient(ctx, token, body)));
    };

    if respond.follow_up {
        let text = ctx
            .form
            .custom_message("label.followUp", DEFAULT_FOLLOW_UP_MESSAGE)
            .to_string();
        return Ok(Some(with_recipient(
            ctx,
            None,
            repeat_body(question, &text)?,
        )));
    }

    let validation = match &respond.validation {
        Some(validation) => validation.clone(),
        None => {
            let field = ctx.form.field(question)?;
            translator.validate(&ctx.form, field, respond.response.as_ref())
        }
    };

    if !validation.valid {
        let text = validation.message.unwrap_or_else(|| {
            ctx.form
                .custom_message("label.error.default", DEFAULT_INVALID_MESSAGE)
                .to_string()
        });
        return Ok(Some(with_recipient(
            ctx,
            None,
            repeat_body(question, &text)?,
        )));
    }

    Ok(next_question(translator, ctx, qa, question)?
        .map(|body| with_recipient(ctx, token, body)))
}

/// Expand one rendered message into the full outbound batch: a repeat is
/// followed by the re-asked question, statements and keep-moving fields pull
/// in their successors until a real question (or a wait) stops the chain.
fn gather(
    translator: &dyn FieldTranslator,
    ctx: &FormContext,
    qa: &[(String, Value)],
    first: OutboundMessage,
) -> Result<Vec<OutboundMessage>, ExecutorError> {
    let mut batch = vec![first];
    let mut hops = 0usize;

    loop {
        let last = batch.last().map(message_metadata).transpose()?.unwrap_or_default();

        if last.repeat {
            let Some(question) = last.r#ref.as_deref() else {
                return Ok(batch);
            };
            let field = ctx.form.field(question)?;
            let body = translator.render(ctx, qa, field, true)?;
            batch.push(with_recipient(ctx, None, body));
            return Ok(batch);
        }

        let advances = last.kind.as_deref() == Some("statement") || last.keep_moving;
        if !advances || last.wait.is_some() {
            return Ok(batch);
        }
        let Some(current) = last.r#ref.as_deref() else {
            return Ok(batch);
        };

        hops += 1;
        if hops > MAX_AUTO_ADVANCE {
            return Err(ExecutorError::FormLogicCycle {
                form: ctx.form.id.clone(),
            });
        }

        match next_question(translator, ctx, qa, current)? {
            Some(body) => batch.push(with_recipient(ctx, None, body)),
            None => return Ok(batch),
        }
    }
}

fn respond_messages(
    translator: &dyn FieldTranslator,
    ctx: &FormContext,
    qa: &[(String, Value)],
    respond: &Respond,
) -> Result<Vec<OutboundMessage>, ExecutorError> {
    match initial_response(translator, ctx, qa, respond)? {
        Some(first) => gather(translator, ctx, qa, first),
        None => Ok(Vec::new()),
    }
}

fn merged_ctx(ctx: &FormContext, state_md: &Map<String, Value>, delta: Option<&Map<String, Value>>) -> FormContext {
    let mut merged = ctx.clone();
    merged.md = state_md.clone();
    if let Some(delta) = delta {
        merged.md.extend(delta.clone());
    }
    merged
}

fn first_side_effect(
    ctx: &FormContext,
    messages: &[OutboundMessage],
    pick: fn(&MessageMetadata) -> Option<&Value>,
) -> Result<Option<SideEffect>, ExecutorError> {
    for message in messages {
        let md = message_metadata(message)?;
        if let Some(data) = pick(&md) {
            return Ok(wrap_side_effect(ctx, data));
        }
    }
    Ok(None)
}

/// Render `action` into the outbound batch plus any payment/hand-off
/// payloads. Pure given the translator; no hidden randomness beyond the
/// seed already fixed in the metadata.
pub fn act(
    translator: &dyn FieldTranslator,
    ctx: &FormContext,
    state: &State,
    action: &Action,
) -> Result<ActionBundle, ExecutorError> {
    match action {
        Action::Respond(respond) => {
            // validation runs against the transcript as it will be after
            // this answer is folded in
            let qa = machine::apply(state, action).qa;
            let ctx = merged_ctx(ctx, &state.md, respond.md.as_ref());
            let messages = respond_messages(translator, &ctx, &qa, respond)?;
            let payment = first_side_effect(&ctx, &messages, |md| md.payment.as_ref())?;
            let handoff = first_side_effect(&ctx, &messages, |md| md.handoff.as_ref())?;
            Ok(ActionBundle {
                messages,
                payment,
                handoff,
            })
        }

        Action::RespondAgain { respond, .. } => {
            let ctx = merged_ctx(ctx, &state.md, respond.md.as_ref());
            let messages = respond_messages(translator, &ctx, &state.qa, respond)?;
            Ok(ActionBundle {
                messages,
                ..ActionBundle::default()
            })
        }

        Action::SwitchForm(switch) => {
            let ctx = merged_ctx(ctx, &switch.md, None);
            let respond = Respond {
                token: switch.token.clone(),
                ..Respond::default()
            };
            let messages = respond_messages(translator, &ctx, &[], &respond)?;
            Ok(ActionBundle {
                messages,
                ..ActionBundle::default()
            })
        }

        Action::MakePayment { question } => {
            let ctx = merged_ctx(ctx, &state.md, None);
            let field = ctx.form.field(question)?;
            let body = translator.render(&ctx, &state.qa, field, false)?;
            let md: MessageMetadata = serde_json::from_str(&body.metadata)?;
            let payment = md
                .payment
                .as_ref()
                .and_then(|data| wrap_side_effect(&ctx, data));
            Ok(ActionBundle {
                payment,
                ..ActionBundle::default()
            })
        }

        _ => Ok(ActionBundle::default()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::forms::{FormDefinition, PlainTextTranslator};
    use crate::engine::state::{Phase, Validation};

    fn form(value: serde_json::Value) -> FormDefinition {
        serde_json::from_value(value).expect("form should parse")
    }

    fn ctx(form: FormDefinition) -> FormContext {
        let mut md = Map::new();
        md.insert("seed".to_string(), json!(42u64));
        FormContext {
            form,
            user: serde_json::from_value(json!({"id": "101"})).expect("user should parse"),
            page: "202".to_string(),
            md,
            timestamp: 1_000,
        }
    }

    fn basic_form() -> FormDefinition {
        form(json!({
            "id": "F1",
            "fields": [
                {"ref": "foo", "type": "short_text", "title": "What is foo?"},
                {"ref": "bar", "type": "short_text", "title": "And bar?"}
            ]
        }))
    }

    fn metadata_of(message: &OutboundMessage) -> MessageMetadata {
        serde_json::from_str(&message.message.metadata).expect("metadata should parse")
    }

    fn responding_state(question: &str) -> State {
        let mut state = State::initial();
        state.state = Phase::Qout;
        state.question = Some(question.to_string());
        state.forms = vec!["F1".to_string()];
        state
    }

    #[test]
    fn switch_form_renders_the_first_field() {
        let c = ctx(basic_form());
        let action = Action::SwitchForm(crate::engine::state::SwitchForm {
            form: "F1".to_string(),
            md: Map::new(),
            tokens: None,
            token: None,
        });
        let bundle = act(&PlainTextTranslator, &c, &State::initial(), &action)
            .expect("act should succeed");
        assert_eq!(bundle.messages.len(), 1);
        assert_eq!(bundle.messages[0].message.text, "What is foo?");
        assert_eq!(metadata_of(&bundle.messages[0]).r#ref.as_deref(), Some("foo"));
        assert_eq!(
            bundle.messages[0].recipient,
            Recipient::Id {
                id: "101".to_string()
            }
        );
    }

    #[test]
    fn valid_answer_advances_to_next_question() {
        let c = ctx(basic_form());
        let state = responding_state("foo");
        let action = Action::Respond(Respond {
            question: Some("foo".to_string()),
            response: Some(json!("hello")),
            response_value: Some(json!("hello")),
            ..Respond::default()
        });
        let bundle =
            act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");
        assert_eq!(bundle.messages.len(), 1);
        assert_eq!(bundle.messages[0].message.text, "And bar?");
    }

    #[test]
    fn invalid_answer_repeats_with_message_then_question() {
        let f = form(json!({
            "id": "F1",
            "fields": [
                {"ref": "n", "type": "number", "title": "A number?"},
                {"ref": "bar", "type": "short_text", "title": "And bar?"}
            ]
        }));
        let c = ctx(f);
        let state = responding_state("n");
        let action = Action::Respond(Respond {
            question: Some("n".to_string()),
            response: Some(json!("elephant")),
            response_value: Some(json!("elephant")),
            ..Respond::default()
        });
        let bundle =
            act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");

        assert_eq!(bundle.messages.len(), 2);
        let notice = metadata_of(&bundle.messages[0]);
        assert!(notice.repeat);
        let reasked = metadata_of(&bundle.messages[1]);
        assert_eq!(reasked.r#ref.as_deref(), Some("n"));
        assert!(reasked.is_repeat);
        assert_eq!(bundle.messages[1].message.text, "A number?");
    }

    #[test]
    fn statements_auto_advance_in_one_batch() {
        let f = form(json!({
            "id": "F1",
            "fields": [
                {"ref": "s1", "type": "statement", "title": "Welcome!"},
                {"ref": "s2", "type": "statement", "title": "Glad you made it."},
                {"ref": "q1", "type": "short_text", "title": "First question?"}
            ]
        }));
        let c = ctx(f);
        let action = Action::SwitchForm(crate::engine::state::SwitchForm {
            form: "F1".to_string(),
            md: Map::new(),
            tokens: None,
            token: None,
        });
        let bundle = act(&PlainTextTranslator, &c, &State::initial(), &action)
            .expect("act should succeed");
        let texts: Vec<&str> = bundle
            .messages
            .iter()
            .map(|m| m.message.text.as_str())
            .collect();
        assert_eq!(texts, vec!["Welcome!", "Glad you made it.", "First question?"]);
    }

    #[test]
    fn statement_chains_with_a_cycle_are_cut_off() {
        let f = form(json!({
            "id": "F1",
            "fields": [
                {"ref": "s1", "type": "statement", "title": "One"},
                {"ref": "s2", "type": "statement", "title": "Two"}
            ],
            "logic": [{
                "ref": "s2",
                "actions": [{
                    "condition": {"op": "always", "vars": []},
                    "details": {"to": {"value": "s1"}}
                }]
            }]
        }));
        let c = ctx(f);
        let action = Action::SwitchForm(crate::engine::state::SwitchForm {
            form: "F1".to_string(),
            md: Map::new(),
            tokens: None,
            token: None,
        });
        let err = act(&PlainTextTranslator, &c, &State::initial(), &action)
            .expect_err("cycle should be detected");
        assert!(matches!(err, ExecutorError::FormLogicCycle { .. }));
    }

    #[test]
    fn wait_tagged_statement_stops_the_batch() {
        let f = form(json!({
            "id": "F1",
            "fields": [
                {
                    "ref": "s1",
                    "type": "statement",
                    "title": "Hold on",
                    "properties": {"description": "{wait: {type: \"timeout\", value: \"1h\"}}"}
                },
                {"ref": "q1", "type": "short_text", "title": "Next?"}
            ]
        }));
        let c = ctx(f);
        let action = Action::SwitchForm(crate::engine::state::SwitchForm {
            form: "F1".to_string(),
            md: Map::new(),
            tokens: None,
            token: None,
        });
        let bundle = act(&PlainTextTranslator, &c, &State::initial(), &action)
            .expect("act should succeed");
        assert_eq!(bundle.messages.len(), 1);
        assert_eq!(bundle.messages[0].message.text, "Hold on");
    }

    #[test]
    fn wait_resumption_sends_via_queued_token() {
        let c = ctx(basic_form());
        let mut state = responding_state("foo");
        state.qa.push(("foo".to_string(), json!("hello")));
        let action = Action::Respond(Respond {
            question: Some("foo".to_string()),
            validation: Some(Validation::valid()),
            clear_wait: true,
            token: Some("TOK1".to_string()),
            tokens: Some(vec![]),
            ..Respond::default()
        });
        let bundle =
            act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");
        assert_eq!(bundle.messages.len(), 1);
        assert_eq!(
            bundle.messages[0].recipient,
            Recipient::OneTimeNotifToken {
                one_time_notif_token: "TOK1".to_string()
            }
        );
    }

    #[test]
    fn off_time_answers_with_the_closed_notice() {
        let mut f = basic_form();
        f.off_time = Some(500);
        let c = ctx(f);
        let state = responding_state("foo");
        let action = Action::Respond(Respond {
            question: Some("foo".to_string()),
            response: Some(json!("late answer")),
            response_value: Some(json!("late answer")),
            ..Respond::default()
        });
        let bundle =
            act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");
        assert_eq!(bundle.messages.len(), 1);
        let md = metadata_of(&bundle.messages[0]);
        assert!(md.off);
        assert_eq!(bundle.messages[0].message.text, DEFAULT_OFF_MESSAGE);
    }

    #[test]
    fn payment_directive_is_lifted_from_field_metadata() {
        let f = form(json!({
            "id": "F1",
            "fields": [
                {"ref": "foo", "type": "short_text", "title": "What is foo?"},
                {
                    "ref": "pay",
                    "type": "statement",
                    "title": "Here is your reward",
                    "properties": {
                        "description": "{payment: {provider: \"reloadly\", details: {amount: 100}}}"
                    }
                }
            ]
        }));
        let c = ctx(f);
        let state = responding_state("foo");
        let action = Action::Respond(Respond {
            question: Some("foo".to_string()),
            response: Some(json!("hello")),
            response_value: Some(json!("hello")),
            ..Respond::default()
        });
        let bundle =
            act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");
        let payment = bundle.payment.expect("payment should be extracted");
        assert_eq!(payment.userid, "101");
        assert_eq!(payment.pageid, "202");
        assert_eq!(payment.data.get("provider"), Some(&json!("reloadly")));
    }

    #[test]
    fn make_payment_rerenders_the_payment_field_without_messages() {
        let f = form(json!({
            "id": "F1",
            "fields": [{
                "ref": "pay",
                "type": "statement",
                "title": "Reward",
                "properties": {"description": "{payment: {provider: \"reloadly\"}}"}
            }]
        }));
        let c = ctx(f);
        let state = responding_state("pay");
        let bundle = act(
            &PlainTextTranslator,
            &c,
            &state,
            &Action::MakePayment {
                question: "pay".to_string(),
            },
        )
        .expect("act should succeed");
        assert!(bundle.messages.is_empty());
        assert!(bundle.payment.is_some());
    }

    #[test]
    fn follow_up_sends_the_nudge_copy() {
        let c = ctx(basic_form());
        let state = responding_state("foo");
        let action = Action::Respond(Respond {
            question: Some("foo".to_string()),
            follow_up: true,
            ..Respond::default()
        });
        let bundle =
            act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");
        // the nudge repeats, so the question itself is re-sent after it
        assert_eq!(bundle.messages.len(), 2);
        assert_eq!(bundle.messages[0].message.text, DEFAULT_FOLLOW_UP_MESSAGE);
        assert_eq!(bundle.messages[1].message.text, "What is foo?");
    }

    #[test]
    fn non_rendering_actions_produce_empty_bundles() {
        let c = ctx(basic_form());
        let state = responding_state("foo");
        for action in [
            Action::None,
            Action::Reset { pointer: 1 },
            Action::End { question: None },
        ] {
            let bundle =
                act(&PlainTextTranslator, &c, &state, &action).expect("act should succeed");
            assert!(bundle.messages.is_empty());
        }
    }
}
