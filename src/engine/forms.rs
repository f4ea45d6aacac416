//! Form definitions and field navigation.
//!
//! A form is an ordered list of fields plus optional logic jumps. Rendering
//! and answer validation sit behind the [`FieldTranslator`] port so the
//! authoring tool's message formats stay out of the engine; the plain-text
//! implementation here is what the engine ships with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine::event::{rehash_seed, MessageMetadata};
use crate::engine::state::Validation;
use crate::engine::waiting::WaitCondition;

#[derive(Debug, Error)]
pub enum FormError {
    #[error("form {form} has no fields")]
    EmptyForm { form: String },
    #[error("field {field} not found in form {form}")]
    FieldNotFound { form: String, field: String },
    #[error("choice {choice} not found in field {field}")]
    ChoiceNotFound { field: String, choice: String },
    #[error("cannot interpolate missing value {key}")]
    MissingInterpolation { key: String },
    #[error("bad logic condition on {field}: {detail}")]
    BadCondition { field: String, detail: String },
    #[error("failed to encode message metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    ShortText,
    LongText,
    Number,
    MultipleChoice,
    Statement,
    ThankyouScreen,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "ref")]
    pub r#ref: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub title: String,
    #[serde(default)]
    pub properties: FieldProperties,
}

/// Engine-facing directives an author embeds in a field description.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FieldConfig {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub wait: Option<WaitCondition>,
    #[serde(default)]
    pub payment: Option<Value>,
    #[serde(default)]
    pub handoff: Option<Value>,
    #[serde(default, rename = "keepMoving")]
    pub keep_moving: bool,
}

impl Field {
    /// Directives embedded in the description. Descriptions that are plain
    /// prose simply carry no config.
    pub fn config(&self) -> Option<FieldConfig> {
        let description = self.properties.description.as_deref()?;
        json5::from_str(description).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogicTarget {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogicDetails {
    pub to: LogicTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Always,
    And,
    Or,
    GreaterThan,
    LowerThan,
    GreaterEqualThan,
    LowerEqualThan,
    Is,
    Equal,
    IsNot,
    NotEqual,
    Contains,
    NotContains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Constant,
    Choice,
    Field,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConditionVar {
    Nested(Condition),
    Leaf {
        #[serde(rename = "type")]
        kind: VarKind,
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Condition {
    pub op: ConditionOp,
    #[serde(default)]
    pub vars: Vec<ConditionVar>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Logic {
    #[serde(rename = "ref")]
    pub r#ref: String,
    pub actions: Vec<LogicAction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogicAction {
    pub condition: Condition,
    pub details: LogicDetails,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FormDefinition {
    pub id: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub logic: Vec<Logic>,
    #[serde(default)]
    pub custom_messages: Map<String, Value>,
    /// Epoch-ms moment after which the survey stops accepting answers.
    #[serde(default, rename = "offTime")]
    pub off_time: Option<i64>,
}

impl FormDefinition {
    pub fn first_field(&self) -> Result<&Field, FormError> {
        self.fields.first().ok_or_else(|| FormError::EmptyForm {
            form: self.id.clone(),
        })
    }

    pub fn field(&self, r#ref: &str) -> Result<&Field, FormError> {
        self.fields
            .iter()
            .find(|f| f.r#ref == r#ref)
            .ok_or_else(|| FormError::FieldNotFound {
                form: self.id.clone(),
                field: r#ref.to_string(),
            })
    }

    fn sequential_next(&self, r#ref: &str) -> Option<&Field> {
        let idx = self.fields.iter().position(|f| f.r#ref == r#ref)?;
        self.fields.get(idx + 1)
    }

    /// The field to ask after `current`, honoring logic jumps. `None` when
    /// `current` is the last field and no jump applies.
    pub fn next_field(
        &self,
        ctx: &FormContext,
        qa: &[(String, Value)],
        current: &str,
    ) -> Result<Option<&Field>, FormError> {
        if let Some(logic) = self.logic.iter().find(|l| l.r#ref == current) {
            for action in &logic.actions {
                if eval_condition(self, ctx, qa, current, &action.condition)? {
                    return self.field(&action.details.to.value).map(Some);
                }
            }
            // no branch matched, fall through to the next field in order
        }
        Ok(self.sequential_next(current))
    }

    /// Author-supplied message override, falling back to the built-in copy.
    pub fn custom_message<'a>(&'a self, key: &str, fallback: &'a str) -> &'a str {
        self.custom_messages
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(fallback)
    }
}

/// Everything field rendering needs besides the field itself.
#[derive(Debug, Clone)]
pub struct FormContext {
    pub form: FormDefinition,
    /// Profile fields for the end user (id, name, ...).
    pub user: Map<String, Value>,
    pub page: String,
    pub md: Map<String, Value>,
    pub timestamp: i64,
}

impl FormContext {
    pub fn user_id(&self) -> &str {
        self.user.get("id").and_then(Value::as_str).unwrap_or("")
    }
}

/// Hidden-value lookup: user profile first, then accumulated metadata, then
/// the `seed_N`/`seed_N_M` deterministic draws.
pub fn metadata_value(ctx: &FormContext, key: &str) -> Value {
    if let Some(value) = ctx.user.get(key).or_else(|| ctx.md.get(key)) {
        return value.clone();
    }
    if let Some(draw) = seed_draw(&ctx.md, key) {
        return Value::from(draw);
    }
    Value::String(String::new())
}

/// `seed_12` draws 1..=12 from the stored seed; `seed_12_2` re-hashes the
/// seed twice first, giving an independent stream.
fn seed_draw(md: &Map<String, Value>, key: &str) -> Option<u64> {
    let rest = key.strip_prefix("seed_")?;
    let mut parts = rest.split('_');
    let modulus: u64 = parts.next()?.parse().ok()?;
    if modulus == 0 {
        return None;
    }
    let rounds: u64 = match parts.next() {
        Some(raw) => raw.parse().ok()?,
        None => 0,
    };

    let mut seed = md.get("seed").and_then(Value::as_u64)?;
    for _ in 0..rounds {
        seed = rehash_seed(seed);
    }
    Some(seed % modulus + 1)
}

/// Last recorded answer for a question, or null.
pub fn field_value(qa: &[(String, Value)], r#ref: &str) -> Value {
    qa.iter()
        .rev()
        .find(|(q, _)| q == r#ref)
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Null)
}

/// Fill `{{hidden:key}}` and `{{field:ref}}` slots in author copy.
pub fn interpolate(
    ctx: &FormContext,
    qa: &[(String, Value)],
    text: &str,
) -> Result<String, FormError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = after[..end].trim();
        out.push_str(&lookup_dynamic(ctx, qa, key)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup_dynamic(
    ctx: &FormContext,
    qa: &[(String, Value)],
    spec: &str,
) -> Result<String, FormError> {
    let (loc, key) = spec.split_once(':').unwrap_or(("hidden", spec));
    let value = match loc {
        "field" => field_value(qa, key),
        _ => metadata_value(ctx, key),
    };
    match value {
        Value::Null => Err(FormError::MissingInterpolation {
            key: spec.to_string(),
        }),
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

/// Form answers arrive as strings; coerce both sides of a comparison so
/// "10" > "9" compares numerically.
fn coerce(value: &Value) -> Value {
    let Value::String(raw) = value else {
        return value.clone();
    };
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::from(f);
    }
    match trimmed {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => value.clone(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(op: ConditionOp, a: &Value, b: &Value) -> bool {
    let (a, b) = (coerce(a), coerce(b));
    match op {
        ConditionOp::Is | ConditionOp::Equal => a == b,
        ConditionOp::IsNot | ConditionOp::NotEqual => a != b,
        ConditionOp::GreaterThan => matches!((as_f64(&a), as_f64(&b)), (Some(x), Some(y)) if x > y),
        ConditionOp::LowerThan => matches!((as_f64(&a), as_f64(&b)), (Some(x), Some(y)) if x < y),
        ConditionOp::GreaterEqualThan => {
            matches!((as_f64(&a), as_f64(&b)), (Some(x), Some(y)) if x >= y)
        }
        ConditionOp::LowerEqualThan => {
            matches!((as_f64(&a), as_f64(&b)), (Some(x), Some(y)) if x <= y)
        }
        ConditionOp::Contains => match (&a, &b) {
            (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        ConditionOp::NotContains => !compare(ConditionOp::Contains, &a, &b),
        ConditionOp::Always | ConditionOp::And | ConditionOp::Or => false,
    }
}

fn eval_condition(
    form: &FormDefinition,
    ctx: &FormContext,
    qa: &[(String, Value)],
    field: &str,
    condition: &Condition,
) -> Result<bool, FormError> {
    match condition.op {
        ConditionOp::Always => Ok(true),
        ConditionOp::And | ConditionOp::Or => {
            let mut results = Vec::with_capacity(condition.vars.len());
            for var in &condition.vars {
                let ConditionVar::Nested(nested) = var else {
                    return Err(FormError::BadCondition {
                        field: field.to_string(),
                        detail: "and/or expects nested conditions".to_string(),
                    });
                };
                results.push(eval_condition(form, ctx, qa, field, nested)?);
            }
            Ok(match condition.op {
                ConditionOp::And => results.iter().all(|r| *r),
                _ => results.iter().any(|r| *r),
            })
        }
        op => {
            let [a, b] = condition.vars.as_slice() else {
                return Err(FormError::BadCondition {
                    field: field.to_string(),
                    detail: format!("{} comparison needs exactly two vars", condition.vars.len()),
                });
            };
            let a = resolve_var(form, ctx, qa, field, a, &condition.vars)?;
            let b = resolve_var(form, ctx, qa, field, b, &condition.vars)?;
            Ok(compare(op, &a, &b))
        }
    }
}

fn resolve_var(
    form: &FormDefinition,
    ctx: &FormContext,
    qa: &[(String, Value)],
    field: &str,
    var: &ConditionVar,
    siblings: &[ConditionVar],
) -> Result<Value, FormError> {
    let ConditionVar::Leaf { kind, value } = var else {
        return Err(FormError::BadCondition {
            field: field.to_string(),
            detail: "nested condition where a value was expected".to_string(),
        });
    };
    match kind {
        VarKind::Constant => Ok(value.clone()),
        VarKind::Field => {
            let r#ref = value.as_str().unwrap_or_default();
            Ok(field_value(qa, r#ref))
        }
        VarKind::Hidden => {
            let key = value.as_str().unwrap_or_default();
            Ok(metadata_value(ctx, key))
        }
        // A choice var refers to a choice ref on the field its sibling
        // `field` var names; the comparison runs against the label.
        VarKind::Choice => {
            let target = siblings
                .iter()
                .find_map(|v| match v {
                    ConditionVar::Leaf {
                        kind: VarKind::Field,
                        value,
                    } => value.as_str(),
                    _ => None,
                })
                .ok_or_else(|| FormError::BadCondition {
                    field: field.to_string(),
                    detail: "choice var without a field var".to_string(),
                })?;
            let choice = value.as_str().unwrap_or_default();
            let target_field = form.field(target)?;
            target_field
                .properties
                .choices
                .iter()
                .find(|c| c.r#ref.as_deref() == Some(choice))
                .map(|c| Value::String(c.label.clone()))
                .ok_or_else(|| FormError::ChoiceNotFound {
                    field: target.to_string(),
                    choice: choice.to_string(),
                })
        }
    }
}

/// One outbound message body, metadata already encoded the way the channel
/// echoes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: String,
    pub metadata: String,
}

impl MessageBody {
    pub fn new(text: impl Into<String>, metadata: &MessageMetadata) -> Result<Self, FormError> {
        Ok(Self {
            text: text.into(),
            metadata: serde_json::to_string(metadata)?,
        })
    }
}

/// Renders fields into channel messages and validates raw answers. The
/// survey-authoring layer owns the real implementation.
pub trait FieldTranslator: Send + Sync {
    fn render(
        &self,
        ctx: &FormContext,
        qa: &[(String, Value)],
        field: &Field,
        is_repeat: bool,
    ) -> Result<MessageBody, FormError>;

    fn validate(&self, form: &FormDefinition, field: &Field, response: Option<&Value>)
        -> Validation;
}

pub const DEFAULT_INVALID_MESSAGE: &str = "Sorry, that answer is not valid. Please try again.";
pub const DEFAULT_NUMBER_MESSAGE: &str = "Sorry, please enter a number.";
pub const DEFAULT_FOLLOW_UP_MESSAGE: &str = "Just following up in case you missed this.";
pub const DEFAULT_OFF_MESSAGE: &str = "Sorry, this survey is now closed.";

/// Reference translator: plain text questions, choices appended as numbered
/// options, engine directives copied from the field config into metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextTranslator;

impl PlainTextTranslator {
    fn metadata(field: &Field, is_repeat: bool) -> MessageMetadata {
        let config = field.config().unwrap_or_default();
        let kind = match field.kind {
            FieldKind::Statement => Some("statement".to_string()),
            FieldKind::ThankyouScreen => Some("thankyou_screen".to_string()),
            _ => config.kind,
        };
        MessageMetadata {
            r#ref: Some(field.r#ref.clone()),
            kind,
            is_repeat,
            keep_moving: config.keep_moving,
            wait: config.wait,
            payment: config.payment,
            handoff: config.handoff,
            ..MessageMetadata::default()
        }
    }
}

impl FieldTranslator for PlainTextTranslator {
    fn render(
        &self,
        ctx: &FormContext,
        qa: &[(String, Value)],
        field: &Field,
        is_repeat: bool,
    ) -> Result<MessageBody, FormError> {
        let mut text = interpolate(ctx, qa, &field.title)?;
        if field.kind == FieldKind::MultipleChoice {
            for (i, choice) in field.properties.choices.iter().enumerate() {
                text.push_str(&format!("\n{}. {}", i + 1, choice.label));
            }
        }
        MessageBody::new(text, &Self::metadata(field, is_repeat))
    }

    fn validate(
        &self,
        form: &FormDefinition,
        field: &Field,
        response: Option<&Value>,
    ) -> Validation {
        let default_msg = form
            .custom_message("label.error.default", DEFAULT_INVALID_MESSAGE)
            .to_string();
        let Some(response) = response else {
            return Validation::invalid(Some(default_msg));
        };

        match field.kind {
            FieldKind::Number => {
                if as_f64(&coerce(response)).is_some() {
                    Validation::valid()
                } else {
                    let msg = form
                        .custom_message("label.error.mustEnter", DEFAULT_NUMBER_MESSAGE)
                        .to_string();
                    Validation::invalid(Some(msg))
                }
            }
            FieldKind::MultipleChoice => {
                let matched = field.properties.choices.iter().any(|c| {
                    Value::String(c.label.clone()) == *response
                        || response.as_str() == c.r#ref.as_deref()
                });
                if matched {
                    Validation::valid()
                } else {
                    Validation::invalid(Some(default_msg))
                }
            }
            _ => {
                if response.is_null() {
                    Validation::invalid(Some(default_msg))
                } else {
                    Validation::valid()
                }
            }
        }
    }
}
