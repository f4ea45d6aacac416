//! Log-entry model and event classification.
//!
//! Every entry on the per-user log is parsed once, at ingress, into [`Event`]
//! and tagged with an [`EventCategory`]. The reducer matches exhaustively on
//! the category, so adding a category is a compile-time-visible change.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::engine::waiting::WaitCondition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    #[default]
    Channel,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    #[serde(deserialize_with = "de_string")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    #[serde(default, rename = "ref", deserialize_with = "de_opt_string")]
    pub r#ref: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Postback {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub referral: Option<Referral>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickReply {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Attachment {
    pub fn url(&self) -> Option<&str> {
        self.payload.as_ref()?.get("url")?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub quick_reply: Option<QuickReply>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl Message {
    /// Parsed message metadata. The channel delivers metadata as an embedded
    /// JSON string on echoes; locally produced entries may carry the object
    /// directly. Unparseable metadata is treated as absent.
    pub fn metadata(&self) -> Option<MessageMetadata> {
        match self.metadata.as_ref()? {
            Value::String(raw) => serde_json::from_str(raw).ok(),
            value @ Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

/// Mid-conversation switch to another form, carrying forward selected
/// metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stitch {
    pub form: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Metadata the engine attaches to every outbound message. Echoed back by
/// the channel, it is how the reducer learns what its own sends meant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repeat: bool,
    #[serde(
        default,
        rename = "isRepeat",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub is_repeat: bool,
    #[serde(
        default,
        rename = "keepMoving",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub keep_moving: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub off: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stitch: Option<Stitch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optin {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub one_time_notif_token: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkPayload {
    pub watermark: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadControl {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub new_owner_app_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub previous_owner_app_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthetic {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

/// One entry of the per-user append-only log: either a channel-native
/// envelope or a synthetic application event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub sender: Option<Party>,
    #[serde(default)]
    pub recipient: Option<Party>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub page: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub referral: Option<Referral>,
    #[serde(default)]
    pub postback: Option<Postback>,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub optin: Option<Optin>,
    #[serde(default)]
    pub read: Option<WatermarkPayload>,
    #[serde(default)]
    pub delivery: Option<WatermarkPayload>,
    #[serde(default)]
    pub reaction: Option<Value>,
    #[serde(default)]
    pub pass_thread_control: Option<ThreadControl>,
    #[serde(default, rename = "event")]
    pub synthetic: Option<Synthetic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkKind {
    Read,
    Delivery,
}

/// Canonical category of a log entry. Classification is a fixed priority
/// cascade: a referral embedded inside a postback or quick-reply payload
/// still classifies as `Referral` before any message-shape check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Referral,
    Optin,
    Unblock,
    FollowUp,
    RepeatPayment,
    Redo,
    PlatformResponse,
    MachineReport,
    Bailout,
    BlockUser,
    Handover,
    ExternalEvent,
    Watermark,
    Echo,
    Postback,
    QuickReply,
    Text,
    Media,
    Reaction,
    Unknown,
}

impl Event {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_synth(&self, kind: &str) -> bool {
        self.source == EventSource::Synthetic
            && self.synthetic.as_ref().is_some_and(|s| s.kind == kind)
    }

    fn is_external(&self) -> bool {
        self.is_synth("timeout") || self.is_synth("external")
    }

    fn is_handover(&self) -> bool {
        self.source == EventSource::Channel && self.pass_thread_control.is_some()
    }

    pub fn watermark(&self) -> Option<(WatermarkKind, i64)> {
        if let Some(read) = &self.read {
            return Some((WatermarkKind::Read, read.watermark));
        }
        self.delivery
            .as_ref()
            .map(|d| (WatermarkKind::Delivery, d.watermark))
    }

    /// The end user the entry belongs to. Echoes are addressed *to* the user;
    /// everything else originates from them.
    pub fn user_id(&self) -> Option<&str> {
        if self.source == EventSource::Synthetic {
            return self.user.as_deref();
        }
        if self.message.as_ref().is_some_and(|m| m.is_echo) {
            return self.recipient.as_ref().map(|p| p.id.as_str());
        }
        self.sender.as_ref().map(|p| p.id.as_str())
    }

    pub fn page_id(&self) -> Option<&str> {
        if self.source == EventSource::Synthetic {
            return self.page.as_deref();
        }
        if self.message.as_ref().is_some_and(|m| m.is_echo) {
            return self.sender.as_ref().map(|p| p.id.as_str());
        }
        self.recipient.as_ref().map(|p| p.id.as_str())
    }

    /// The referral ref string, wherever the channel buried it.
    fn referral_ref(&self) -> Option<&str> {
        if let Some(referral) = &self.referral {
            return referral.r#ref.as_deref();
        }
        if let Some(postback) = &self.postback {
            if let Some(referral) = &postback.referral {
                return referral.r#ref.as_deref();
            }
            if let Some(referral) = postback.payload.get("referral") {
                return referral.get("ref").and_then(Value::as_str);
            }
        }
        self.message
            .as_ref()?
            .quick_reply
            .as_ref()?
            .payload
            .get("referral")?
            .get("ref")
            .and_then(Value::as_str)
    }

    fn has_referral(&self) -> bool {
        if self.referral.is_some() {
            return true;
        }
        if let Some(postback) = &self.postback {
            if postback.referral.is_some()
                || postback.payload.as_str() == Some("get_started")
                || postback.payload.get("referral").is_some()
            {
                return true;
            }
        }
        self.message
            .as_ref()
            .and_then(|m| m.quick_reply.as_ref())
            .is_some_and(|qr| qr.payload.get("referral").is_some())
    }

    /// Ref query params, parsed as alternating key/value groups
    /// (`form.FOO.foo.bar` becomes `{form: "FOO", foo: "bar"}`).
    pub fn ref_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        let Some(raw) = self.referral_ref() else {
            return params;
        };
        let mut parts = raw.split('.');
        while let Some(key) = parts.next() {
            let value = parts
                .next()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null);
            params.insert(key.to_string(), value);
        }
        params
    }

    /// The form shortcode a referral points at, or the fallback form.
    pub fn form_ref(&self, fallback: &str) -> String {
        match self.ref_params().get("form").and_then(Value::as_str) {
            Some(form) => form.to_string(),
            None => fallback.to_string(),
        }
    }

    /// Whether the referred user is their own referrer. Such referrals are
    /// dropped so shared links cannot loop a conversation back on itself.
    pub fn self_referral(&self) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        self.ref_params()
            .get("referrer")
            .and_then(Value::as_str)
            .is_some_and(|referrer| referrer == sender.id)
    }

    /// Fresh conversation metadata for a form entry: ref params plus the
    /// per-user seed, a start time, and the owning page.
    pub fn entry_metadata(&self, fallback: &str) -> Map<String, Value> {
        let mut md = self.ref_params();
        md.insert("form".to_string(), Value::String(self.form_ref(fallback)));
        if let Some(user) = self.user_id() {
            md.insert("seed".to_string(), Value::from(user_seed(user)));
        }
        if let Some(ts) = self.timestamp {
            md.insert("startTime".to_string(), Value::from(ts));
        }
        if let Some(page) = self.page_id() {
            md.insert("pageid".to_string(), Value::String(page.to_string()));
        }
        md
    }

    /// Flattened metadata contributed by an external or hand-over event,
    /// keyed `e_<type>_<path>`. Timeout events contribute nothing.
    pub fn external_metadata(&self) -> Option<Map<String, Value>> {
        if let Some(control) = &self.pass_thread_control {
            let mut value = Map::new();
            if let Some(target) = &control.previous_owner_app_id {
                value.insert("target_app_id".to_string(), Value::String(target.clone()));
            }
            merge_thread_metadata(&mut value, control.metadata.as_deref());
            let mut out = Map::new();
            flatten_metadata("e_handover", &Value::Object(value), &mut out);
            return Some(out);
        }

        let synthetic = self.synthetic.as_ref()?;
        if synthetic.kind != "external" {
            return None;
        }
        let subtype = synthetic.value.get("type")?.as_str()?;
        let prefix = format!("e_{}", subtype.replace(':', "_"));
        let mut out = Map::new();
        flatten_metadata(&prefix, &synthetic.value, &mut out);
        Some(out)
    }
}

fn merge_thread_metadata(into: &mut Map<String, Value>, metadata: Option<&str>) {
    let Some(raw) = metadata else { return };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(parsed)) => into.extend(parsed),
        // Plain-string metadata is kept as-is rather than dropped.
        _ => {
            into.insert("metadata".to_string(), Value::String(raw.to_string()));
        }
    }
}

fn flatten_metadata(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if key == "type" || nested.is_null() {
                    continue;
                }
                let child = format!("{}_{}", prefix, snake_case(key));
                flatten_metadata(&child, nested, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, c) in key.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c == ' ' || c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

/// Deterministic per-user seed. Drawn once when a user first enters a form
/// and reused for every seeded branch afterwards.
pub fn user_seed(user: &str) -> u64 {
    let digest = Sha256::digest(user.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // keep it inside JSON's exact-integer range
    u64::from_be_bytes(bytes) >> 11
}

/// Re-hash a seed for `seed_N_M` style draws that need distinct streams.
pub fn rehash_seed(seed: u64) -> u64 {
    let digest = Sha256::digest(seed.to_be_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) >> 11
}

/// Tag an event with its canonical category. Priority order is fixed and
/// evaluated top to bottom.
pub fn classify(event: &Event) -> EventCategory {
    if event.has_referral() {
        return EventCategory::Referral;
    }
    if event.optin.is_some() {
        return EventCategory::Optin;
    }
    if event.is_synth("unblock") {
        return EventCategory::Unblock;
    }
    if event.is_synth("follow_up") {
        return EventCategory::FollowUp;
    }
    if event.is_synth("repeat_payment") {
        return EventCategory::RepeatPayment;
    }
    if event.is_synth("redo") {
        return EventCategory::Redo;
    }
    if event.is_synth("platform_response") {
        return EventCategory::PlatformResponse;
    }
    if event.is_synth("machine_report") {
        return EventCategory::MachineReport;
    }
    if event.is_synth("bailout") {
        return EventCategory::Bailout;
    }
    if event.is_synth("block_user") {
        return EventCategory::BlockUser;
    }
    if event.is_handover() {
        return EventCategory::Handover;
    }
    if event.is_external() {
        return EventCategory::ExternalEvent;
    }
    if event.watermark().is_some() {
        return EventCategory::Watermark;
    }
    if let Some(message) = &event.message {
        if message.is_echo {
            return EventCategory::Echo;
        }
    }
    if event.postback.is_some() {
        return EventCategory::Postback;
    }
    if let Some(message) = &event.message {
        if message.quick_reply.is_some() {
            return EventCategory::QuickReply;
        }
        if message.text.is_some() {
            return EventCategory::Text;
        }
        if message.attachments.is_some() {
            return EventCategory::Media;
        }
    }
    if event.reaction.is_some() {
        return EventCategory::Reaction;
    }

    tracing::info!(target: "engine", event = ?event, "unclassifiable_event");
    EventCategory::Unknown
}

fn de_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn de_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
