use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::payload;

/// One inbound alarm notification. Built at request arrival, consumed
/// synchronously by the dispatcher, then discarded. Only the extracted photo
/// (to disk) and the redacted tree (to the log) outlive it.
#[derive(Debug)]
pub struct AlarmEvent {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    /// The payload exactly as received, photos included.
    pub raw: Value,
    /// Same shape as `raw` with image leaves replaced by placeholders. This is
    /// the only form that may reach a log sink.
    pub redacted: Value,
}

impl AlarmEvent {
    pub fn new(raw: Value) -> Self {
        let redacted = payload::sanitize(&raw);
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            raw,
            redacted,
        }
    }

    /// Typed view over the alarm section. Missing or oddly-shaped sections
    /// yield an empty view rather than an error, so heterogeneous vendor
    /// payloads all take the same path through the dispatcher.
    pub fn alarm(&self) -> AlarmInfo<'_> {
        AlarmInfo::from_payload(&self.raw)
    }

    /// First embedded image found anywhere in the payload.
    pub fn image(&self) -> Option<&str> {
        payload::extract_image(&self.raw)
    }
}

/// Borrowed view of the `alarm` section of a payload.
#[derive(Debug, Default)]
pub struct AlarmInfo<'a> {
    pub name: Option<&'a str>,
    pub triggers: Vec<Trigger<'a>>,
    pub conditions: Vec<Condition<'a>>,
}

/// One trigger record: which device/sensor fired and why.
#[derive(Debug, Default)]
pub struct Trigger<'a> {
    pub device: Option<&'a str>,
    pub key: Option<&'a str>,
    pub group_name: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct Condition<'a> {
    pub source: Option<&'a str>,
    pub kind: Option<&'a str>,
}

impl<'a> AlarmInfo<'a> {
    pub fn from_payload(raw: &'a Value) -> Self {
        let Some(alarm) = raw.get("alarm") else {
            return Self::default();
        };

        let name = alarm.get("name").and_then(Value::as_str);

        let triggers = alarm
            .get("triggers")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(Trigger::from_value).collect())
            .unwrap_or_default();

        let conditions = alarm
            .get("conditions")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(Condition::from_value).collect())
            .unwrap_or_default();

        Self {
            name,
            triggers,
            conditions,
        }
    }

    /// True when the alarm name or any trigger key mentions motion,
    /// case-insensitively.
    pub fn mentions_motion(&self) -> bool {
        let name_matches = self
            .name
            .map(|n| n.to_ascii_lowercase().contains("motion"))
            .unwrap_or(false);
        name_matches
            || self.triggers.iter().any(|t| {
                t.key
                    .map(|k| k.to_ascii_lowercase().contains("motion"))
                    .unwrap_or(false)
            })
    }

    /// Overlay name for the viewer: the first trigger's group name, if any.
    pub fn detected_name(&self) -> Option<&'a str> {
        self.triggers.first().and_then(|t| t.group_name)
    }

    /// Devices named by the triggers, for the automation announce.
    pub fn device_ids(&self) -> Vec<&'a str> {
        self.triggers.iter().filter_map(|t| t.device).collect()
    }
}

impl<'a> Trigger<'a> {
    fn from_value(value: &'a Value) -> Self {
        Self {
            device: value.get("device").and_then(Value::as_str),
            key: value.get("key").and_then(Value::as_str),
            group_name: value
                .get("group")
                .and_then(|g| g.get("name"))
                .and_then(Value::as_str),
        }
    }
}

impl<'a> Condition<'a> {
    fn from_value(value: &'a Value) -> Self {
        let inner = value.get("condition").unwrap_or(value);
        Self {
            source: inner.get("source").and_then(Value::as_str),
            kind: inner.get("type").and_then(Value::as_str),
        }
    }
}
