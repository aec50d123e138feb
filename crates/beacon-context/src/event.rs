//! Analytics event payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The verb of an analytics call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Track,
    Identify,
    Page,
    Group,
    Alias,
    Screen,
}

impl EventType {
    /// All verbs, in declaration order.
    pub const ALL: [EventType; 6] = [
        EventType::Track,
        EventType::Identify,
        EventType::Page,
        EventType::Group,
        EventType::Alias,
        EventType::Screen,
    ];

    /// Wire name of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Track => "track",
            EventType::Identify => "identify",
            EventType::Page => "page",
            EventType::Group => "group",
            EventType::Alias => "alias",
            EventType::Screen => "screen",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An analytics event as it travels through the pipeline.
///
/// Field names follow the wire shape (`userId`, `anonymousId`, `_metadata`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Track event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Page/screen name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Page category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traits: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,
    /// Alias source identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Per-destination enablement, e.g. `{"All": false, "Mixpanel": true}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrations: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(
        rename = "_metadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<Value>,
}

impl Event {
    /// Create an empty event of the given verb, stamped with the current time.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            event: None,
            name: None,
            category: None,
            properties: None,
            traits: None,
            user_id: None,
            anonymous_id: None,
            previous_id: None,
            group_id: None,
            integrations: None,
            context: None,
            message_id: None,
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn track(event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            properties: Some(Map::new()),
            ..Self::new(EventType::Track)
        }
    }

    pub fn identify(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            traits: Some(Map::new()),
            ..Self::new(EventType::Identify)
        }
    }

    pub fn page(category: Option<String>, name: Option<String>) -> Self {
        Self {
            category,
            name,
            properties: Some(Map::new()),
            ..Self::new(EventType::Page)
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            traits: Some(Map::new()),
            ..Self::new(EventType::Group)
        }
    }

    /// Alias `previous_id` to `user_id`.
    pub fn alias(user_id: impl Into<String>, previous_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            previous_id: Some(previous_id.into()),
            ..Self::new(EventType::Alias)
        }
    }

    pub fn screen(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            properties: Some(Map::new()),
            ..Self::new(EventType::Screen)
        }
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_traits(mut self, traits: Map<String, Value>) -> Self {
        self.traits = Some(traits);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_anonymous_id(mut self, anonymous_id: impl Into<String>) -> Self {
        self.anonymous_id = Some(anonymous_id.into());
        self
    }

    pub fn with_integrations(mut self, integrations: Map<String, Value>) -> Self {
        self.integrations = Some(integrations);
        self
    }

    /// Explicit per-integration setting, if any.
    pub fn integration_setting(&self, name: &str) -> Option<&Value> {
        self.integrations.as_ref().and_then(|i| i.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_wire_names() {
        let mut event = Event::track("Order Completed").with_anonymous_id("anon-1");
        event.metadata = Some(json!({"bundled": []}));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "track");
        assert_eq!(value["event"], "Order Completed");
        assert_eq!(value["anonymousId"], "anon-1");
        assert!(value.get("_metadata").is_some());
        assert!(value.get("userId").is_none());
    }

    #[test]
    fn event_deserializes_minimal_payload() {
        let event: Event = serde_json::from_str(r#"{"type":"identify","userId":"u-1"}"#).unwrap();
        assert_eq!(event.event_type, EventType::Identify);
        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert!(event.timestamp.is_none());
    }

    #[test]
    fn integration_setting_reads_explicit_flags() {
        let mut integrations = Map::new();
        integrations.insert("All".to_string(), json!(false));
        let event = Event::page(None, Some("Home".into())).with_integrations(integrations);

        assert_eq!(event.integration_setting("All"), Some(&json!(false)));
        assert_eq!(event.integration_setting("Amplitude"), None);
    }

    #[test]
    fn event_type_display_matches_wire_name() {
        for verb in EventType::ALL {
            let wire = serde_json::to_value(verb).unwrap();
            assert_eq!(wire, verb.to_string());
        }
    }
}
