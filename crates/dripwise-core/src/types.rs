//! Domain types exchanged between the scheduling core and its collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What makes an automation's trigger node fire.
///
/// Only `ScheduledTime` is evaluated by the batch runner. The event kinds are
/// fired inline by the event dispatcher. Unrecognized kinds are kept verbatim
/// so a round trip through storage never loses them, but nothing fires them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerKind {
    ScheduledTime,
    InboundSms,
    MissedAppointment,
    Other(String),
}

impl TriggerKind {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerKind::ScheduledTime => "scheduled_time",
            TriggerKind::InboundSms => "inbound_sms",
            TriggerKind::MissedAppointment => "missed_appointment",
            TriggerKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "scheduled_time" => TriggerKind::ScheduledTime,
            "inbound_sms" | "inbound_message" => TriggerKind::InboundSms,
            "missed_appointment" => TriggerKind::MissedAppointment,
            other => TriggerKind::Other(other.to_string()),
        }
    }
}

impl From<String> for TriggerKind {
    fn from(s: String) -> Self {
        TriggerKind::parse(&s)
    }
}

impl From<TriggerKind> for String {
    fn from(k: TriggerKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant's contact, as seen by templates and senders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    /// First whitespace-separated token of the name, or empty.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// Data handed to an action chain when its trigger fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPayload {
    pub contact: Option<Contact>,
    pub message: Option<String>,
    #[serde(default)]
    pub event: serde_json::Value,
}

impl EventPayload {
    /// Payload used when a time-based trigger fires.
    pub fn scheduled(fired_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            contact: None,
            message: None,
            event: serde_json::json!({ "firedAt": fired_at.to_rfc3339() }),
        }
    }
}

/// One request to run the action chain hanging off a single trigger node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInvocation {
    pub owner_id: String,
    pub automation_id: String,
    pub trigger_node_id: String,
    pub trigger_kind: TriggerKind,
    pub payload: EventPayload,
}

/// Billing subscription status reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Other(String),
}

impl SubscriptionStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            other => SubscriptionStatus::Other(other.to_string()),
        }
    }

    /// Whether campaigns may send while the subscription is in this state.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kind_roundtrip_keeps_unknown() {
        let kind: TriggerKind = serde_json::from_str("\"form_submitted\"").unwrap();
        assert_eq!(kind, TriggerKind::Other("form_submitted".into()));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"form_submitted\"");
    }

    #[test]
    fn test_trigger_kind_alias() {
        assert_eq!(TriggerKind::parse("inbound_message"), TriggerKind::InboundSms);
        assert_eq!(TriggerKind::parse("scheduled_time"), TriggerKind::ScheduledTime);
    }

    #[test]
    fn test_subscription_usable() {
        assert!(SubscriptionStatus::parse("active").is_usable());
        assert!(SubscriptionStatus::parse("trialing").is_usable());
        assert!(SubscriptionStatus::parse("PAST_DUE").is_usable());
        assert!(!SubscriptionStatus::parse("canceled").is_usable());
        assert!(!SubscriptionStatus::parse("incomplete_expired").is_usable());
    }

    #[test]
    fn test_first_name() {
        let c = Contact {
            id: "c1".into(),
            owner_id: "o1".into(),
            name: "Lan Nguyen".into(),
            email: None,
            phone: None,
        };
        assert_eq!(c.first_name(), "Lan");
    }
}
