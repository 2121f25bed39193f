//! Nurture campaign data model: campaigns, their ordered drip steps and enrollments.
//!
//! Enrollment transitions live here so the invariants hold no matter who
//! drives them: `step_index` never decreases, and `next_send_at` is `None`
//! exactly when the enrollment is no longer active.

use chrono::{DateTime, Duration, Utc};
use dripwise_core::error::truncate_error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Active,
    Paused,
    Draft,
    Archived,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "ACTIVE",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Draft => "DRAFT",
            CampaignStatus::Archived => "ARCHIVED",
        }
    }

    /// Unknown values are treated as archived: never sent, never resumed.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => CampaignStatus::Active,
            "PAUSED" => CampaignStatus::Paused,
            "DRAFT" => CampaignStatus::Draft,
            _ => CampaignStatus::Archived,
        }
    }
}

/// Why a campaign is paused. `None` on a paused campaign means a person paused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Billing,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Billing => "billing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "billing" => Some(PauseReason::Billing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NurtureCampaign {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub paused_reason: Option<PauseReason>,
    pub stripe_subscription_id: Option<String>,
    pub sms_footer: String,
    pub email_footer: String,
}

impl NurtureCampaign {
    pub fn new(id: &str, owner_id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            status: CampaignStatus::Active,
            paused_reason: None,
            stripe_subscription_id: None,
            sms_footer: String::new(),
            email_footer: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Sms,
    Email,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Sms => "SMS",
            StepKind::Email => "EMAIL",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("email") {
            StepKind::Email
        } else {
            StepKind::Sms
        }
    }
}

/// One timed message. `ord` is the 0-based position and is contiguous per campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NurtureStep {
    pub campaign_id: String,
    pub ord: u32,
    pub kind: StepKind,
    pub delay_minutes: i64,
    pub subject: Option<String>,
    pub body: String,
}

impl NurtureStep {
    pub fn sms(delay_minutes: i64, body: &str) -> Self {
        Self {
            campaign_id: String::new(),
            ord: 0,
            kind: StepKind::Sms,
            delay_minutes,
            subject: None,
            body: body.to_string(),
        }
    }

    pub fn email(delay_minutes: i64, subject: &str, body: &str) -> Self {
        Self {
            campaign_id: String::new(),
            ord: 0,
            kind: StepKind::Email,
            delay_minutes,
            subject: Some(subject.to_string()),
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Stopped,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "ACTIVE",
            EnrollmentStatus::Completed => "COMPLETED",
            EnrollmentStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => EnrollmentStatus::Active,
            "COMPLETED" => EnrollmentStatus::Completed,
            _ => EnrollmentStatus::Stopped,
        }
    }
}

/// One contact's progress through one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NurtureEnrollment {
    pub id: String,
    pub owner_id: String,
    pub campaign_id: String,
    pub contact_id: String,
    pub step_index: u32,
    pub next_send_at: Option<DateTime<Utc>>,
    pub status: EnrollmentStatus,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl NurtureEnrollment {
    /// Push the next attempt out without advancing.
    pub fn reschedule(&mut self, now: DateTime<Utc>, after_minutes: i64, error: &str, max_error_len: usize) {
        self.next_send_at = Some(now + Duration::minutes(after_minutes));
        self.last_error = Some(truncate_error(error, max_error_len));
    }

    /// Terminal: the campaign can no longer deliver to this contact.
    pub fn stop(&mut self, error: &str, max_error_len: usize) {
        self.status = EnrollmentStatus::Stopped;
        self.next_send_at = None;
        self.last_error = Some(truncate_error(error, max_error_len));
    }

    /// Terminal: the step list is exhausted.
    pub fn complete(&mut self) {
        self.status = EnrollmentStatus::Completed;
        self.next_send_at = None;
    }

    /// Record a confirmed send of the current step and move to the next one.
    /// `next_step_delay` is `None` when the sent step was the last.
    pub fn advance(&mut self, now: DateTime<Utc>, next_step_delay: Option<i64>) {
        self.step_index += 1;
        self.last_sent_at = Some(now);
        self.last_error = None;
        match next_step_delay {
            Some(delay) => {
                self.status = EnrollmentStatus::Active;
                self.next_send_at = Some(now + Duration::minutes(delay.max(0)));
            }
            None => self.complete(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn enrollment() -> NurtureEnrollment {
        NurtureEnrollment {
            id: "e1".into(),
            owner_id: "o1".into(),
            campaign_id: "c1".into(),
            contact_id: "k1".into(),
            step_index: 0,
            next_send_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()),
            status: EnrollmentStatus::Active,
            last_sent_at: None,
            last_error: Some("old".into()),
        }
    }

    #[test]
    fn test_advance_with_next_step() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut e = enrollment();
        e.advance(now, Some(60));
        assert_eq!(e.step_index, 1);
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.next_send_at, Some(now + Duration::minutes(60)));
        assert_eq!(e.last_sent_at, Some(now));
        assert!(e.last_error.is_none());
    }

    #[test]
    fn test_advance_past_last_step_completes() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut e = enrollment();
        e.advance(now, None);
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_send_at.is_none());
    }

    #[test]
    fn test_stop_clears_next_send() {
        let mut e = enrollment();
        e.stop(&"x".repeat(900), 500);
        assert_eq!(e.status, EnrollmentStatus::Stopped);
        assert!(e.next_send_at.is_none());
        assert_eq!(e.last_error.as_ref().map(|s| s.len()), Some(500));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(CampaignStatus::parse("paused"), CampaignStatus::Paused);
        assert_eq!(CampaignStatus::parse("deleted"), CampaignStatus::Archived);
        assert_eq!(StepKind::parse("EMAIL"), StepKind::Email);
        assert_eq!(EnrollmentStatus::parse("COMPLETED"), EnrollmentStatus::Completed);
    }
}
