//! End-to-end scenarios over an in-memory database and recording collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dripwise_core::DripConfig;
use dripwise_core::error::{DripError, Result};
use dripwise_core::traits::{AutomationActionRunner, MessageSender, SubscriptionStatusProvider};
use dripwise_core::types::{Contact, SubscriptionStatus, TriggerInvocation};
use dripwise_scheduler::{
    AutomationRecord, Booking, BraceTemplateRenderer, CampaignStatus, EnrollmentStatus,
    EventDispatcher, NurtureCampaign, NurtureSequencer, NurtureStep, RawNode,
    ScheduledAutomationRunner, SchedulerDb,
};
use serde_json::json;

#[derive(Default)]
struct Actions(Mutex<Vec<TriggerInvocation>>);

#[async_trait]
impl AutomationActionRunner for Actions {
    async fn run_trigger_node(&self, invocation: TriggerInvocation) -> Result<()> {
        self.0.lock().unwrap().push(invocation);
        Ok(())
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<String>>,
    down: AtomicBool,
}

#[async_trait]
impl MessageSender for Outbox {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DripError::delivery("gateway down"));
        }
        self.sent.lock().unwrap().push(format!("sms:{to}:{body}"));
        Ok(())
    }

    async fn send_email(&self, to: &str, subject: &str, _text: &str, _from: &str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DripError::delivery("gateway down"));
        }
        self.sent.lock().unwrap().push(format!("email:{to}:{subject}"));
        Ok(())
    }
}

struct Billing(Mutex<SubscriptionStatus>);

#[async_trait]
impl SubscriptionStatusProvider for Billing {
    async fn get_status(&self, _subscription_id: &str) -> Result<SubscriptionStatus> {
        Ok(self.0.lock().unwrap().clone())
    }
}

fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
}

#[tokio::test]
async fn scheduled_every_day_scenario() {
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
    db.save_automation(&AutomationRecord {
        id: "daily-checkin".into(),
        owner_id: "T".into(),
        name: "Daily check-in".into(),
        enabled: true,
        nodes: vec![
            RawNode {
                id: "trigger-1".into(),
                node_type: "trigger".into(),
                config: json!({"kind": "trigger", "triggerKind": "scheduled_time",
                               "everyValue": 1, "everyUnit": "days"}),
            },
            RawNode {
                id: "send-1".into(),
                node_type: "action".into(),
                config: json!({"kind": "send_sms"}),
            },
        ],
    })
    .unwrap();
    let actions = Arc::new(Actions::default());
    let runner = ScheduledAutomationRunner::new(
        db.clone(),
        actions.clone(),
        DripConfig::default().scheduler,
    );

    let fired = || actions.0.lock().unwrap().len();

    runner.run_scheduled_pass(200, 10, utc(1, 9, 0)).await.unwrap();
    assert_eq!(fired(), 1);
    assert_eq!(
        db.load_schedule_state("T").unwrap().last_fired("daily-checkin", "trigger-1"),
        Some(utc(1, 9, 0))
    );

    // Immediate rerun and an hour later: not due.
    runner.run_scheduled_pass(200, 10, utc(1, 9, 0)).await.unwrap();
    runner.run_scheduled_pass(200, 10, utc(1, 10, 0)).await.unwrap();
    assert_eq!(fired(), 1);

    runner.run_scheduled_pass(200, 10, utc(2, 9, 1)).await.unwrap();
    assert_eq!(fired(), 2);
}

#[tokio::test]
async fn nurture_sequence_with_billing_and_backoff() {
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
    let outbox = Arc::new(Outbox::default());
    let billing = Arc::new(Billing(Mutex::new(SubscriptionStatus::Active)));
    let mut config = DripConfig::default();
    config.billing.environment = "production".into();
    let sequencer = NurtureSequencer::new(
        db.clone(),
        outbox.clone(),
        billing.clone(),
        Arc::new(BraceTemplateRenderer),
        &config,
    );

    db.upsert_owner("T", "Lotus Dental").unwrap();
    db.upsert_contact(&Contact {
        id: "c-1".into(),
        owner_id: "T".into(),
        name: "An Le".into(),
        email: Some("an@example.com".into()),
        phone: Some("+15550123".into()),
    })
    .unwrap();
    let mut campaign = NurtureCampaign::new("welcome", "T", "Welcome");
    campaign.stripe_subscription_id = Some("sub_123".into());
    db.save_campaign(&campaign).unwrap();
    db.replace_steps(
        "welcome",
        &[
            NurtureStep::sms(0, "Hi {contact.firstName}"),
            NurtureStep::email(60, "Your visit at {business.name}", "See you soon"),
        ],
    )
    .unwrap();
    let t0 = utc(1, 9, 0);
    let enrollment = db.enroll_contact("T", "welcome", "c-1", t0).unwrap();
    let load = || db.get_enrollment(&enrollment.id).unwrap().unwrap();

    // Billing canceled: campaign pauses, enrollment waits an hour on step 0.
    *billing.0.lock().unwrap() = SubscriptionStatus::parse("canceled");
    sequencer.run_pass(t0).await.unwrap();
    assert_eq!(db.get_campaign("welcome").unwrap().unwrap().status, CampaignStatus::Paused);
    assert_eq!(load().step_index, 0);
    assert_eq!(load().next_send_at, Some(t0 + Duration::minutes(60)));

    // Billing back, gateway down: campaign resumes, send fails, 15 minute backoff.
    *billing.0.lock().unwrap() = SubscriptionStatus::Trialing;
    outbox.down.store(true, Ordering::SeqCst);
    let t1 = t0 + Duration::minutes(60);
    sequencer.run_pass(t1).await.unwrap();
    assert_eq!(db.get_campaign("welcome").unwrap().unwrap().status, CampaignStatus::Active);
    assert_eq!(load().step_index, 0);
    assert_eq!(load().next_send_at, Some(t1 + Duration::minutes(15)));

    // Gateway back: SMS goes out, email an hour later, then completed.
    outbox.down.store(false, Ordering::SeqCst);
    let t2 = t1 + Duration::minutes(15);
    sequencer.run_pass(t2).await.unwrap();
    assert_eq!(load().step_index, 1);
    assert_eq!(load().next_send_at, Some(t2 + Duration::minutes(60)));

    sequencer.run_pass(t2 + Duration::minutes(60)).await.unwrap();
    let done = load();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert!(done.next_send_at.is_none());
    assert_eq!(
        *outbox.sent.lock().unwrap(),
        vec![
            "sms:+15550123:Hi An".to_string(),
            "email:an@example.com:Your visit at Lotus Dental".to_string(),
        ]
    );
}

#[tokio::test]
async fn missed_appointment_dispatched_once() {
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
    db.save_automation(&AutomationRecord {
        id: "no-show".into(),
        owner_id: "T".into(),
        name: "No-show follow up".into(),
        enabled: true,
        nodes: vec![RawNode {
            id: "t".into(),
            node_type: "trigger".into(),
            config: json!({"kind": "trigger", "triggerKind": "missed_appointment"}),
        }],
    })
    .unwrap();
    let actions = Arc::new(Actions::default());
    let dispatcher = EventDispatcher::new(
        db.clone(),
        actions.clone(),
        DripConfig::default().events,
        15,
    );
    let bookings = vec![Booking {
        id: "bk-42".into(),
        contact: None,
        ends_at: utc(1, 8, 0),
        canceled: false,
    }];

    dispatcher.dispatch_missed_appointments("T", &bookings, utc(1, 9, 0)).await.unwrap();
    dispatcher.dispatch_missed_appointments("T", &bookings, utc(1, 9, 30)).await.unwrap();
    assert_eq!(actions.0.lock().unwrap().len(), 1);
}
