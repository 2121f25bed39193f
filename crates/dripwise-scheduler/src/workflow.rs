//! Event automation dispatcher. Fires automations inline when a domain event
//! happens for a tenant.
//!
//! ## Architecture
//! ```text
//! inbound SMS handler ──► dispatch_event(owner, inbound_sms, payload)
//!                            → every enabled automation with a matching trigger node
//!                              → AutomationActionRunner::run_trigger_node (isolated per automation)
//!
//! missed-appointment scan ──► dispatch_missed_appointments(owner, bookings, now)
//!                            → ended + grace passed, not canceled
//!                            → skip ids already in the fired set
//!                            → dispatch, then record id (set trimmed to capacity)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dripwise_core::config::EventsConfig;
use dripwise_core::error::Result;
use dripwise_core::traits::AutomationActionRunner;
use dripwise_core::types::{Contact, EventPayload, TriggerInvocation, TriggerKind};
use serde::{Deserialize, Serialize};

use crate::automation::Automation;
use crate::budget::with_timeout;
use crate::persistence::{SchedulerDb, ts};

/// A booking candidate handed over by the missed-appointment scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub contact: Option<Contact>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub canceled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedAppointmentReport {
    pub dispatched: usize,
    pub already_fired: usize,
    pub not_yet_due: usize,
}

pub struct EventDispatcher {
    db: Arc<SchedulerDb>,
    actions: Arc<dyn AutomationActionRunner>,
    config: EventsConfig,
    timeout_secs: u64,
}

impl EventDispatcher {
    pub fn new(
        db: Arc<SchedulerDb>,
        actions: Arc<dyn AutomationActionRunner>,
        config: EventsConfig,
        timeout_secs: u64,
    ) -> Self {
        Self {
            db,
            actions,
            config,
            timeout_secs,
        }
    }

    /// Run every enabled automation of `owner_id` listening for `kind`.
    /// Returns how many trigger nodes ran without error.
    ///
    /// No idempotency key: callers invoke this once per physical event.
    pub async fn dispatch_event(
        &self,
        owner_id: &str,
        kind: &TriggerKind,
        payload: EventPayload,
    ) -> Result<usize> {
        if !matches!(kind, TriggerKind::InboundSms | TriggerKind::MissedAppointment) {
            tracing::debug!("Event kind '{}' is not dispatchable, ignoring", kind.as_str());
            return Ok(0);
        }
        let automations = self.db.load_automations(owner_id)?;
        Ok(self.run_matching(&automations, owner_id, kind, &payload).await)
    }

    async fn run_matching(
        &self,
        automations: &[Automation],
        owner_id: &str,
        kind: &TriggerKind,
        payload: &EventPayload,
    ) -> usize {
        let mut succeeded = 0;
        for automation in automations.iter().filter(|a| a.enabled) {
            for node_id in automation.triggers_of_kind(kind) {
                let invocation = TriggerInvocation {
                    owner_id: owner_id.to_string(),
                    automation_id: automation.id.clone(),
                    trigger_node_id: node_id.to_string(),
                    trigger_kind: kind.clone(),
                    payload: payload.clone(),
                };
                let call = self.actions.run_trigger_node(invocation);
                match with_timeout(self.timeout_secs, call).await {
                    Ok(()) => {
                        tracing::info!(
                            "⚡ '{}' ran for {} event (owner {owner_id})",
                            automation.name,
                            kind.as_str()
                        );
                        succeeded += 1;
                    }
                    Err(e) => tracing::warn!(
                        "⚠️ Automation {} failed on {} event: {e}",
                        automation.id,
                        kind.as_str()
                    ),
                }
            }
        }
        succeeded
    }

    /// Dispatch `missed_appointment` once per booking whose end time is past
    /// the grace window. Booking ids already in the fired set are skipped.
    pub async fn dispatch_missed_appointments(
        &self,
        owner_id: &str,
        bookings: &[Booking],
        now: DateTime<Utc>,
    ) -> Result<MissedAppointmentReport> {
        let grace = Duration::minutes(self.config.missed_appointment_grace_minutes);
        let kind = TriggerKind::MissedAppointment;
        let mut report = MissedAppointmentReport::default();
        let mut automations: Option<Vec<Automation>> = None;

        for booking in bookings {
            if booking.canceled {
                continue;
            }
            if booking.ends_at + grace > now {
                report.not_yet_due += 1;
                continue;
            }
            if self.db.is_booking_fired(owner_id, &booking.id)? {
                report.already_fired += 1;
                continue;
            }

            if automations.is_none() {
                automations = Some(self.db.load_automations(owner_id)?);
            }
            let payload = EventPayload {
                contact: booking.contact.clone(),
                message: None,
                event: serde_json::json!({
                    "type": kind.as_str(),
                    "bookingId": booking.id,
                    "endsAt": ts(booking.ends_at),
                }),
            };
            let loaded = automations.as_deref().unwrap_or_default();
            self.run_matching(loaded, owner_id, &kind, &payload).await;

            self.db
                .record_fired_booking(owner_id, &booking.id, now, self.config.fired_set_capacity)?;
            report.dispatched += 1;
        }

        if report.dispatched > 0 {
            tracing::info!(
                "📅 Missed appointments for {owner_id}: {} dispatched, {} already fired",
                report.dispatched,
                report.already_fired
            );
        }
        Ok(report)
    }
}
