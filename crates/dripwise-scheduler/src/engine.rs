//! Scheduled-automation batch runner.
//!
//! One pass walks every tenant that owns automations, fires the
//! `scheduled_time` triggers that are due and writes the tenant's updated
//! schedule state back once. Driven externally (cron hitting the worker) or by
//! [`run_worker_loop`] inside the binary.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dripwise_core::config::SchedulerConfig;
use dripwise_core::error::Result;
use dripwise_core::traits::AutomationActionRunner;
use dripwise_core::types::{EventPayload, TriggerInvocation, TriggerKind};
use serde::{Deserialize, Serialize};

use crate::budget::{PassBudget, with_timeout};
use crate::nurture::NurtureSequencer;
use crate::occurrence;
use crate::persistence::SchedulerDb;

const LEASE_SCOPE: &str = "scheduled";

/// Outcome of one scheduled pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledPassReport {
    pub owners_checked: usize,
    pub triggers_fired: usize,
    /// Tenants skipped because another pass holds their lease, or their
    /// state could not be read or written.
    pub owners_skipped: usize,
}

pub struct ScheduledAutomationRunner {
    db: Arc<SchedulerDb>,
    actions: Arc<dyn AutomationActionRunner>,
    config: SchedulerConfig,
}

impl ScheduledAutomationRunner {
    pub fn new(
        db: Arc<SchedulerDb>,
        actions: Arc<dyn AutomationActionRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            actions,
            config,
        }
    }

    /// Pass with the configured limits at the current time.
    pub async fn run(&self) -> Result<ScheduledPassReport> {
        self.run_scheduled_pass(
            self.config.owners_limit,
            self.config.per_owner_max_fires,
            Utc::now(),
        )
        .await
    }

    /// Fire every due scheduled trigger for up to `owners_limit` tenants,
    /// at most `per_owner_max_fires` per tenant.
    pub async fn run_scheduled_pass(
        &self,
        owners_limit: usize,
        per_owner_max_fires: usize,
        now: DateTime<Utc>,
    ) -> Result<ScheduledPassReport> {
        let budget = PassBudget::start(self.config.pass_budget_secs);
        let holder = uuid::Uuid::new_v4().to_string();
        let ttl = Duration::seconds(self.config.lease_ttl_secs as i64);
        let owners = self.db.list_automation_owners(owners_limit)?;
        let mut report = ScheduledPassReport::default();

        for owner_id in &owners {
            if budget.exhausted() {
                tracing::warn!(
                    "⏳ Scheduled pass budget spent after {} owners, deferring the rest",
                    report.owners_checked
                );
                break;
            }

            match self.db.try_acquire_lease(LEASE_SCOPE, owner_id, &holder, now, ttl) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("🔒 Owner {owner_id} is leased by another pass, skipping");
                    report.owners_skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Lease for owner {owner_id} failed: {e}");
                    report.owners_skipped += 1;
                    continue;
                }
            }

            let outcome = self.run_owner(owner_id, per_owner_max_fires, now).await;
            if let Err(e) = self.db.release_lease(LEASE_SCOPE, owner_id, &holder) {
                tracing::warn!("⚠️ Releasing lease for owner {owner_id} failed: {e}");
            }

            match outcome {
                Ok(fired) => {
                    report.owners_checked += 1;
                    report.triggers_fired += fired;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Scheduled pass for owner {owner_id} failed: {e}");
                    report.owners_skipped += 1;
                }
            }
        }

        tracing::info!(
            "⏰ Scheduled pass: {} owners checked, {} triggers fired, {} skipped",
            report.owners_checked,
            report.triggers_fired,
            report.owners_skipped
        );
        Ok(report)
    }

    /// Process one tenant. Returns the number of triggers fired.
    async fn run_owner(&self, owner_id: &str, max_fires: usize, now: DateTime<Utc>) -> Result<usize> {
        let automations = self.db.load_automations(owner_id)?;
        let mut state = self.db.load_schedule_state(owner_id)?;
        let mut fired = 0;

        'automations: for automation in automations.iter().filter(|a| a.enabled) {
            for (node_id, schedule) in automation.scheduled_triggers() {
                if fired >= max_fires {
                    tracing::debug!("Owner {owner_id} hit the {max_fires}-fire cap for this pass");
                    break 'automations;
                }
                let last_fired = state.last_fired(&automation.id, node_id);
                if !occurrence::is_due(schedule, last_fired, now) {
                    continue;
                }

                let invocation = TriggerInvocation {
                    owner_id: owner_id.to_string(),
                    automation_id: automation.id.clone(),
                    trigger_node_id: node_id.to_string(),
                    trigger_kind: TriggerKind::ScheduledTime,
                    payload: EventPayload::scheduled(now),
                };
                let call = self.actions.run_trigger_node(invocation);
                match with_timeout(self.config.collaborator_timeout_secs, call).await {
                    Ok(()) => tracing::info!(
                        "🔔 Fired '{}' ({}:{}) for owner {owner_id}",
                        automation.name,
                        automation.id,
                        node_id
                    ),
                    // A missed scheduled action is superseded by the next occurrence.
                    Err(e) => tracing::warn!(
                        "⚠️ Action chain for {}:{} failed: {e}",
                        automation.id,
                        node_id
                    ),
                }
                state.stamp(&automation.id, node_id, now);
                fired += 1;
            }
        }

        if state.has_changes() {
            self.db.save_schedule_state(owner_id, &state)?;
        }
        Ok(fired)
    }
}

/// Drive both batch passes from an in-process interval.
pub async fn run_worker_loop(
    scheduled: Arc<ScheduledAutomationRunner>,
    nurture: Arc<NurtureSequencer>,
    interval_secs: u64,
) {
    tracing::info!("⏰ Worker loop started (every {}s)", interval_secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;

        if let Err(e) = scheduled.run().await {
            tracing::warn!("⚠️ Scheduled pass failed: {e}");
        }
        if let Err(e) = nurture.run().await {
            tracing::warn!("⚠️ Nurture pass failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AutomationRecord, RawNode};
    use crate::testing::RecordingRunner;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn trigger(id: &str, config: serde_json::Value) -> RawNode {
        RawNode {
            id: id.into(),
            node_type: "trigger".into(),
            config,
        }
    }

    fn daily_every(id: &str) -> RawNode {
        trigger(
            id,
            json!({"kind": "trigger", "triggerKind": "scheduled_time", "everyValue": 1, "everyUnit": "days"}),
        )
    }

    fn save(db: &SchedulerDb, owner: &str, id: &str, enabled: bool, nodes: Vec<RawNode>) {
        db.save_automation(&AutomationRecord {
            id: id.into(),
            owner_id: owner.into(),
            name: format!("auto {id}"),
            enabled,
            nodes,
        })
        .unwrap();
    }

    fn runner(db: Arc<SchedulerDb>, actions: Arc<RecordingRunner>) -> ScheduledAutomationRunner {
        ScheduledAutomationRunner::new(db, actions, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_fires_due_trigger_once() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        save(&db, "t", "a1", true, vec![daily_every("n1")]);
        let actions = Arc::new(RecordingRunner::default());
        let runner = runner(db.clone(), actions.clone());

        let report = runner.run_scheduled_pass(10, 10, at(1, 9, 0)).await.unwrap();
        assert_eq!(report.owners_checked, 1);
        assert_eq!(report.triggers_fired, 1);

        // Immediate second pass: nothing due.
        let again = runner.run_scheduled_pass(10, 10, at(1, 9, 0)).await.unwrap();
        assert_eq!(again.triggers_fired, 0);
        assert_eq!(actions.count(), 1);

        let call = &actions.calls.lock().unwrap()[0];
        assert_eq!(call.automation_id, "a1");
        assert_eq!(call.trigger_node_id, "n1");
        assert_eq!(call.trigger_kind, TriggerKind::ScheduledTime);
        assert_eq!(
            db.load_schedule_state("t").unwrap().last_fired("a1", "n1"),
            Some(at(1, 9, 0))
        );
    }

    #[tokio::test]
    async fn test_failed_action_still_marks_fired() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        save(&db, "t", "broken", true, vec![daily_every("n1")]);
        save(&db, "t", "healthy", true, vec![daily_every("n1")]);
        let actions = Arc::new(RecordingRunner::failing_for("broken"));
        let runner = runner(db.clone(), actions.clone());

        let report = runner.run_scheduled_pass(10, 10, at(1, 9, 0)).await.unwrap();
        assert_eq!(report.triggers_fired, 2);
        let state = db.load_schedule_state("t").unwrap();
        assert!(state.last_fired("broken", "n1").is_some());
        assert!(state.last_fired("healthy", "n1").is_some());
    }

    #[tokio::test]
    async fn test_per_owner_fire_cap() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let nodes = (0..5).map(|i| daily_every(&format!("n{i}"))).collect();
        save(&db, "t", "a1", true, nodes);
        let actions = Arc::new(RecordingRunner::default());
        let runner = runner(db.clone(), actions.clone());

        let first = runner.run_scheduled_pass(10, 3, at(1, 9, 0)).await.unwrap();
        assert_eq!(first.triggers_fired, 3);
        // The remaining two fire on the next pass.
        let second = runner.run_scheduled_pass(10, 3, at(1, 9, 1)).await.unwrap();
        assert_eq!(second.triggers_fired, 2);
        assert_eq!(db.load_schedule_state("t").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_disabled_and_event_triggers_ignored() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        save(&db, "t", "off", false, vec![daily_every("n1")]);
        save(
            &db,
            "t",
            "sms",
            true,
            vec![trigger("n1", json!({"kind": "trigger", "triggerKind": "inbound_sms"}))],
        );
        let actions = Arc::new(RecordingRunner::default());
        let runner = runner(db.clone(), actions.clone());

        let report = runner.run_scheduled_pass(10, 10, at(1, 9, 0)).await.unwrap();
        assert_eq!(report.owners_checked, 1);
        assert_eq!(report.triggers_fired, 0);
        assert!(db.load_schedule_state("t").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leased_owner_skipped() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        save(&db, "t1", "a1", true, vec![daily_every("n1")]);
        save(&db, "t2", "a2", true, vec![daily_every("n1")]);
        assert!(
            db.try_acquire_lease(LEASE_SCOPE, "t1", "other-pass", at(1, 8, 59), Duration::minutes(5))
                .unwrap()
        );
        let actions = Arc::new(RecordingRunner::default());
        let runner = runner(db.clone(), actions.clone());

        let report = runner.run_scheduled_pass(10, 10, at(1, 9, 0)).await.unwrap();
        assert_eq!(report.owners_checked, 1);
        assert_eq!(report.owners_skipped, 1);
        assert_eq!(actions.calls.lock().unwrap()[0].owner_id, "t2");
    }

    #[tokio::test]
    async fn test_owners_limit() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        for owner in ["a", "b", "c"] {
            save(&db, owner, &format!("auto-{owner}"), true, vec![daily_every("n1")]);
        }
        let actions = Arc::new(RecordingRunner::default());
        let runner = runner(db, actions.clone());

        let report = runner.run_scheduled_pass(2, 10, at(1, 9, 0)).await.unwrap();
        assert_eq!(report.owners_checked, 2);
        assert_eq!(actions.count(), 2);
    }

    #[tokio::test]
    async fn test_specific_daily_fires_once_per_slot() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        save(
            &db,
            "t",
            "a1",
            true,
            vec![trigger(
                "n1",
                json!({"kind": "trigger", "triggerKind": "scheduled_time",
                       "scheduleMode": "specific", "specificKind": "daily", "specificTime": "08:30"}),
            )],
        );
        let actions = Arc::new(RecordingRunner::default());
        let runner = runner(db, actions.clone());

        for minute in [31, 36, 41] {
            runner.run_scheduled_pass(10, 10, at(1, 8, minute)).await.unwrap();
        }
        assert_eq!(actions.count(), 1);
        runner.run_scheduled_pass(10, 10, at(2, 8, 30)).await.unwrap();
        assert_eq!(actions.count(), 2);
    }
}
