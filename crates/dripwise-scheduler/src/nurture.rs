//! Nurture drip sequencer. Advances active enrollments through their
//! campaign's ordered steps.
//!
//! ```text
//! ACTIVE --step sent, next step exists--> ACTIVE (stepIndex + 1)
//! ACTIVE --step sent, last step---------> COMPLETED
//! ACTIVE --campaign invalid-------------> STOPPED
//! ACTIVE --send/render failure----------> ACTIVE (same step, retry later)
//! ```
//!
//! Each due enrollment is claimed with a compare-and-set on `next_send_at`
//! before any work, which also acts as the crash-retry: a claimed enrollment
//! that is never written back becomes due again after the send-retry interval.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dripwise_core::config::{DripConfig, NurtureConfig};
use dripwise_core::error::{DripError, Result};
use dripwise_core::traits::{MessageSender, SubscriptionStatusProvider, TemplateRenderer};
use dripwise_core::types::Contact;
use serde::{Deserialize, Serialize};

use crate::billing::{BillingDecision, BillingGate};
use crate::budget::{PassBudget, with_timeout};
use crate::campaign::{CampaignStatus, NurtureCampaign, NurtureEnrollment, NurtureStep, PauseReason, StepKind};
use crate::persistence::SchedulerDb;
use crate::template::template_variables;

const PAUSED_ERROR: &str = "Campaign is paused.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NurturePassReport {
    /// Due enrollments fetched for this pass.
    pub scanned: usize,
    pub sent: usize,
    pub completed: usize,
    pub stopped: usize,
    /// Rescheduled because the campaign is paused or failed billing.
    pub paused: usize,
    pub failed: usize,
    /// Lost the claim to another pass, or left for the next pass.
    pub skipped: usize,
}

enum Outcome {
    Sent { completed: bool },
    Completed,
    Stopped,
    Paused,
    Failed,
}

impl NurturePassReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent { completed } => {
                self.sent += 1;
                if completed {
                    self.completed += 1;
                }
            }
            Outcome::Completed => self.completed += 1,
            Outcome::Stopped => self.stopped += 1,
            Outcome::Paused => self.paused += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Per-pass lookups shared by every enrollment of the same campaign.
struct PassState {
    gate: BillingGate,
    campaigns: HashMap<String, Option<NurtureCampaign>>,
    steps: HashMap<String, Arc<Vec<NurtureStep>>>,
}

pub struct NurtureSequencer {
    db: Arc<SchedulerDb>,
    sender: Arc<dyn MessageSender>,
    billing: Arc<dyn SubscriptionStatusProvider>,
    renderer: Arc<dyn TemplateRenderer>,
    config: NurtureConfig,
    billing_bypass: bool,
    default_from_name: String,
    timeout_secs: u64,
    pass_budget_secs: u64,
}

impl NurtureSequencer {
    pub fn new(
        db: Arc<SchedulerDb>,
        sender: Arc<dyn MessageSender>,
        billing: Arc<dyn SubscriptionStatusProvider>,
        renderer: Arc<dyn TemplateRenderer>,
        config: &DripConfig,
    ) -> Self {
        let billing_bypass = config.billing.dev_bypass(&config.messaging);
        if billing_bypass {
            tracing::warn!("💳 Billing and messaging unconfigured outside production: billing gate bypassed");
        }
        Self {
            db,
            sender,
            billing,
            renderer,
            config: config.nurture.clone(),
            billing_bypass,
            default_from_name: config.messaging.default_from_name.clone(),
            timeout_secs: config.scheduler.collaborator_timeout_secs,
            pass_budget_secs: config.scheduler.pass_budget_secs,
        }
    }

    /// Pass at the current time.
    pub async fn run(&self) -> Result<NurturePassReport> {
        self.run_pass(Utc::now()).await
    }

    /// Process up to `batch_size` due enrollments, oldest-due first.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<NurturePassReport> {
        let budget = PassBudget::start(self.pass_budget_secs);
        let due = self.db.due_enrollments(now, self.config.batch_size)?;
        let mut report = NurturePassReport {
            scanned: due.len(),
            ..Default::default()
        };
        let mut pass = PassState {
            gate: BillingGate::new(self.billing.clone(), self.billing_bypass, self.timeout_secs),
            campaigns: HashMap::new(),
            steps: HashMap::new(),
        };
        let claim_until = now + Duration::minutes(self.config.send_retry_minutes);

        for enrollment in due {
            if budget.exhausted() {
                report.skipped += 1;
                continue;
            }
            let Some(observed) = enrollment.next_send_at else {
                continue;
            };
            match self.db.claim_enrollment(&enrollment.id, observed, claim_until) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Enrollment {} claimed by another pass", enrollment.id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Claiming enrollment {} failed: {e}", enrollment.id);
                    report.skipped += 1;
                    continue;
                }
            }

            let id = enrollment.id.clone();
            match self.process(enrollment, now, &mut pass).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    // Claim stays in place, so the enrollment retries after the claim window.
                    tracing::warn!("⚠️ Enrollment {id} could not be processed: {e}");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "💧 Nurture pass: {} scanned, {} sent, {} completed, {} stopped, {} paused, {} failed, {} skipped",
            report.scanned,
            report.sent,
            report.completed,
            report.stopped,
            report.paused,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    async fn process(
        &self,
        mut enrollment: NurtureEnrollment,
        now: DateTime<Utc>,
        pass: &mut PassState,
    ) -> Result<Outcome> {
        let max_len = self.config.max_error_len;

        let Some(mut campaign) = self.campaign(&enrollment.campaign_id, pass)? else {
            enrollment.stop("Campaign no longer exists.", max_len);
            self.db.update_enrollment(&enrollment)?;
            return Ok(Outcome::Stopped);
        };

        let mut billing_checked = false;
        if campaign.status == CampaignStatus::Paused {
            if campaign.paused_reason != Some(PauseReason::Billing) {
                enrollment.reschedule(now, self.config.paused_retry_minutes, PAUSED_ERROR, max_len);
                self.db.update_enrollment(&enrollment)?;
                return Ok(Outcome::Paused);
            }
            match pass.gate.check(&campaign).await {
                BillingDecision::Allowed => {
                    self.db.set_campaign_status(&campaign.id, CampaignStatus::Active, None)?;
                    campaign.status = CampaignStatus::Active;
                    campaign.paused_reason = None;
                    pass.campaigns.insert(campaign.id.clone(), Some(campaign.clone()));
                    tracing::info!("▶️ Campaign {} resumed, billing is usable again", campaign.id);
                    billing_checked = true;
                }
                BillingDecision::Denied(reason) => {
                    enrollment.reschedule(now, self.config.billing_retry_minutes, &reason, max_len);
                    self.db.update_enrollment(&enrollment)?;
                    return Ok(Outcome::Paused);
                }
            }
        }

        if campaign.status != CampaignStatus::Active {
            let reason = format!("Campaign is {}.", campaign.status.as_str().to_lowercase());
            enrollment.stop(&reason, max_len);
            self.db.update_enrollment(&enrollment)?;
            return Ok(Outcome::Stopped);
        }

        if !billing_checked {
            if let BillingDecision::Denied(reason) = pass.gate.check(&campaign).await {
                self.db
                    .set_campaign_status(&campaign.id, CampaignStatus::Paused, Some(PauseReason::Billing))?;
                campaign.status = CampaignStatus::Paused;
                campaign.paused_reason = Some(PauseReason::Billing);
                pass.campaigns.insert(campaign.id.clone(), Some(campaign.clone()));
                tracing::warn!("⏸️ Campaign {} paused: {reason}", campaign.id);

                enrollment.reschedule(now, self.config.billing_retry_minutes, &reason, max_len);
                self.db.update_enrollment(&enrollment)?;
                return Ok(Outcome::Paused);
            }
        }

        let steps = self.steps(&campaign.id, pass)?;
        let Some(step) = steps.get(enrollment.step_index as usize) else {
            enrollment.complete();
            self.db.update_enrollment(&enrollment)?;
            return Ok(Outcome::Completed);
        };

        let Some(contact) = self.db.get_contact(&enrollment.owner_id, &enrollment.contact_id)? else {
            enrollment.stop("Contact no longer exists.", max_len);
            self.db.update_enrollment(&enrollment)?;
            return Ok(Outcome::Stopped);
        };

        match self.deliver(&campaign, step, &contact).await {
            Ok(()) => {
                let next_delay = steps
                    .get(enrollment.step_index as usize + 1)
                    .map(|s| s.delay_minutes);
                enrollment.advance(now, next_delay);
                self.db.update_enrollment(&enrollment)?;
                tracing::info!(
                    "📨 Sent step {} of campaign {} to contact {}",
                    step.ord,
                    campaign.id,
                    contact.id
                );
                Ok(Outcome::Sent {
                    completed: next_delay.is_none(),
                })
            }
            Err(e) => {
                tracing::warn!("⚠️ Step {} for enrollment {} failed: {e}", step.ord, enrollment.id);
                enrollment.reschedule(now, self.config.send_retry_minutes, &e.to_string(), max_len);
                self.db.update_enrollment(&enrollment)?;
                Ok(Outcome::Failed)
            }
        }
    }

    fn campaign(&self, id: &str, pass: &mut PassState) -> Result<Option<NurtureCampaign>> {
        if let Some(cached) = pass.campaigns.get(id) {
            return Ok(cached.clone());
        }
        let campaign = self.db.get_campaign(id)?;
        pass.campaigns.insert(id.to_string(), campaign.clone());
        Ok(campaign)
    }

    fn steps(&self, campaign_id: &str, pass: &mut PassState) -> Result<Arc<Vec<NurtureStep>>> {
        if let Some(cached) = pass.steps.get(campaign_id) {
            return Ok(cached.clone());
        }
        let steps = Arc::new(self.db.load_steps(campaign_id)?);
        pass.steps.insert(campaign_id.to_string(), steps.clone());
        Ok(steps)
    }

    /// Render and send one step.
    async fn deliver(&self, campaign: &NurtureCampaign, step: &NurtureStep, contact: &Contact) -> Result<()> {
        let business_name = self
            .db
            .owner_business_name(&campaign.owner_id)?
            .filter(|name| !name.trim().is_empty());
        let from_name = business_name.as_deref().unwrap_or(&self.default_from_name);
        let variables = template_variables(contact, from_name);
        let body = self.renderer.render(&step.body, &variables)?;

        match step.kind {
            StepKind::Sms => {
                let phone = non_empty(contact.phone.as_deref())
                    .ok_or_else(|| DripError::delivery("Contact has no phone number."))?;
                let text = append_footer(&body, &campaign.sms_footer);
                with_timeout(self.timeout_secs, self.sender.send_sms(phone, &text)).await
            }
            StepKind::Email => {
                let email = non_empty(contact.email.as_deref())
                    .ok_or_else(|| DripError::delivery("Contact has no email address."))?;
                let subject = match step.subject.as_deref() {
                    Some(subject) if !subject.trim().is_empty() => self.renderer.render(subject, &variables)?,
                    _ => campaign.name.clone(),
                };
                let footer = if campaign.email_footer.trim().is_empty() {
                    " "
                } else {
                    campaign.email_footer.as_str()
                };
                let text = append_footer(&body, footer);
                let send = self.sender.send_email(email, &subject, &text, from_name);
                with_timeout(self.timeout_secs, send).await
            }
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Footer goes after a blank line. A blank footer leaves the body alone
/// unless the body itself is empty.
fn append_footer(body: &str, footer: &str) -> String {
    if footer.trim().is_empty() {
        if body.is_empty() {
            return footer.to_string();
        }
        return body.to_string();
    }
    if body.is_empty() {
        return footer.to_string();
    }
    format!("{body}\n\n{footer}")
}
