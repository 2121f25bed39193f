//! # Dripwise Scheduler
//!
//! Trigger scheduling and drip sequencing for multi-tenant CRM automations.
//!
//! ## Architecture
//! ```text
//! external cron ─► worker binary
//!   ├── ScheduledAutomationRunner::run_scheduled_pass
//!   │     per tenant (leased): load automations + schedule state
//!   │       → occurrence::is_due per scheduled_time trigger
//!   │       → AutomationActionRunner (failures swallowed)
//!   │       → one schedule-state write
//!   └── NurtureSequencer::run_pass
//!         due enrollments (claimed) → campaign status → BillingGate
//!           → TemplateRenderer → MessageSender → advance / backoff
//!
//! request handlers ─► EventDispatcher
//!   ├── dispatch_event (inbound_sms, ...)
//!   └── dispatch_missed_appointments (fired-set dedup)
//! ```

pub mod automation;
pub mod billing;
pub mod budget;
pub mod campaign;
pub mod dispatch;
pub mod engine;
pub mod nurture;
pub mod occurrence;
pub mod persistence;
pub mod template;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use automation::{Automation, AutomationRecord, RawNode, ScheduleState};
pub use billing::{BillingDecision, BillingGate};
pub use campaign::{CampaignStatus, EnrollmentStatus, NurtureCampaign, NurtureEnrollment, NurtureStep, StepKind};
pub use engine::{ScheduledAutomationRunner, ScheduledPassReport, run_worker_loop};
pub use nurture::{NurturePassReport, NurtureSequencer};
pub use occurrence::{EveryUnit, ScheduleConfig, SpecificKind, SpecificSchedule};
pub use persistence::SchedulerDb;
pub use template::BraceTemplateRenderer;
pub use workflow::{Booking, EventDispatcher, MissedAppointmentReport};
