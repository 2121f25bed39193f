//! Collaborator traits. The scheduling core only ever talks to the outside
//! world (action chains, billing, messaging, templates) through these.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{SubscriptionStatus, TriggerInvocation};

/// Executes the action chain downstream of one trigger node.
///
/// Errors are reported back but never treated as fatal by the scheduler.
#[async_trait]
pub trait AutomationActionRunner: Send + Sync {
    async fn run_trigger_node(&self, invocation: TriggerInvocation) -> Result<()>;
}

/// Looks up the billing status of a subscription.
#[async_trait]
pub trait SubscriptionStatusProvider: Send + Sync {
    async fn get_status(&self, subscription_id: &str) -> Result<SubscriptionStatus>;
}

/// Transmits SMS and email messages.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()>;

    async fn send_email(&self, to: &str, subject: &str, text: &str, from_name: &str) -> Result<()>;
}

/// Renders `{var.path}` style templates against a JSON variable tree.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, variables: &serde_json::Value) -> Result<String>;
}
