//! Recording fakes of the collaborator traits, shared by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dripwise_core::error::{DripError, Result};
use dripwise_core::traits::{AutomationActionRunner, MessageSender, SubscriptionStatusProvider};
use dripwise_core::types::{SubscriptionStatus, TriggerInvocation};

#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<TriggerInvocation>>,
    /// Invocations for this automation id fail after being recorded.
    pub fail_automation: Option<String>,
}

impl RecordingRunner {
    pub fn failing_for(automation_id: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_automation: Some(automation_id.to_string()),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AutomationActionRunner for RecordingRunner {
    async fn run_trigger_node(&self, invocation: TriggerInvocation) -> Result<()> {
        let fail = self.fail_automation.as_deref() == Some(invocation.automation_id.as_str());
        self.calls.lock().unwrap().push(invocation);
        if fail {
            return Err(DripError::action("action chain blew up"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBilling {
    pub statuses: Mutex<HashMap<String, SubscriptionStatus>>,
    pub calls: AtomicUsize,
}

impl FakeBilling {
    pub fn with(subscription_id: &str, status: SubscriptionStatus) -> Self {
        let billing = Self::default();
        billing.set(subscription_id, status);
        billing
    }

    pub fn set(&self, subscription_id: &str, status: SubscriptionStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), status);
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionStatusProvider for FakeBilling {
    async fn get_status(&self, subscription_id: &str) -> Result<SubscriptionStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| DripError::billing(format!("No such subscription: {subscription_id}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub from_name: String,
}

#[derive(Default)]
pub struct RecordingSender {
    pub sms: Mutex<Vec<(String, String)>>,
    pub emails: Mutex<Vec<SentEmail>>,
    pub fail: AtomicBool,
}

impl RecordingSender {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> usize {
        self.sms.lock().unwrap().len() + self.emails.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DripError::delivery("carrier rejected message"));
        }
        self.sms.lock().unwrap().push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn send_email(&self, to: &str, subject: &str, text: &str, from_name: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DripError::delivery("mailbox unavailable"));
        }
        self.emails.lock().unwrap().push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            text: text.to_string(),
            from_name: from_name.to_string(),
        });
        Ok(())
    }
}
