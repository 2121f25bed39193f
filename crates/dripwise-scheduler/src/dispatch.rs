//! HTTP adapters for the collaborator traits: action-chain webhook,
//! messaging relay and Stripe subscription lookup. Plus fallbacks for a
//! missing endpoint: log-only in unconfigured development setups, an error
//! everywhere else so nothing is silently recorded as delivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dripwise_core::config::{BillingConfig, DripConfig};
use dripwise_core::error::{DripError, Result};
use dripwise_core::traits::{AutomationActionRunner, MessageSender, SubscriptionStatusProvider};
use dripwise_core::types::{SubscriptionStatus, TriggerInvocation};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Read a failed response into an error message.
async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    }
}

/// POSTs each trigger invocation to the action-chain service.
pub struct WebhookActionRunner {
    client: reqwest::Client,
    url: String,
}

impl WebhookActionRunner {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl AutomationActionRunner for WebhookActionRunner {
    async fn run_trigger_node(&self, invocation: TriggerInvocation) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&invocation)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| DripError::action(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!(
                "🌐 Action webhook accepted {}:{}",
                invocation.automation_id,
                invocation.trigger_node_id
            );
            Ok(())
        } else {
            Err(DripError::action(format!("Webhook error {}", error_body(resp).await)))
        }
    }
}

/// Logs invocations instead of running them.
pub struct LogActionRunner;

#[async_trait]
impl AutomationActionRunner for LogActionRunner {
    async fn run_trigger_node(&self, invocation: TriggerInvocation) -> Result<()> {
        tracing::info!(
            "📝 [no action webhook] {} {}:{} ({})",
            invocation.owner_id,
            invocation.automation_id,
            invocation.trigger_node_id,
            invocation.trigger_kind.as_str()
        );
        Ok(())
    }
}

/// Sends SMS and email through an HTTP messaging relay
/// (`POST {relay}/sms`, `POST {relay}/email`).
pub struct RelayMessageSender {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RelayMessageSender {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let mut req = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(&body)
            .timeout(HTTP_TIMEOUT);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DripError::delivery(format!("Relay send failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(DripError::delivery(format!("Relay error {}", error_body(resp).await)))
        }
    }
}

#[async_trait]
impl MessageSender for RelayMessageSender {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        self.post("sms", serde_json::json!({ "to": to, "body": body }))
            .await
    }

    async fn send_email(&self, to: &str, subject: &str, text: &str, from_name: &str) -> Result<()> {
        self.post(
            "email",
            serde_json::json!({
                "to": to,
                "subject": subject,
                "text": text,
                "fromName": from_name,
            }),
        )
        .await
    }
}

/// Endpoint missing outside development: every call fails.
pub struct UnconfiguredActionRunner;

#[async_trait]
impl AutomationActionRunner for UnconfiguredActionRunner {
    async fn run_trigger_node(&self, _invocation: TriggerInvocation) -> Result<()> {
        Err(DripError::action("action webhook not configured"))
    }
}

/// Relay missing outside development: sends fail so the step retries.
pub struct UnconfiguredMessageSender;

#[async_trait]
impl MessageSender for UnconfiguredMessageSender {
    async fn send_sms(&self, _to: &str, _body: &str) -> Result<()> {
        Err(DripError::delivery("messaging relay not configured"))
    }

    async fn send_email(&self, _to: &str, _subject: &str, _text: &str, _from_name: &str) -> Result<()> {
        Err(DripError::delivery("messaging relay not configured"))
    }
}

/// Logs messages instead of sending them.
pub struct LogMessageSender;

#[async_trait]
impl MessageSender for LogMessageSender {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        tracing::info!("📱 [no relay] SMS to {to}: {body}");
        Ok(())
    }

    async fn send_email(&self, to: &str, subject: &str, _text: &str, from_name: &str) -> Result<()> {
        tracing::info!("📧 [no relay] Email to {to} from '{from_name}': {subject}");
        Ok(())
    }
}

/// Reads subscription status from the Stripe API.
pub struct StripeSubscriptionProvider {
    client: reqwest::Client,
    api_base: String,
    secret_key: Option<String>,
}

impl StripeSubscriptionProvider {
    pub fn new(api_base: &str, secret_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl SubscriptionStatusProvider for StripeSubscriptionProvider {
    async fn get_status(&self, subscription_id: &str) -> Result<SubscriptionStatus> {
        let Some(key) = &self.secret_key else {
            return Err(DripError::billing("Stripe is not configured"));
        };
        let resp = self
            .client
            .get(format!("{}/v1/subscriptions/{subscription_id}", self.api_base))
            .basic_auth(key, None::<&str>)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| DripError::billing(format!("Stripe request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(DripError::billing(format!("Stripe error {}", error_body(resp).await)));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DripError::billing(format!("Stripe response unreadable: {e}")))?;
        let status = body["status"]
            .as_str()
            .ok_or_else(|| DripError::billing("Stripe response has no status"))?;
        Ok(SubscriptionStatus::parse(status))
    }
}

/// Webhook runner when configured. Otherwise log-only under the dev bypass,
/// failing everywhere else.
pub fn action_runner_from_config(config: &DripConfig) -> Arc<dyn AutomationActionRunner> {
    match config.actions.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(WebhookActionRunner::new(url)),
        _ if config.billing.dev_bypass(&config.messaging) => {
            tracing::warn!("⚠️ actions.webhook_url not set: fired automations are only logged");
            Arc::new(LogActionRunner)
        }
        _ => {
            tracing::error!("❌ actions.webhook_url not set: every fired automation will fail");
            Arc::new(UnconfiguredActionRunner)
        }
    }
}

/// Relay sender when configured. Otherwise log-only under the dev bypass,
/// failing everywhere else.
pub fn message_sender_from_config(config: &DripConfig) -> Arc<dyn MessageSender> {
    let messaging = &config.messaging;
    match messaging.relay_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(RelayMessageSender::new(url, messaging.relay_token.clone())),
        _ if config.billing.dev_bypass(messaging) => {
            tracing::warn!("⚠️ messaging.relay_url not set: nurture messages are only logged");
            Arc::new(LogMessageSender)
        }
        _ => {
            tracing::error!("❌ messaging.relay_url not set: nurture sends will fail and retry");
            Arc::new(UnconfiguredMessageSender)
        }
    }
}

pub fn subscription_provider_from_config(config: &BillingConfig) -> Arc<dyn SubscriptionStatusProvider> {
    Arc::new(StripeSubscriptionProvider::new(
        &config.stripe_api_base,
        config.stripe_secret_key.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stripe_without_key_fails_fast() {
        let provider = StripeSubscriptionProvider::new("https://api.stripe.com/", Some("  ".into()));
        let err = provider.get_status("sub_1").await.unwrap_err();
        assert!(matches!(err, DripError::Billing(_)));
    }

    #[test]
    fn test_relay_url_normalized() {
        let sender = RelayMessageSender::new("https://relay.example.com/", None);
        assert_eq!(sender.base_url, "https://relay.example.com");
    }

    fn invocation() -> TriggerInvocation {
        TriggerInvocation {
            owner_id: "o1".into(),
            automation_id: "a1".into(),
            trigger_node_id: "n1".into(),
            trigger_kind: dripwise_core::types::TriggerKind::InboundSms,
            payload: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_log_fallbacks_succeed_in_dev() {
        let config = DripConfig::default();
        assert!(action_runner_from_config(&config).run_trigger_node(invocation()).await.is_ok());
        assert!(message_sender_from_config(&config).send_sms("+15550100", "hi").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_endpoints_fail_in_production() {
        let mut config = DripConfig::default();
        config.billing.environment = "production".into();
        config.billing.stripe_secret_key = Some("sk_live_x".into());

        let err = message_sender_from_config(&config)
            .send_email("a@example.com", "Hi", "Body", "Spa")
            .await
            .unwrap_err();
        assert!(matches!(err, DripError::Delivery(_)));
        let err = action_runner_from_config(&config)
            .run_trigger_node(invocation())
            .await
            .unwrap_err();
        assert!(matches!(err, DripError::Action(_)));
    }

    #[tokio::test]
    async fn test_stripe_key_alone_disables_log_fallback() {
        let mut config = DripConfig::default();
        config.billing.stripe_secret_key = Some("sk_test_x".into());
        assert!(message_sender_from_config(&config).send_sms("+15550100", "hi").await.is_err());
    }
}
