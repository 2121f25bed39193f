//! Billing gate for nurture campaigns.
//!
//! A gate lives for exactly one sequencer pass; its cache is keyed by
//! `(owner, campaign)` so a batch of enrollments sharing a campaign costs one
//! provider call.

use std::collections::HashMap;
use std::sync::Arc;

use dripwise_core::traits::SubscriptionStatusProvider;

use crate::budget::with_timeout;
use crate::campaign::NurtureCampaign;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingDecision {
    Allowed,
    /// Carries the operator-visible reason.
    Denied(String),
}

impl BillingDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BillingDecision::Allowed)
    }
}

pub struct BillingGate {
    provider: Arc<dyn SubscriptionStatusProvider>,
    bypass: bool,
    timeout_secs: u64,
    cache: HashMap<(String, String), BillingDecision>,
}

impl BillingGate {
    /// `bypass` short-circuits every check to allowed (unconfigured dev setups).
    pub fn new(provider: Arc<dyn SubscriptionStatusProvider>, bypass: bool, timeout_secs: u64) -> Self {
        Self {
            provider,
            bypass,
            timeout_secs,
            cache: HashMap::new(),
        }
    }

    pub async fn check(&mut self, campaign: &NurtureCampaign) -> BillingDecision {
        if self.bypass {
            return BillingDecision::Allowed;
        }
        let key = (campaign.owner_id.clone(), campaign.id.clone());
        if let Some(decision) = self.cache.get(&key) {
            return decision.clone();
        }

        let decision = self.evaluate(campaign).await;
        if let BillingDecision::Denied(reason) = &decision {
            tracing::info!("💳 Billing denied for campaign {}: {reason}", campaign.id);
        }
        self.cache.insert(key, decision.clone());
        decision
    }

    async fn evaluate(&self, campaign: &NurtureCampaign) -> BillingDecision {
        let subscription_id = match campaign.stripe_subscription_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => {
                return BillingDecision::Denied(
                    "Billing required: no subscription is linked to this campaign.".into(),
                );
            }
        };

        let lookup = self.provider.get_status(subscription_id);
        match with_timeout(self.timeout_secs, lookup).await {
            Ok(status) if status.is_usable() => BillingDecision::Allowed,
            Ok(status) => BillingDecision::Denied(format!("Billing inactive: subscription is {status}.")),
            Err(e) => BillingDecision::Denied(format!("Billing check failed: {e}")),
        }
    }

    /// Number of cached decisions in this pass.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBilling;
    use dripwise_core::types::SubscriptionStatus;

    fn campaign(id: &str, subscription: Option<&str>) -> NurtureCampaign {
        let mut c = NurtureCampaign::new(id, "o1", "Welcome");
        c.stripe_subscription_id = subscription.map(String::from);
        c
    }

    #[tokio::test]
    async fn test_usable_statuses_allowed() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
        ] {
            let provider = Arc::new(FakeBilling::with("sub_1", status));
            let mut gate = BillingGate::new(provider, false, 5);
            assert!(gate.check(&campaign("c1", Some("sub_1"))).await.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_canceled_denied() {
        let provider = Arc::new(FakeBilling::with("sub_1", SubscriptionStatus::parse("canceled")));
        let mut gate = BillingGate::new(provider, false, 5);
        let decision = gate.check(&campaign("c1", Some("sub_1"))).await;
        assert_eq!(
            decision,
            BillingDecision::Denied("Billing inactive: subscription is canceled.".into())
        );
    }

    #[tokio::test]
    async fn test_missing_subscription_denied_without_call() {
        let provider = Arc::new(FakeBilling::default());
        let mut gate = BillingGate::new(provider.clone(), false, 5);
        assert!(!gate.check(&campaign("c1", None)).await.is_allowed());
        assert!(!gate.check(&campaign("c2", Some("  "))).await.is_allowed());
        assert_eq!(provider.count(), 0);
    }

    #[tokio::test]
    async fn test_cached_per_campaign() {
        let provider = Arc::new(FakeBilling::with("sub_1", SubscriptionStatus::Active));
        let mut gate = BillingGate::new(provider.clone(), false, 5);
        for _ in 0..3 {
            gate.check(&campaign("c1", Some("sub_1"))).await;
        }
        gate.check(&campaign("c2", Some("sub_1"))).await;
        assert_eq!(provider.count(), 2);
        assert_eq!(gate.cached(), 2);
    }

    #[tokio::test]
    async fn test_provider_error_denies() {
        let provider = Arc::new(FakeBilling::default());
        let mut gate = BillingGate::new(provider, false, 5);
        let decision = gate.check(&campaign("c1", Some("sub_missing"))).await;
        assert!(matches!(decision, BillingDecision::Denied(reason) if reason.starts_with("Billing check failed")));
    }

    #[tokio::test]
    async fn test_bypass_allows_everything() {
        let provider = Arc::new(FakeBilling::default());
        let mut gate = BillingGate::new(provider.clone(), true, 5);
        assert!(gate.check(&campaign("c1", None)).await.is_allowed());
        assert_eq!(provider.count(), 0);
    }
}
