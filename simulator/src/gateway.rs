//! Simulated payment gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;

use vaultline_common::PaymentReference;
use vaultline_payments::{
    Checkout, CheckoutRequest, PaymentProvider, ProviderError, ProviderResult, Verification,
    SUCCESS_STATUS,
};

/// A payment gateway that settles every checkout it opened, declining a
/// configurable share of them.
pub struct SimulatedGateway {
    checkouts: RwLock<HashMap<PaymentReference, CheckoutRequest>>,
    /// Status forced for specific references.
    forced: RwLock<HashMap<PaymentReference, String>>,
    offline: AtomicBool,
    /// Decline probability in parts per thousand.
    decline_per_mille: AtomicU64,
    latency_ms: AtomicU64,
    rng: RwLock<StdRng>,
}

impl SimulatedGateway {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            checkouts: RwLock::new(HashMap::new()),
            forced: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            decline_per_mille: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            rng: RwLock::new(rng),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, delay: Duration) {
        self.latency_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Share of verifications reported as declined, 0.0 to 1.0.
    pub fn set_decline_rate(&self, rate: f64) {
        let per_mille = (rate.clamp(0.0, 1.0) * 1000.0).round() as u64;
        self.decline_per_mille.store(per_mille, Ordering::SeqCst);
    }

    pub async fn force_status(&self, reference: &PaymentReference, status: &str) {
        self.forced
            .write()
            .await
            .insert(reference.clone(), status.to_string());
    }

    /// Clear every injected fault.
    pub async fn reset(&self) {
        self.set_offline(false);
        self.set_latency(Duration::ZERO);
        self.set_decline_rate(0.0);
        self.forced.write().await.clear();
    }

    /// Webhook body the gateway would post for `reference`.
    pub async fn webhook_body(
        &self,
        reference: &PaymentReference,
        status: &str,
    ) -> Option<Vec<u8>> {
        let checkouts = self.checkouts.read().await;
        let checkout = checkouts.get(reference)?;
        let body = serde_json::json!({
            "event": "charge.completed",
            "data": {
                "reference": reference.as_str(),
                "status": status,
                "amount": checkout.amount_minor()?,
                "currency": checkout.amount.currency.code(),
            }
        });
        serde_json::to_vec(&body).ok()
    }

    async fn simulate_network(&self) -> ProviderResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Unreachable("gateway offline".to_string()));
        }
        Ok(())
    }

    async fn decide_status(&self, reference: &PaymentReference) -> String {
        if let Some(status) = self.forced.read().await.get(reference) {
            return status.clone();
        }
        let per_mille = self.decline_per_mille.load(Ordering::SeqCst);
        let roll = self.rng.write().await.gen_range(0..1000);
        if roll < per_mille {
            "failed".to_string()
        } else {
            SUCCESS_STATUS.to_string()
        }
    }
}

#[async_trait]
impl PaymentProvider for SimulatedGateway {
    fn name(&self) -> &str {
        "simulated-gateway"
    }

    async fn initialize(&self, request: &CheckoutRequest) -> ProviderResult<Checkout> {
        self.simulate_network().await?;
        if request.amount_minor().is_none() {
            return Err(ProviderError::CheckoutRefused(format!(
                "cannot charge {}",
                request.amount
            )));
        }
        self.checkouts
            .write()
            .await
            .insert(request.reference.clone(), request.clone());
        Ok(Checkout {
            reference: request.reference.clone(),
            checkout_url: format!("https://pay.simulated.local/c/{}", request.reference),
            access_code: None,
        })
    }

    async fn verify(&self, reference: &PaymentReference) -> ProviderResult<Verification> {
        self.simulate_network().await?;
        let request = self
            .checkouts
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownReference(reference.clone()))?;
        let amount = request
            .amount_minor()
            .ok_or_else(|| ProviderError::MalformedResponse("amount overflow".to_string()))?;

        Ok(Verification {
            reference: reference.clone(),
            status: self.decide_status(reference).await,
            amount,
            currency: request.amount.currency.clone(),
            paid_at: None,
        })
    }
}
