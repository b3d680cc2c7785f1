//! MercadoPago API client trait.
//!
//! Subscriptions are MercadoPago "preapprovals": recurring authorizations
//! tied to a payer email and an `external_reference` (the tenant id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::billing::error::BillingResult;

/// Currency every Clinify preapproval is billed in.
pub const CURRENCY_ID: &str = "BRL";

/// Request to create a pending preapproval.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePreapprovalRequest {
    /// Description shown to the payer.
    pub reason: String,
    /// Tenant id.
    pub external_reference: String,
    pub payer_email: String,
    /// Where the payer returns after authorizing.
    pub back_url: String,
    /// Monthly amount.
    pub transaction_amount: f64,
}

/// Recurrence of a preapproval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRecurring {
    #[serde(default)]
    pub frequency: u32,
    #[serde(default)]
    pub frequency_type: String,
    #[serde(default)]
    pub transaction_amount: f64,
    #[serde(default)]
    pub currency_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

/// A MercadoPago preapproval as returned by the API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Preapproval {
    pub id: String,
    /// Raw status (`pending`, `authorized`, `paused`, `cancelled`).
    pub status: String,
    pub external_reference: Option<String>,
    pub payer_id: Option<serde_json::Value>,
    pub init_point: Option<String>,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub auto_recurring: Option<AutoRecurring>,
}

impl Preapproval {
    /// Monthly amount, when reported.
    #[must_use]
    pub fn amount(&self) -> Option<f64> {
        self.auto_recurring.as_ref().map(|r| r.transaction_amount)
    }
}

/// MercadoPago operations used by the billing adapter.
#[async_trait]
pub trait MercadoPagoApi: Send + Sync {
    /// Find a customer by email.
    async fn search_customer_by_email(&self, email: &str) -> BillingResult<Option<String>>;

    /// Create a customer and return its id.
    async fn create_customer(&self, email: &str, name: Option<&str>) -> BillingResult<String>;

    /// Create a pending preapproval the payer must authorize at `init_point`.
    async fn create_preapproval(
        &self,
        request: CreatePreapprovalRequest,
    ) -> BillingResult<Preapproval>;

    /// List preapprovals for a tenant.
    async fn search_preapprovals(&self, external_reference: &str)
    -> BillingResult<Vec<Preapproval>>;

    async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval>;

    /// Cancel a preapproval immediately.
    async fn cancel_preapproval(&self, preapproval_id: &str) -> BillingResult<()>;

    /// Stop charging a preapproval after `end_date`.
    async fn end_preapproval_at(
        &self,
        preapproval_id: &str,
        end_date: DateTime<Utc>,
    ) -> BillingResult<()>;
}

/// Mock MercadoPago API for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Mock [`MercadoPagoApi`] with in-memory customers and preapprovals.
    #[derive(Default)]
    pub struct MockMercadoPagoApi {
        customer_counter: AtomicU64,
        preapproval_counter: AtomicU64,
        customers: RwLock<HashMap<String, String>>,
        preapprovals: RwLock<HashMap<String, Preapproval>>,
        fail_requests: AtomicBool,
    }

    impl MockMercadoPagoApi {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an existing customer.
        pub fn add_customer(&self, email: &str, customer_id: &str) {
            self.customers
                .write()
                .unwrap()
                .insert(email.to_string(), customer_id.to_string());
        }

        /// Seed or replace a preapproval.
        pub fn put_preapproval(&self, preapproval: Preapproval) {
            self.preapprovals
                .write()
                .unwrap()
                .insert(preapproval.id.clone(), preapproval);
        }

        /// Change a preapproval's status, as the payer authorizing it would.
        pub fn set_status(&self, preapproval_id: &str, status: &str) {
            if let Some(p) = self.preapprovals.write().unwrap().get_mut(preapproval_id) {
                p.status = status.to_string();
            }
        }

        #[must_use]
        pub fn preapproval(&self, preapproval_id: &str) -> Option<Preapproval> {
            self.preapprovals.read().unwrap().get(preapproval_id).cloned()
        }

        #[must_use]
        pub fn customer_count(&self) -> usize {
            self.customers.read().unwrap().len()
        }

        /// Make every call fail with a MercadoPago 500.
        pub fn fail_requests(&self, fail: bool) {
            self.fail_requests.store(fail, Ordering::SeqCst);
        }

        fn check(&self, operation: &str) -> BillingResult<()> {
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(BillingError::upstream(
                    "mercadopago",
                    operation,
                    "mock failure",
                    Some(500),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MercadoPagoApi for MockMercadoPagoApi {
        async fn search_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
            self.check("search_customer")?;
            Ok(self.customers.read().unwrap().get(email).cloned())
        }

        async fn create_customer(&self, email: &str, _name: Option<&str>) -> BillingResult<String> {
            self.check("create_customer")?;
            let id = format!(
                "mp_cus_{}",
                self.customer_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.add_customer(email, &id);
            Ok(id)
        }

        async fn create_preapproval(
            &self,
            request: CreatePreapprovalRequest,
        ) -> BillingResult<Preapproval> {
            self.check("create_preapproval")?;
            let id = format!(
                "pre_{}",
                self.preapproval_counter.fetch_add(1, Ordering::SeqCst)
            );
            let preapproval = Preapproval {
                id: id.clone(),
                status: "pending".to_string(),
                external_reference: Some(request.external_reference),
                payer_id: None,
                init_point: Some(format!(
                    "https://www.mercadopago.com.br/subscriptions/checkout?preapproval_id={}",
                    id
                )),
                next_payment_date: None,
                auto_recurring: Some(AutoRecurring {
                    frequency: 1,
                    frequency_type: "months".to_string(),
                    transaction_amount: request.transaction_amount,
                    currency_id: CURRENCY_ID.to_string(),
                    end_date: None,
                }),
            };
            self.put_preapproval(preapproval.clone());
            Ok(preapproval)
        }

        async fn search_preapprovals(
            &self,
            external_reference: &str,
        ) -> BillingResult<Vec<Preapproval>> {
            self.check("search_preapprovals")?;
            Ok(self
                .preapprovals
                .read()
                .unwrap()
                .values()
                .filter(|p| p.external_reference.as_deref() == Some(external_reference))
                .cloned()
                .collect())
        }

        async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval> {
            self.check("get_preapproval")?;
            self.preapproval(preapproval_id).ok_or_else(|| {
                BillingError::upstream(
                    "mercadopago",
                    "get_preapproval",
                    "preapproval not found",
                    Some(404),
                )
            })
        }

        async fn cancel_preapproval(&self, preapproval_id: &str) -> BillingResult<()> {
            self.check("cancel_preapproval")?;
            self.set_status(preapproval_id, "cancelled");
            Ok(())
        }

        async fn end_preapproval_at(
            &self,
            preapproval_id: &str,
            end_date: DateTime<Utc>,
        ) -> BillingResult<()> {
            self.check("end_preapproval_at")?;
            let mut preapprovals = self.preapprovals.write().unwrap();
            if let Some(recurring) = preapprovals
                .get_mut(preapproval_id)
                .and_then(|p| p.auto_recurring.as_mut())
            {
                recurring.end_date = Some(end_date);
            }
            Ok(())
        }
    }
}
