//! SeaORM-backed billing storage.
//!
//! Reads and writes the `subscriptions` table, counts rows in the tenant-owned
//! tables for quota checks, and deletes tenants for the retention sweep.
//! Deleting a tenant relies on `ON DELETE CASCADE` foreign keys to remove the
//! tenant's data.
//!
//! # Example
//!
//! ```rust,ignore
//! use clinify_billing::billing::SeaOrmBillingStore;
//!
//! let db = sea_orm::Database::connect(&config.database_url).await?;
//! let store = Arc::new(SeaOrmBillingStore::new(db));
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};

use super::plans::{PlanId, ResourceKind};
use super::storage::{
    BillingStore, ProviderKind, StoredSubscription, SubscriptionStatus, TenantStore, UsageStore,
};
use crate::error::{ClinifyError, Result};

mod entity {
    pub mod subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub tenant_id: String,
            pub plan: String,
            pub status: String,
            pub started_at: DateTimeWithTimeZone,
            pub ends_at: Option<DateTimeWithTimeZone>,
            pub cancel_at_period_end: bool,
            pub canceled_at: Option<DateTimeWithTimeZone>,
            pub stripe_customer_id: Option<String>,
            pub mercadopago_customer_id: Option<String>,
            pub provider: Option<String>,
            pub provider_subscription_id: Option<String>,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod processed_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_processed_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub provider: String,
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod tenant {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tenants")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    /// Tenant-owned tables that are only counted.
    macro_rules! counted_table {
        ($module:ident, $table:tt, $time_column:ident) => {
            pub mod $module {
                use sea_orm::entity::prelude::*;

                #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
                #[sea_orm(table_name = $table)]
                pub struct Model {
                    #[sea_orm(primary_key, auto_increment = false)]
                    pub id: String,
                    pub tenant_id: String,
                    pub $time_column: DateTimeWithTimeZone,
                }

                #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
                pub enum Relation {}

                impl ActiveModelBehavior for ActiveModel {}
            }
        };
    }

    counted_table!(patient, "patients", created_at);
    counted_table!(user, "users", created_at);
    counted_table!(transaction, "transactions", created_at);
    counted_table!(appointment, "appointments", start_time);
}

use entity::{appointment, patient, processed_event, subscription, tenant, transaction, user};

/// Convert a count to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_utc(value: sea_orm::prelude::DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

/// Convert a database model to a StoredSubscription.
fn model_to_stored_subscription(model: subscription::Model) -> StoredSubscription {
    StoredSubscription {
        tenant_id: model.tenant_id,
        plan: PlanId::parse_lossy(&model.plan),
        status: SubscriptionStatus::parse_lossy(&model.status),
        started_at: to_utc(model.started_at),
        ends_at: model.ends_at.map(to_utc),
        cancel_at_period_end: model.cancel_at_period_end,
        canceled_at: model.canceled_at.map(to_utc),
        stripe_customer_id: model.stripe_customer_id,
        mercadopago_customer_id: model.mercadopago_customer_id,
        provider: model.provider.and_then(|p| p.parse().ok()),
        provider_subscription_id: model.provider_subscription_id,
        updated_at: to_utc(model.updated_at),
    }
}

fn subscription_to_active_model(sub: &StoredSubscription) -> subscription::ActiveModel {
    subscription::ActiveModel {
        tenant_id: Set(sub.tenant_id.clone()),
        plan: Set(sub.plan.as_str().to_string()),
        status: Set(sub.status.as_str().to_string()),
        started_at: Set(sub.started_at.fixed_offset()),
        ends_at: Set(sub.ends_at.map(|d| d.fixed_offset())),
        cancel_at_period_end: Set(sub.cancel_at_period_end),
        canceled_at: Set(sub.canceled_at.map(|d| d.fixed_offset())),
        stripe_customer_id: Set(sub.stripe_customer_id.clone()),
        mercadopago_customer_id: Set(sub.mercadopago_customer_id.clone()),
        provider: Set(sub.provider.map(|p| p.as_str().to_string())),
        provider_subscription_id: Set(sub.provider_subscription_id.clone()),
        updated_at: Set(sub.updated_at.fixed_offset()),
    }
}

/// SeaORM-backed store implementing [`BillingStore`], [`UsageStore`] and
/// [`TenantStore`].
#[derive(Clone, Debug)]
pub struct SeaOrmBillingStore {
    db: DatabaseConnection,
}

impl SeaOrmBillingStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl BillingStore for SeaOrmBillingStore {
    async fn get_subscription(&self, tenant_id: &str) -> Result<Option<StoredSubscription>> {
        tracing::debug!(tenant_id = %tenant_id, "fetching subscription");

        let model = subscription::Entity::find_by_id(tenant_id)
            .one(&self.db)
            .await?;

        Ok(model.map(model_to_stored_subscription))
    }

    async fn save_subscription(&self, sub: &StoredSubscription) -> Result<()> {
        tracing::debug!(
            tenant_id = %sub.tenant_id,
            plan = %sub.plan,
            status = %sub.status,
            "saving subscription"
        );

        subscription::Entity::insert(subscription_to_active_model(sub))
            .on_conflict(
                OnConflict::column(subscription::Column::TenantId)
                    .update_columns([
                        subscription::Column::Plan,
                        subscription::Column::Status,
                        subscription::Column::StartedAt,
                        subscription::Column::EndsAt,
                        subscription::Column::CancelAtPeriodEnd,
                        subscription::Column::CanceledAt,
                        subscription::Column::StripeCustomerId,
                        subscription::Column::MercadopagoCustomerId,
                        subscription::Column::Provider,
                        subscription::Column::ProviderSubscriptionId,
                        subscription::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        Ok(())
    }

    async fn delete_subscription(&self, tenant_id: &str) -> Result<()> {
        tracing::debug!(tenant_id = %tenant_id, "deleting subscription");

        let result = subscription::Entity::delete_by_id(tenant_id)
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ClinifyError::not_found(format!(
                "subscription for tenant {}",
                tenant_id
            )));
        }
        Ok(())
    }

    async fn find_by_provider_subscription(
        &self,
        provider: ProviderKind,
        provider_subscription_id: &str,
    ) -> Result<Option<StoredSubscription>> {
        let model = subscription::Entity::find()
            .filter(subscription::Column::Provider.eq(provider.as_str()))
            .filter(subscription::Column::ProviderSubscriptionId.eq(provider_subscription_id))
            .one(&self.db)
            .await?;

        Ok(model.map(model_to_stored_subscription))
    }

    async fn find_by_customer_id(
        &self,
        provider: ProviderKind,
        customer_id: &str,
    ) -> Result<Option<StoredSubscription>> {
        let column = match provider {
            ProviderKind::Stripe => subscription::Column::StripeCustomerId,
            ProviderKind::MercadoPago => subscription::Column::MercadopagoCustomerId,
        };

        let model = subscription::Entity::find()
            .filter(column.eq(customer_id))
            .one(&self.db)
            .await?;

        Ok(model.map(model_to_stored_subscription))
    }

    async fn list_lapsed(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredSubscription>> {
        let paid_plans: Vec<&str> = PlanId::PAID.iter().map(PlanId::as_str).collect();

        let models = subscription::Entity::find()
            .filter(subscription::Column::Plan.is_in(paid_plans))
            .filter(subscription::Column::Status.is_in([
                SubscriptionStatus::Canceled.as_str(),
                SubscriptionStatus::PastDue.as_str(),
            ]))
            .filter(subscription::Column::EndsAt.lte(cutoff.fixed_offset()))
            .all(&self.db)
            .await?;

        Ok(models.into_iter().map(model_to_stored_subscription).collect())
    }

    async fn is_event_processed(&self, provider: ProviderKind, event_id: &str) -> Result<bool> {
        let event = processed_event::Entity::find_by_id((
            provider.as_str().to_string(),
            event_id.to_string(),
        ))
        .one(&self.db)
        .await?;

        Ok(event.is_some())
    }

    async fn mark_event_processed(&self, provider: ProviderKind, event_id: &str) -> Result<()> {
        let event = processed_event::ActiveModel {
            provider: Set(provider.as_str().to_string()),
            event_id: Set(event_id.to_string()),
            processed_at: Set(Utc::now().fixed_offset()),
        };

        processed_event::Entity::insert(event)
            .on_conflict(
                OnConflict::columns([
                    processed_event::Column::Provider,
                    processed_event::Column::EventId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl UsageStore for SeaOrmBillingStore {
    async fn count(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let since = since.map(|s| s.fixed_offset());

        let count = match kind {
            ResourceKind::Patient => {
                let mut query = patient::Entity::find().filter(patient::Column::TenantId.eq(tenant_id));
                if let Some(since) = since {
                    query = query.filter(patient::Column::CreatedAt.gte(since));
                }
                query.count(&self.db).await?
            }
            ResourceKind::User => {
                let mut query = user::Entity::find().filter(user::Column::TenantId.eq(tenant_id));
                if let Some(since) = since {
                    query = query.filter(user::Column::CreatedAt.gte(since));
                }
                query.count(&self.db).await?
            }
            ResourceKind::Transaction => {
                let mut query =
                    transaction::Entity::find().filter(transaction::Column::TenantId.eq(tenant_id));
                if let Some(since) = since {
                    query = query.filter(transaction::Column::CreatedAt.gte(since));
                }
                query.count(&self.db).await?
            }
            ResourceKind::Appointment => {
                let mut query =
                    appointment::Entity::find().filter(appointment::Column::TenantId.eq(tenant_id));
                if let Some(since) = since {
                    query = query.filter(appointment::Column::StartTime.gte(since));
                }
                query.count(&self.db).await?
            }
        };

        Ok(u64_to_i64(count))
    }
}

#[async_trait]
impl TenantStore for SeaOrmBillingStore {
    async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        tracing::debug!(tenant_id = %tenant_id, "deleting tenant");

        let result = tenant::Entity::delete_by_id(tenant_id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(ClinifyError::not_found(format!("tenant {}", tenant_id)));
        }
        Ok(())
    }
}
