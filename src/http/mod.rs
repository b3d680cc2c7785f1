//! HTTP surface: route modules, handlers and request extractors.

pub mod billing;
pub mod routes;
pub mod validated;
pub mod webhooks;

pub use billing::BillingModule;
pub use routes::RouteModule;
pub use validated::ValidatedJson;
pub use webhooks::WebhookModule;
