use crate::app::AppState;
use axum::Router;

/// Trait for composable route modules
///
/// Each module registers its own routes and is merged into the service
/// router by [`crate::App::register_module`].
///
/// # Example
///
/// ```ignore
/// struct BillingModule;
///
/// impl RouteModule for BillingModule {
///     fn routes(&self) -> Router<AppState> {
///         Router::new().route("/subscription", get(get_subscription))
///     }
///
///     fn prefix(&self) -> Option<&str> {
///         Some("/api/billing")
///     }
/// }
/// ```
pub trait RouteModule {
    /// Returns a router with all routes for this module
    ///
    /// State is applied once by the App, so handlers take `State<AppState>`.
    fn routes(&self) -> Router<AppState>;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the application router
    fn register(self, router: Router<AppState>) -> Router<AppState>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}
