/// Get environment variable with CLINIFY_ prefix, falling back to unprefixed version
///
/// Checks `CLINIFY_{key}` first, then `{key}`, so platform-provided names such
/// as `PORT` or `DATABASE_URL` work without renaming.
///
/// # Examples
///
/// ```rust
/// use clinify_billing::utils::get_env_with_prefix;
///
/// // Checks CLINIFY_PORT first, then PORT
/// let port = get_env_with_prefix("PORT");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("CLINIFY_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
        .filter(|value| !value.trim().is_empty())
}
