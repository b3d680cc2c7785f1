pub mod extractors;
pub mod jwt;
pub mod token;

pub use extractors::{AuthTenant, TenantClaims, TenantVerifier};
pub use jwt::JwtVerifier;
pub use token::TokenExtractor;
