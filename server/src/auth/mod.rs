pub mod jwt;
pub mod middleware;

use crate::db::models::UserId;
use crate::error::CredentialError;

/// Maps an opaque credential to a stable user identity.
pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(&self, credential: &str) -> Result<UserId, CredentialError>;
}
