//! Shared CRM credential with single-flight refresh.

mod cache;
mod credential;
mod error;
mod provider;

pub use cache::{CredentialCache, CredentialConfig};
pub use credential::{
    AccessToken, Credential, RefreshLock, TokenGrant, CREDENTIAL_KEY, REFRESH_LOCK_KEY,
};
pub use error::AuthError;
pub use provider::{OAuthTokenProvider, TokenProvider};
