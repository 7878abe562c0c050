use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::after;

/// Storage key of the shared credential.
pub const CREDENTIAL_KEY: &str = "credentials/current.json";

/// Storage key of the cross-process refresh lock.
pub const REFRESH_LOCK_KEY: &str = "credentials/refresh.lock";

/// Marks one process as the only one calling the identity provider.
///
/// Created with `If-None-Match`; an expired lock may be taken over with `If-Match`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshLock {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshLock {
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// The shared CRM credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Base URL of the CRM instance the token is valid for.
    pub instance_url: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Builds a credential from a provider grant.
    ///
    /// Providers that do not rotate refresh tokens omit them; the previous one is kept.
    #[must_use]
    pub fn from_grant(
        grant: TokenGrant,
        issued_at: DateTime<Utc>,
        previous_refresh_token: Option<String>,
        default_lifetime: Duration,
    ) -> Self {
        let lifetime = grant.expires_in.unwrap_or(default_lifetime);
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh_token),
            instance_url: grant.instance_url,
            token_type: grant.token_type,
            issued_at,
            expires_at: after(issued_at, lifetime),
        }
    }

    /// True if the token is usable at `now` with `margin` to spare.
    #[must_use]
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        after(now, margin) < self.expires_at
    }

    #[must_use]
    pub fn access(&self) -> AccessToken {
        AccessToken {
            token: self.access_token.clone(),
            instance_url: self.instance_url.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("instance_url", &self.instance_url)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// What a worker needs to call the CRM.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub instance_url: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A successful response from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the provider rotates refresh tokens.
    pub refresh_token: Option<String>,
    pub instance_url: String,
    pub token_type: String,
    /// Lifetime, when the provider reports one.
    pub expires_in: Option<Duration>,
}
