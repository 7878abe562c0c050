use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::credential::{AccessToken, Credential, RefreshLock, CREDENTIAL_KEY, REFRESH_LOCK_KEY};
use super::provider::TokenProvider;
use super::AuthError;
use crate::storage::{after, read_json, write_json, PutCondition, SharedStore, StorageError};

/// Settings for [`CredentialCache`].
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Refresh this long before the token actually expires.
    pub safety_margin: Duration,
    /// How long the last token is served after refresh starts failing.
    pub grace_period: Duration,
    /// Bound on one provider call, and on how long callers wait for a flight.
    pub refresh_timeout: Duration,
    /// Minimum spacing between failed refresh attempts.
    pub retry_interval: Duration,
    /// Lifetime assumed when the provider does not report one.
    pub default_lifetime: Duration,
    /// Interval at which a process waiting on another's refresh rereads the store.
    pub poll_interval: Duration,
    /// Used when neither the cache nor the store holds a refresh token.
    pub bootstrap_refresh_token: Option<String>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(300),
            grace_period: Duration::from_secs(600),
            refresh_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
            default_lifetime: Duration::from_secs(7200),
            poll_interval: Duration::from_millis(250),
            bootstrap_refresh_token: None,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    credential: Option<Credential>,
    /// Bumped on every finished refresh flight, successful or not.
    generation: u64,
    last_failure: Option<AuthError>,
    last_attempt_at: Option<DateTime<Utc>>,
    degraded_since: Option<DateTime<Utc>>,
    /// Access token the CRM rejected; never served again.
    rejected: Option<String>,
}

impl CacheState {
    fn fresh_token(&self, now: DateTime<Utc>, margin: Duration) -> Option<AccessToken> {
        self.credential
            .as_ref()
            .filter(|c| c.is_fresh_at(now, margin))
            .filter(|c| self.rejected.as_deref() != Some(c.access_token.as_str()))
            .map(Credential::access)
    }

    fn backing_off(&self, now: DateTime<Utc>, retry_interval: Duration) -> bool {
        self.last_failure.is_some()
            && self
                .last_attempt_at
                .is_some_and(|at| now < after(at, retry_interval))
    }

    /// Answer for callers while refresh is failing.
    fn degraded(&self, now: DateTime<Utc>, grace: Duration) -> Result<AccessToken, AuthError> {
        if let Some(since) = self.degraded_since {
            if now >= after(since, grace) {
                return Err(AuthError::GraceExpired { since });
            }
        }
        let usable = self
            .credential
            .as_ref()
            .filter(|c| self.rejected.as_deref() != Some(c.access_token.as_str()));
        match (usable, &self.last_failure) {
            (Some(credential), Some(_)) => Ok(credential.access()),
            (_, Some(failure)) => Err(failure.clone()),
            (_, None) => Err(AuthError::RefreshFailed {
                message: "no credential available".to_string(),
            }),
        }
    }

    fn adopt(&mut self, credential: Credential) -> AccessToken {
        let token = credential.access();
        self.credential = Some(credential);
        self.generation += 1;
        self.last_failure = None;
        self.degraded_since = None;
        token
    }
}

/// Single-flight cache for the shared CRM credential.
///
/// `get_token` answers from memory while the token is fresh. When it is not,
/// one caller per process runs a refresh flight while the others wait on the
/// flight lock and then read its outcome. Across processes, only the holder of
/// the `credentials/refresh.lock` object calls the identity provider; every
/// other process polls `credentials/current.json` until the holder's
/// credential appears, `refresh_timeout` runs out, or the lock disappears.
#[derive(Debug)]
pub struct CredentialCache {
    store: SharedStore,
    provider: Arc<dyn TokenProvider>,
    config: CredentialConfig,
    state: RwLock<CacheState>,
    flight: Mutex<()>,
    /// Identifies this cache in the refresh lock.
    holder: String,
}

impl CredentialCache {
    #[must_use]
    pub fn new(
        store: SharedStore,
        provider: Arc<dyn TokenProvider>,
        config: CredentialConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            state: RwLock::new(CacheState::default()),
            flight: Mutex::new(()),
            holder: Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Returns a currently valid access token.
    ///
    /// While refresh is failing, the last token is served until the grace
    /// period runs out; callers that share one failed flight all receive the
    /// same error.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::GraceExpired` or `AuthError::NotAuthorized` when the
    /// worker cannot make progress, and `RefreshFailed`/`RefreshTimeout` when
    /// no usable token exists yet.
    pub async fn get_token(&self) -> Result<AccessToken, AuthError> {
        let now = self.store.now().await?;
        let seen = {
            let state = self.state.read().await;
            if let Some(token) = state.fresh_token(now, self.config.safety_margin) {
                return Ok(token);
            }
            state.generation
        };

        let wait = self.config.refresh_timeout.saturating_mul(2);
        let Ok(_flight) = tokio::time::timeout(wait, self.flight.lock()).await else {
            let state = self.state.read().await;
            return state
                .degraded(now, self.config.grace_period)
                .or(Err(AuthError::RefreshTimeout { waited: wait }));
        };

        let now = self.store.now().await?;
        {
            let state = self.state.read().await;
            if state.generation != seen {
                if let Some(token) = state.fresh_token(now, self.config.safety_margin) {
                    return Ok(token);
                }
                return state.degraded(now, self.config.grace_period);
            }
            if state.backing_off(now, self.config.retry_interval) {
                return state.degraded(now, self.config.grace_period);
            }
        }

        self.run_flight(now).await
    }

    /// Marks `token` as rejected by the CRM so the next call refreshes.
    pub async fn invalidate(&self, token: &AccessToken) {
        let mut state = self.state.write().await;
        if state
            .credential
            .as_ref()
            .is_some_and(|c| c.access_token == token.token)
        {
            state.rejected = Some(token.token.clone());
            tracing::info!("Access token rejected by CRM; next call refreshes");
        }
    }

    /// The error from the most recent failed flight, if refresh is failing.
    pub async fn last_failure(&self) -> Option<AuthError> {
        self.state.read().await.last_failure.clone()
    }

    async fn run_flight(&self, now: DateTime<Utc>) -> Result<AccessToken, AuthError> {
        let rejected = self.state.read().await.rejected.clone();
        let persisted = read_json::<Credential>(&*self.store, CREDENTIAL_KEY).await?;
        if let Some(credential) = self.usable(persisted.as_ref(), now, rejected.as_deref()) {
            tracing::debug!(expires_at = %credential.expires_at, "Adopted credential from store");
            return Ok(self.state.write().await.adopt(credential));
        }

        let refresh_token = {
            let state = self.state.read().await;
            state
                .credential
                .as_ref()
                .and_then(|c| c.refresh_token.clone())
                .or_else(|| persisted.as_ref().and_then(|(c, _)| c.refresh_token.clone()))
                .or_else(|| self.config.bootstrap_refresh_token.clone())
        };
        let Some(refresh_token) = refresh_token else {
            let err = AuthError::NotAuthorized {
                message: "no refresh token configured".to_string(),
            };
            return self.record_failure(now, err).await;
        };

        if !self.acquire_refresh_lock(now).await? {
            return self.await_peer_refresh(rejected.as_deref()).await;
        }

        // A peer may have finished between the first read and taking the lock.
        let persisted = match read_json::<Credential>(&*self.store, CREDENTIAL_KEY).await {
            Ok(persisted) => persisted,
            Err(e) => {
                self.release_refresh_lock().await;
                return Err(e.into());
            }
        };
        if let Some(credential) = self.usable(persisted.as_ref(), now, rejected.as_deref()) {
            self.release_refresh_lock().await;
            return Ok(self.state.write().await.adopt(credential));
        }

        counter!("crmq.auth.refresh").increment(1);
        let refresh = self.provider.refresh(&refresh_token);
        let outcome = tokio::time::timeout(self.config.refresh_timeout, refresh)
            .await
            .unwrap_or(Err(AuthError::RefreshTimeout {
                waited: self.config.refresh_timeout,
            }));

        let answer = match outcome {
            Ok(grant) => {
                let credential = Credential::from_grant(
                    grant,
                    now,
                    Some(refresh_token),
                    self.config.default_lifetime,
                );
                let condition = persisted
                    .map_or(PutCondition::IfNoneMatch, |(_, etag)| PutCondition::IfMatch(etag));
                let credential = self.persist(credential, condition, now).await;
                tracing::info!(expires_at = %credential.expires_at, "Refreshed CRM credential");
                Ok(self.state.write().await.adopt(credential))
            }
            Err(err) => self.record_failure(now, err).await,
        };
        self.release_refresh_lock().await;
        answer
    }

    /// A stored credential that is fresh and not the one the CRM rejected.
    fn usable(
        &self,
        persisted: Option<&(Credential, String)>,
        now: DateTime<Utc>,
        rejected: Option<&str>,
    ) -> Option<Credential> {
        persisted
            .map(|(credential, _)| credential)
            .filter(|c| c.is_fresh_at(now, self.config.safety_margin))
            .filter(|c| rejected != Some(c.access_token.as_str()))
            .cloned()
    }

    /// Takes the cross-process refresh lock. Returns `false` if a live lock
    /// belongs to someone else or another process took it first.
    async fn acquire_refresh_lock(&self, now: DateTime<Utc>) -> Result<bool, AuthError> {
        let condition = match read_json::<RefreshLock>(&*self.store, REFRESH_LOCK_KEY).await? {
            None => PutCondition::IfNoneMatch,
            Some((held, _)) if held.is_live_at(now) && held.holder != self.holder => {
                tracing::debug!(holder = %held.holder, "Credential refresh running in another process");
                return Ok(false);
            }
            Some((_, etag)) => PutCondition::IfMatch(etag),
        };

        let lock = RefreshLock {
            holder: self.holder.clone(),
            acquired_at: now,
            expires_at: after(now, self.config.refresh_timeout.saturating_mul(2)),
        };
        match write_json(&*self.store, REFRESH_LOCK_KEY, &lock, condition).await {
            Ok(_) => Ok(true),
            Err(StorageError::PreconditionFailed { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_refresh_lock(&self) {
        match read_json::<RefreshLock>(&*self.store, REFRESH_LOCK_KEY).await {
            Ok(Some((lock, _))) if lock.holder == self.holder => {
                if let Err(e) = self.store.delete_object(REFRESH_LOCK_KEY).await {
                    tracing::warn!(error = %e, "Failed to release credential refresh lock");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read credential refresh lock"),
        }
    }

    /// Waits for the lock holder to store a new credential.
    async fn await_peer_refresh(&self, rejected: Option<&str>) -> Result<AccessToken, AuthError> {
        let waited = self.config.refresh_timeout;
        let outcome = tokio::time::timeout(waited, self.poll_for_credential(rejected)).await;
        let now = self.store.now().await?;
        match outcome {
            Ok(Ok(Some(credential))) => {
                counter!("crmq.auth.adopted").increment(1);
                tracing::debug!(expires_at = %credential.expires_at, "Adopted credential refreshed by another process");
                Ok(self.state.write().await.adopt(credential))
            }
            Ok(Ok(None)) => {
                let err = AuthError::RefreshFailed {
                    message: "refresh in another process produced no credential".to_string(),
                };
                self.record_failure(now, err).await
            }
            Ok(Err(err)) => Err(err),
            Err(_) => self.record_failure(now, AuthError::RefreshTimeout { waited }).await,
        }
    }

    async fn record_failure(
        &self,
        now: DateTime<Utc>,
        err: AuthError,
    ) -> Result<AccessToken, AuthError> {
        counter!("crmq.auth.refresh_failed").increment(1);
        let mut state = self.state.write().await;
        state.generation += 1;
        state.last_attempt_at = Some(now);
        state.last_failure = Some(err.clone());
        let since = *state.degraded_since.get_or_insert(now);
        tracing::warn!(error = %err, degraded_since = %since, "Credential refresh failed");
        state.degraded(now, self.config.grace_period)
    }

    /// Returns the peer's credential once stored, or `None` if its lock is gone without one.
    async fn poll_for_credential(
        &self,
        rejected: Option<&str>,
    ) -> Result<Option<Credential>, AuthError> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let now = self.store.now().await?;
            let persisted = read_json::<Credential>(&*self.store, CREDENTIAL_KEY).await?;
            if let Some(credential) = self.usable(persisted.as_ref(), now, rejected) {
                return Ok(Some(credential));
            }
            let lock = read_json::<RefreshLock>(&*self.store, REFRESH_LOCK_KEY).await?;
            if !lock.is_some_and(|(lock, _)| lock.is_live_at(now)) {
                return Ok(None);
            }
        }
    }

    /// Stores `credential`. If another process stored one first, theirs wins
    /// so every process serves the same token.
    async fn persist(
        &self,
        credential: Credential,
        condition: PutCondition,
        now: DateTime<Utc>,
    ) -> Credential {
        match write_json(&*self.store, CREDENTIAL_KEY, &credential, condition).await {
            Ok(_) => credential,
            Err(StorageError::PreconditionFailed { .. }) => {
                match read_json::<Credential>(&*self.store, CREDENTIAL_KEY).await {
                    Ok(stored) => match self.usable(stored.as_ref(), now, None) {
                        Some(stored) => {
                            tracing::debug!("Another process stored a credential first; adopting it");
                            stored
                        }
                        None => credential,
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to reread stored credential");
                        credential
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store refreshed credential");
                credential
            }
        }
    }
}
