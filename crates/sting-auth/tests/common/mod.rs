#![allow(dead_code)]

//! Shared fixtures for the coordinator integration tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use sting_auth::config::AssuranceConfig;
use sting_auth::provider::{
    Challenge, IdentityProvider, PrimaryCredential, ProviderError, ReplayGuard, StepUpResponse,
    StepUpResult, VerifiedPrincipal,
};
use sting_auth::storage::{
    AssuranceStore, InMemoryAssuranceStore, InMemoryMarkerStorage, StoreError,
};
use sting_auth::types::{Session, SessionId, SessionState, StepUpMethod};
use sting_auth::{RouteGate, SessionCoordinator};

pub const ADA: &str = "ada@example.com";
pub const ADA_SECRET: &str = "correct horse battery staple";
pub const ADA_ID: &str = "user-ada";
pub const BOB: &str = "bob@example.com";
pub const BOB_SECRET: &str = "hunter2";
pub const BOB_ID: &str = "user-bob";
pub const GOOD_CODE: &str = "123456";

pub fn ada() -> PrimaryCredential {
    PrimaryCredential::new(ADA, ADA_SECRET)
}

pub fn bob() -> PrimaryCredential {
    PrimaryCredential::new(BOB, BOB_SECRET)
}

/// Configuration with short bridging delays so tests stay fast.
pub fn test_config() -> AssuranceConfig {
    let mut config = AssuranceConfig::default();
    config.bridge.retry_delay = Duration::from_millis(20);
    config.bridge.retry_after = Duration::from_millis(500);
    config.timeouts.store = Duration::from_millis(200);
    config.timeouts.provider = Duration::from_millis(500);
    config
}

struct Account {
    secret: String,
    principal_id: String,
    methods: BTreeSet<StepUpMethod>,
}

/// In-process identity provider with scripted accounts.
///
/// Ada has TOTP enrolled, Bob has nothing. Every challenge accepts
/// [`GOOD_CODE`] and is gone after its first completion.
pub struct ScriptedProvider {
    accounts: Mutex<HashMap<String, Account>>,
    challenges: Mutex<HashMap<String, StepUpMethod>>,
    issued: AtomicUsize,
    pub begin_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub unavailable: AtomicBool,
    complete_delay: Mutex<Duration>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(
            ADA.to_string(),
            Account {
                secret: ADA_SECRET.to_string(),
                principal_id: ADA_ID.to_string(),
                methods: BTreeSet::from([StepUpMethod::Totp]),
            },
        );
        accounts.insert(
            BOB.to_string(),
            Account {
                secret: BOB_SECRET.to_string(),
                principal_id: BOB_ID.to_string(),
                methods: BTreeSet::new(),
            },
        );
        Self {
            accounts: Mutex::new(accounts),
            challenges: Mutex::new(HashMap::new()),
            issued: AtomicUsize::new(0),
            begin_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            complete_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl ScriptedProvider {
    /// Enrolls `method` for the principal behind `identifier`.
    pub fn enroll(&self, identifier: &str, method: StepUpMethod) {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(identifier) {
            account.methods.insert(method);
        }
    }

    /// Makes every call fail as unavailable until reset.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Slows down completions to widen race windows.
    pub fn set_complete_delay(&self, delay: Duration) {
        *self.complete_delay.lock().unwrap() = delay;
    }

    fn check_up(&self) -> Result<(), ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::unavailable("scripted outage"));
        }
        Ok(())
    }

    fn methods_of(&self, principal_id: &str) -> Option<BTreeSet<StepUpMethod>> {
        self.accounts
            .lock()
            .unwrap()
            .values()
            .find(|a| a.principal_id == principal_id)
            .map(|a| a.methods.clone())
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn verify_primary(
        &self,
        credential: &PrimaryCredential,
    ) -> Result<VerifiedPrincipal, ProviderError> {
        self.check_up()?;
        let accounts = self.accounts.lock().unwrap();
        match accounts.get(&credential.identifier) {
            Some(account) if account.secret == credential.secret() => Ok(VerifiedPrincipal {
                principal_id: account.principal_id.clone(),
                principal_hint: Some(credential.identifier.clone()),
                enrolled_methods: account.methods.clone(),
            }),
            _ => Err(ProviderError::rejected("invalid credentials")),
        }
    }

    async fn enrolled_methods(
        &self,
        principal_id: &str,
    ) -> Result<BTreeSet<StepUpMethod>, ProviderError> {
        self.check_up()?;
        Ok(self.methods_of(principal_id).unwrap_or_default())
    }

    async fn begin_step_up(
        &self,
        principal_id: &str,
        method: StepUpMethod,
    ) -> Result<Challenge, ProviderError> {
        self.check_up()?;
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        let enrolled = self.methods_of(principal_id).unwrap_or_default();
        if !enrolled.contains(&method) {
            return Err(ProviderError::UnsupportedMethod { method });
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let challenge_id = format!("ch-{n}");
        self.challenges
            .lock()
            .unwrap()
            .insert(challenge_id.clone(), method);
        Ok(Challenge {
            challenge_id,
            method,
            expires_at: OffsetDateTime::now_utc() + Duration::from_secs(600),
        })
    }

    async fn complete_step_up(
        &self,
        challenge_id: &str,
        response: &StepUpResponse,
    ) -> Result<StepUpResult, ProviderError> {
        self.check_up()?;
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.complete_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // A challenge can be completed once.
        let method = self
            .challenges
            .lock()
            .unwrap()
            .remove(challenge_id)
            .ok_or_else(|| ProviderError::rejected("unknown challenge"))?;
        Ok(StepUpResult {
            verified: response.as_str() == GOOD_CODE,
            method,
        })
    }
}

/// Store whose reads lag behind its writes, like a lagging replica.
///
/// While `hidden_reads` is positive, each `get` returns `None` and
/// decrements it.
#[derive(Default)]
pub struct LaggingStore {
    pub inner: InMemoryAssuranceStore,
    hidden_reads: AtomicUsize,
}

impl LaggingStore {
    pub fn hide_next_reads(&self, n: usize) {
        self.hidden_reads.store(n, Ordering::SeqCst);
    }

    /// Reads straight from the backing store.
    pub async fn peek(&self, id: &SessionId) -> Option<Session> {
        self.inner.get(id).await.unwrap()
    }
}

#[async_trait]
impl AssuranceStore for LaggingStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let hidden = self
            .hidden_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        self.inner.get(id).await
    }

    async fn put(
        &self,
        session: &Session,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.inner.put(session, expected_version).await
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn revoke(&self, id: &SessionId) -> Result<(), StoreError> {
        self.inner.revoke(id).await
    }

    async fn lapsed(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        self.inner.lapsed(id).await
    }

    async fn cleanup_expired(&self) -> Result<u64, StoreError> {
        self.inner.cleanup_expired().await
    }
}

/// Coordinator, gate and their collaborators wired together.
pub struct Harness {
    pub store: Arc<LaggingStore>,
    pub markers: Arc<InMemoryMarkerStorage>,
    pub provider: Arc<ReplayGuard<ScriptedProvider>>,
    pub coordinator: Arc<SessionCoordinator>,
    pub gate: RouteGate,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AssuranceConfig) -> Self {
        Self::with_replay_retention(config, Duration::from_secs(600))
    }

    pub fn with_replay_retention(config: AssuranceConfig, retention: Duration) -> Self {
        let store = Arc::new(LaggingStore::default());
        let markers = Arc::new(InMemoryMarkerStorage::new());
        let provider = Arc::new(ReplayGuard::new(ScriptedProvider::default(), retention));
        let coordinator = Arc::new(
            SessionCoordinator::new(config, store.clone(), provider.clone(), markers.clone())
                .unwrap(),
        );
        let gate = RouteGate::new(coordinator.clone());
        Self {
            store,
            markers,
            provider,
            coordinator,
            gate,
        }
    }

    pub fn scripted(&self) -> &ScriptedProvider {
        self.provider.inner()
    }

    /// Signs Ada in and returns her session id.
    pub async fn sign_in_ada(&self) -> SessionId {
        self.coordinator
            .verify_primary(&ada(), None)
            .await
            .unwrap()
            .session
            .id
    }

    /// Signs Ada in and completes a TOTP step-up.
    pub async fn elevate_ada(&self) -> SessionId {
        let id = self.sign_in_ada().await;
        let challenge_id = self.begin_totp(&id).await;
        self.coordinator
            .complete_step_up(&id, &challenge_id, &StepUpResponse::new(GOOD_CODE))
            .await
            .unwrap();
        id
    }

    /// Starts a TOTP step-up and returns the challenge id.
    pub async fn begin_totp(&self, id: &SessionId) -> String {
        match self
            .coordinator
            .begin_step_up(id, StepUpMethod::Totp)
            .await
            .unwrap()
        {
            sting_auth::StepUpStart::Challenge(pending) => pending.challenge_id,
            other => panic!("expected a challenge, got {other:?}"),
        }
    }
}
