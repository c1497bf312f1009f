//! Clients for the remote user service.
//!
//! [`HttpUserService`] talks to the identity deployment over HTTP;
//! [`FakeUserService`] is an in-memory double shared by the test suites of
//! the crates that consume the [`UserService`] trait.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use training_results_core::{
    StatsUpdate, TeamMembership, TrainingError, UserProfile, UserService,
};

/// HTTP implementation backed by the identity service's REST API.
pub struct HttpUserService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    data: UserProfile,
}

#[derive(Debug, Deserialize)]
struct TeamsEnvelope {
    #[serde(default)]
    teams: Vec<TeamMembership>,
}

impl HttpUserService {
    /// Builds a client with a hard per-request timeout. A hung identity
    /// service must stall one request, not the whole worker.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TrainingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                TrainingError::Server(format!("failed to build user-service client: {err}"))
            })?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn transport_error(context: &str, err: &reqwest::Error) -> TrainingError {
    tracing::warn!(error = %err, "{context}");
    TrainingError::Delegate(format!("{context}: {err}"))
}

fn status_error(context: &str, status: reqwest::StatusCode) -> TrainingError {
    tracing::warn!(%status, "{context}");
    TrainingError::Delegate(format!("{context}: unexpected status {status}"))
}

#[async_trait]
impl UserService for HttpUserService {
    async fn get_user(&self, user_id: i64, token: &str) -> Result<UserProfile, TrainingError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/api/users/{user_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| transport_error("user lookup failed", &err))?;

        if !response.status().is_success() {
            return Err(status_error("user lookup failed", response.status()));
        }

        let envelope: UserEnvelope = response
            .json()
            .await
            .map_err(|err| transport_error("user lookup returned malformed JSON", &err))?;
        Ok(envelope.data)
    }

    async fn check_team_access(
        &self,
        user_id: i64,
        team_id: i64,
        token: &str,
    ) -> Result<bool, TrainingError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/api/users/{user_id}/teams")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| transport_error("team membership check failed", &err))?;

        if !response.status().is_success() {
            return Err(status_error(
                "team membership check failed",
                response.status(),
            ));
        }

        let envelope: TeamsEnvelope = response
            .json()
            .await
            .map_err(|err| transport_error("team listing returned malformed JSON", &err))?;
        Ok(envelope.teams.iter().any(|team| team.id == team_id))
    }

    async fn update_user_stats(
        &self,
        user_id: i64,
        update: &StatsUpdate,
        token: &str,
    ) -> Result<(), TrainingError> {
        let response = self
            .client
            .post(self.endpoint(&format!("/api/users/{user_id}/stats")))
            .bearer_auth(token)
            .json(update)
            .send()
            .await
            .map_err(|err| transport_error("stats push failed", &err))?;

        if !response.status().is_success() {
            return Err(status_error("stats push failed", response.status()));
        }

        Ok(())
    }
}

/// In-memory stand-in for the identity service. Membership and profiles are
/// seeded up front; `fail` flips every call into a delegate failure.
#[derive(Default)]
pub struct FakeUserService {
    profiles: Mutex<HashMap<i64, UserProfile>>,
    memberships: Mutex<HashSet<(i64, i64)>>,
    pushes: Mutex<Vec<(i64, StatsUpdate)>>,
    fail: AtomicBool,
}

impl FakeUserService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_profile(&self, profile: UserProfile) {
        lock(&self.profiles).insert(profile.id, profile);
    }

    pub fn grant_membership(&self, user_id: i64, team_id: i64) {
        lock(&self.memberships).insert((user_id, team_id));
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Stats pushes received so far, in arrival order.
    #[must_use]
    pub fn pushes(&self) -> Vec<(i64, StatsUpdate)> {
        lock(&self.pushes).clone()
    }

    fn check_failing(&self) -> Result<(), TrainingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TrainingError::Delegate(
                "user service unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl UserService for FakeUserService {
    async fn get_user(&self, user_id: i64, _token: &str) -> Result<UserProfile, TrainingError> {
        self.check_failing()?;
        lock(&self.profiles)
            .get(&user_id)
            .cloned()
            .ok_or_else(|| TrainingError::Delegate(format!("user {user_id} not found")))
    }

    async fn check_team_access(
        &self,
        user_id: i64,
        team_id: i64,
        _token: &str,
    ) -> Result<bool, TrainingError> {
        self.check_failing()?;
        Ok(lock(&self.memberships).contains(&(user_id, team_id)))
    }

    async fn update_user_stats(
        &self,
        user_id: i64,
        update: &StatsUpdate,
        _token: &str,
    ) -> Result<(), TrainingError> {
        self.check_failing()?;
        lock(&self.pushes).push((user_id, update.clone()));
        Ok(())
    }
}
