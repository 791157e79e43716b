//! Job registry: job type name → handler and execution policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::job::handler::JobHandler;

/// Retry, timeout and priority policy for a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Total attempts before the job is dead (including the first).
    pub max_attempts: u32,
    /// Wall-clock limit for one attempt.
    pub timeout: Duration,
    /// How long a lease lasts without a heartbeat.
    pub visibility_timeout: Duration,
    pub default_priority: i32,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(60),
            default_priority: 0,
        }
    }
}

impl JobPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }
}

/// A registered job type.
#[derive(Clone)]
pub struct RegisteredJob {
    pub handler: Arc<dyn JobHandler>,
    pub policy: JobPolicy,
}

/// Registry of job handlers.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, RegisteredJob>>,
    /// Policy applied by `register_default`.
    defaults: JobPolicy,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_defaults(JobPolicy::default())
    }

    pub fn with_defaults(defaults: JobPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    pub fn defaults(&self) -> &JobPolicy {
        &self.defaults
    }

    /// Register a handler. Replaces (and warns about) an existing registration.
    pub async fn register(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        policy: JobPolicy,
    ) {
        let job_type = job_type.into();
        let previous = self
            .jobs
            .write()
            .await
            .insert(job_type.clone(), RegisteredJob { handler, policy });
        if previous.is_some() {
            tracing::warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            tracing::debug!("Registered job type: {}", job_type);
        }
    }

    /// Register a handler with the registry's default policy.
    pub async fn register_default(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let policy = self.defaults.clone();
        self.register(job_type, handler, policy).await;
    }

    /// Register a handler (sync version for startup).
    pub fn register_sync(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        policy: JobPolicy,
    ) {
        let job_type = job_type.into();
        if let Ok(mut jobs) = self.jobs.try_write() {
            jobs.insert(job_type.clone(), RegisteredJob { handler, policy });
            tracing::debug!("Registered job type: {}", job_type);
        } else {
            tracing::warn!(job_type = %job_type, "Registry busy, job type not registered");
        }
    }

    /// Unregister a job type.
    pub async fn unregister(&self, job_type: &str) -> Option<RegisteredJob> {
        self.jobs.write().await.remove(job_type)
    }

    /// Get a job type's handler and policy.
    pub async fn get(&self, job_type: &str) -> Option<RegisteredJob> {
        self.jobs.read().await.get(job_type).cloned()
    }

    /// Policy for a job type, or the registry defaults if it is not registered.
    pub async fn policy_for(&self, job_type: &str) -> JobPolicy {
        self.jobs
            .read()
            .await
            .get(job_type)
            .map(|r| r.policy.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Check if a job type is registered.
    pub async fn has(&self, job_type: &str) -> bool {
        self.jobs.read().await.contains_key(job_type)
    }

    /// List all registered job types, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered job types.
    pub fn count(&self) -> usize {
        self.jobs.try_read().map(|j| j.len()).unwrap_or(0)
    }
}
