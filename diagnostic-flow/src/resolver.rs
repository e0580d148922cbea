//! Bridges "the caller wants to stream" and "the session id has not arrived yet".
//!
//! The resolver polls an accessor on a fixed interval and reports the first id it
//! sees. Running out of attempts is not an error: the session simply carries on
//! without live reasoning updates.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// How a resolution attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The id became available on poll number `attempt`
    Resolved { session_id: String, attempt: u32 },
    /// No id after `attempts` polls
    TimedOut { attempts: u32 },
    /// The caller did not ask to connect
    NotRequested,
    /// Polling was cancelled before it finished
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct SessionIdResolver {
    config: ResolverConfig,
}

impl SessionIdResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Poll `current` every `poll_interval` until it yields an id or
    /// `max_attempts` polls have passed. The first poll happens one interval
    /// after the call.
    ///
    /// Dropping the returned future stops polling.
    pub async fn resolve<F>(&self, should_connect: bool, mut current: F) -> ResolveOutcome
    where
        F: FnMut() -> Option<String>,
    {
        if !should_connect {
            return ResolveOutcome::NotRequested;
        }

        for attempt in 1..=self.config.max_attempts {
            tokio::time::sleep(self.config.poll_interval).await;

            if let Some(session_id) = current() {
                info!(session_id = %session_id, attempt, "Session id resolved");
                return ResolveOutcome::Resolved {
                    session_id,
                    attempt,
                };
            }
            debug!(attempt, "Session id not yet available");
        }

        warn!(
            attempts = self.config.max_attempts,
            "Max attempts reached waiting for session id, continuing without streaming"
        );
        ResolveOutcome::TimedOut {
            attempts: self.config.max_attempts,
        }
    }

    /// Run [`resolve`](Self::resolve) on its own task.
    ///
    /// The poll timer lives exactly as long as the returned handle: cancelling
    /// or dropping the handle aborts it.
    pub fn spawn<F>(&self, should_connect: bool, current: F) -> ResolverHandle
    where
        F: FnMut() -> Option<String> + Send + 'static,
    {
        let resolver = self.clone();
        let task = tokio::spawn(async move { resolver.resolve(should_connect, current).await });
        ResolverHandle { task: Some(task) }
    }
}

/// Owning handle to a spawned resolution
#[derive(Debug)]
pub struct ResolverHandle {
    task: Option<JoinHandle<ResolveOutcome>>,
}

impl ResolverHandle {
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Session id resolution cancelled");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Wait for the resolution to end
    pub async fn outcome(mut self) -> ResolveOutcome {
        match self.task.take() {
            Some(task) => task.await.unwrap_or(ResolveOutcome::Cancelled),
            None => ResolveOutcome::Cancelled,
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
