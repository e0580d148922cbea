//! Live reasoning stream for one diagnostic session.
//!
//! A [`ReasoningStreamClient`] owns at most one [`StreamConnection`]. The
//! connection runs two tasks: a supervisor that opens the transport, parses
//! events and reconnects with capped exponential backoff, and a pump that
//! drains parsed updates into the shared [`StepFeed`] one scheduler tick after
//! they were produced. Dropping the connection aborts both.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::Result;
use crate::resolver::{ResolveOutcome, SessionIdResolver};
use crate::step_log::{ReasoningStep, StepIdGenerator, StepLog, StepPayload};

/// Raw `data` payloads of one open stream
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens the server-push channel of a session
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, session_id: &str) -> Result<EventStream>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Why a connection stopped on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The backend sent `complete`
    Completed,
    /// Gave up after `attempts` consecutive failed connections
    Exhausted { attempts: u32 },
    /// No session id became available to connect to
    Unresolved,
    /// The supervisor was torn down before finishing
    Closed,
}

/// Shared, observable [`StepLog`] of the current session.
///
/// Readers subscribe to snapshots. Every [`reset`](Self::reset) starts a new
/// epoch; updates produced for an older epoch are discarded on arrival.
#[derive(Debug, Clone)]
pub struct StepFeed {
    tx: Arc<watch::Sender<StepLog>>,
    epoch: Arc<AtomicU64>,
    ids: Arc<StepIdGenerator>,
}

impl Default for StepFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl StepFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StepLog::new());
        Self {
            tx: Arc::new(tx),
            epoch: Arc::new(AtomicU64::new(0)),
            ids: Arc::new(StepIdGenerator::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StepLog> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> StepLog {
        self.tx.borrow().clone()
    }

    /// Fallback id source for steps arriving without one
    pub fn ids(&self) -> &StepIdGenerator {
        &self.ids
    }

    /// Append steps directly, in order
    pub fn append_all(&self, steps: impl IntoIterator<Item = ReasoningStep>) {
        let mut steps = steps.into_iter().peekable();
        if steps.peek().is_none() {
            return;
        }
        self.tx
            .send_modify(|log| *log = steps.fold(log.clone(), |log, step| log.append(step)));
    }

    /// Drop every step and invalidate updates still in flight
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(StepLog::new());
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn apply(&self, epoch: u64, updates: Vec<LogUpdate>) -> bool {
        self.tx.send_if_modified(|log| {
            if self.epoch() != epoch {
                return false;
            }
            *log = updates
                .into_iter()
                .fold(log.clone(), |log, update| update.apply_to(&log));
            true
        })
    }
}

/// A normalized change to the step log, queued for the pump
#[derive(Debug)]
enum LogUpdate {
    Append(ReasoningStep),
    SetInProgress(Option<ReasoningStep>),
}

impl LogUpdate {
    fn apply_to(self, log: &StepLog) -> StepLog {
        match self {
            LogUpdate::Append(step) => log.append(step),
            LogUpdate::SetInProgress(step) => log.with_in_progress(step),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    Connected {},
    Step(StepPayload),
    CurrentStep {
        #[serde(default)]
        step: Option<Value>,
    },
    Complete {},
}

enum Flow {
    Continue,
    Complete,
}

/// Everything a supervisor task needs, moved into it at spawn time
struct Supervisor {
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    feed: StepFeed,
    state: Arc<watch::Sender<ConnectionState>>,
    session: watch::Sender<Option<String>>,
    updates: mpsc::UnboundedSender<LogUpdate>,
}

impl Supervisor {
    async fn run(self, session_id: String) -> StreamOutcome {
        self.session.send_replace(Some(session_id.clone()));
        let mut failures: u32 = 0;

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            match self.transport.open(&session_id).await {
                Ok(mut events) => {
                    self.state.send_replace(ConnectionState::Connected);
                    failures = 0;
                    info!(session_id = %session_id, "Connected to reasoning stream");

                    while let Some(event) = events.next().await {
                        match event {
                            Ok(data) => {
                                if let Flow::Complete = self.handle(&session_id, &data) {
                                    self.state.send_replace(ConnectionState::Disconnected);
                                    info!(session_id = %session_id, "Reasoning stream complete");
                                    return StreamOutcome::Completed;
                                }
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, "Reasoning stream failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, "Could not open reasoning stream: {}", e);
                }
            }

            self.state.send_replace(ConnectionState::Disconnected);
            failures += 1;
            if failures >= self.policy.max_attempts {
                warn!(
                    session_id = %session_id,
                    attempts = failures,
                    "Giving up on reasoning stream, keeping collected steps"
                );
                return StreamOutcome::Exhausted { attempts: failures };
            }

            let delay = self.policy.delay_for(failures);
            warn!(
                session_id = %session_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reasoning stream reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn handle(&self, session_id: &str, data: &str) -> Flow {
        let message = match serde_json::from_str::<StreamMessage>(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session_id, "Dropping malformed reasoning event: {}", e);
                return Flow::Continue;
            }
        };

        match message {
            StreamMessage::Connected {} => {
                debug!(session_id = %session_id, "Stream connection confirmed");
            }
            StreamMessage::Step(payload) => {
                let step = ReasoningStep::from_payload(payload, self.feed.ids());
                debug!(step_id = %step.id, agent = %step.agent, status = ?step.status, "Reasoning step");
                self.push(LogUpdate::Append(step));
            }
            StreamMessage::CurrentStep { step } => {
                let step = step.and_then(|raw| ReasoningStep::from_value(raw, self.feed.ids()));
                self.push(LogUpdate::SetInProgress(step));
            }
            StreamMessage::Complete {} => {
                self.push(LogUpdate::SetInProgress(None));
                return Flow::Complete;
            }
        }
        Flow::Continue
    }

    fn push(&self, update: LogUpdate) {
        // Only fails once the pump is gone, i.e. the connection is being torn down.
        let _ = self.updates.send(update);
    }
}

/// Moves queued updates into the feed, one tick after they were queued
async fn pump(mut updates: mpsc::UnboundedReceiver<LogUpdate>, feed: StepFeed, epoch: u64) {
    while let Some(first) = updates.recv().await {
        tokio::task::yield_now().await;

        let mut batch = vec![first];
        while let Ok(next) = updates.try_recv() {
            batch.push(next);
        }
        if !feed.apply(epoch, batch) {
            debug!("Discarding reasoning updates from a previous session");
        }
    }
}

/// One live connection: its supervisor and pump tasks.
///
/// Both tasks are aborted when this is dropped.
#[derive(Debug)]
pub struct StreamConnection {
    supervisor: JoinHandle<StreamOutcome>,
    pump: JoinHandle<()>,
    session: watch::Receiver<Option<String>>,
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.pump.abort();
    }
}

pub struct ReasoningStreamClient {
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    feed: StepFeed,
    state: Arc<watch::Sender<ConnectionState>>,
    connection: Option<StreamConnection>,
}

impl ReasoningStreamClient {
    pub fn new(transport: Arc<dyn EventTransport>, policy: ReconnectPolicy, feed: StepFeed) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            policy,
            feed,
            state: Arc::new(state),
            connection: None,
        }
    }

    /// Connect to `session_id`, closing any existing connection first
    pub fn connect(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        self.close();
        info!(session_id = %session_id, "Starting reasoning stream");

        self.start(move |supervisor| async move { supervisor.run(session_id).await });
    }

    /// Connect once `current` yields a session id, polling it with `resolver`.
    ///
    /// If no id turns up the connection ends as [`StreamOutcome::Unresolved`]
    /// and the session continues without live updates.
    pub fn connect_when_resolved<F>(&mut self, resolver: &SessionIdResolver, current: F)
    where
        F: FnMut() -> Option<String> + Send + 'static,
    {
        self.close();
        debug!("Waiting for a session id before streaming");

        let resolution = resolver.spawn(true, current);
        self.start(move |supervisor| async move {
            match resolution.outcome().await {
                ResolveOutcome::Resolved { session_id, .. } => supervisor.run(session_id).await,
                _ => StreamOutcome::Unresolved,
            }
        });
    }

    fn start<F, Fut>(&mut self, body: F)
    where
        F: FnOnce(Supervisor) -> Fut,
        Fut: Future<Output = StreamOutcome> + Send + 'static,
    {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = watch::channel(None);

        let supervisor = Supervisor {
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            feed: self.feed.clone(),
            state: Arc::clone(&self.state),
            session: session_tx,
            updates: updates_tx,
        };

        let pump = tokio::spawn(pump(updates_rx, self.feed.clone(), self.feed.epoch()));
        let supervisor = tokio::spawn(body(supervisor));

        self.connection = Some(StreamConnection {
            supervisor,
            pump,
            session: session_rx,
        });
    }

    /// Tear down the current connection, if any
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(session_id = ?connection.session.borrow().as_deref(), "Closing reasoning stream");
            drop(connection);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Whether a connection is still trying to deliver events
    pub fn is_active(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| !connection.supervisor.is_finished())
    }

    /// Session the current connection is bound to, once known
    pub fn session_id(&self) -> Option<String> {
        self.connection
            .as_ref()
            .and_then(|connection| connection.session.borrow().clone())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn feed(&self) -> &StepFeed {
        &self.feed
    }

    /// Wait up to `grace` for the connection to end on its own.
    ///
    /// When it does, every update it produced has reached the feed before this
    /// returns and the connection is released. `None` means there was no
    /// connection or it is still running.
    pub async fn wait(&mut self, grace: Duration) -> Option<StreamOutcome> {
        let connection = self.connection.as_mut()?;

        let joined = tokio::time::timeout(grace, &mut connection.supervisor)
            .await
            .ok()?;
        let outcome = joined.unwrap_or(StreamOutcome::Closed);

        // The supervisor dropped its sender, so the pump stops once drained.
        let _ = (&mut connection.pump).await;
        self.connection = None;
        self.state.send_replace(ConnectionState::Disconnected);
        Some(outcome)
    }
}

impl Drop for ReasoningStreamClient {
    fn drop(&mut self) {
        if self.connection.is_some() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step_log::{StepContent, StepStatus};
    use crate::testing::{Script, ScriptedTransport, Tail};
    use tokio::time::Instant;

    const FOREVER: Duration = Duration::from_secs(3600);

    fn client(transport: &Arc<ScriptedTransport>) -> ReasoningStreamClient {
        ReasoningStreamClient::new(transport.clone(), ReconnectPolicy::default(), StepFeed::new())
    }

    fn step(id: &str, status: &str, content: &str) -> String {
        serde_json::json!({
            "type": "step",
            "step_id": id,
            "agent": "ml_model",
            "step": "initial_analysis",
            "status": status,
            "content": content
        })
        .to_string()
    }

    const COMPLETE: &str = r#"{"type":"complete"}"#;

    #[tokio::test(start_paused = true)]
    async fn test_events_are_merged_into_feed() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::events(
            vec![
                r#"{"type":"connected","session_id":"S1"}"#.to_string(),
                step("a", "completed", "first"),
                step("b", "in_progress", "thinking"),
                step("b", "completed", "done"),
                step("a", "completed", "revised"),
                COMPLETE.to_string(),
            ],
            Tail::End,
        )]));
        let mut client = client(&transport);

        client.connect("S1");
        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Completed));

        let log = client.feed().snapshot();
        let ids: Vec<&str> = log.steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(log.steps()[0].content, StepContent::Text("revised".to_string()));
        assert!(log.current_in_progress().is_none());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_active());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_in_progress_steps_are_kept() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::events(
            vec![
                step("a", "in_progress", "scoring"),
                step("b", "completed", "scored"),
                step("c", "in_progress", "asking"),
                step("d", "in_progress", "refining"),
                COMPLETE.to_string(),
            ],
            Tail::End,
        )]));
        let mut client = client(&transport);

        client.connect("S1");
        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Completed));

        let log = client.feed().snapshot();
        let ids: Vec<&str> = log.steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert!(log.steps().iter().all(|s| s.status == StepStatus::Completed));
        assert!(log.current_in_progress().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_until_exhausted() {
        let transport = Arc::new(ScriptedTransport::refusing());
        let mut client = client(&transport);
        client.feed().append_all(
            ReasoningStep::from_value(serde_json::json!("seeded"), client.feed().ids()),
        );
        let started = Instant::now();

        client.connect("S1");
        let outcome = client.wait(FOREVER).await;

        assert_eq!(outcome, Some(StreamOutcome::Exhausted { attempts: 10 }));
        let offsets: Vec<u64> = transport
            .open_times()
            .iter()
            .map(|at| at.duration_since(started).as_millis() as u64)
            .collect();
        assert_eq!(
            offsets,
            vec![0, 2000, 6000, 14_000, 24_000, 34_000, 44_000, 54_000, 64_000, 74_000]
        );

        // Nothing else is scheduled, and the log survives.
        tokio::time::sleep(FOREVER).await;
        assert_eq!(transport.open_count(), 10);
        assert_eq!(client.feed().snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_attempts() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Script::Refuse,
            Script::events(vec![step("x", "completed", "partial")], Tail::Error),
            Script::Refuse,
            Script::events(vec![COMPLETE.to_string()], Tail::End),
        ]));
        let mut client = client(&transport);
        let started = Instant::now();

        client.connect("S1");
        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Completed));

        let offsets: Vec<u64> = transport
            .open_times()
            .iter()
            .map(|at| at.duration_since(started).as_millis() as u64)
            .collect();
        assert_eq!(offsets, vec![0, 2000, 4000, 8000]);
        assert_eq!(client.feed().snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ending_without_complete_reconnects() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Script::events(vec![], Tail::End),
            Script::events(vec![COMPLETE.to_string()], Tail::End),
        ]));
        let mut client = client(&transport);

        client.connect("S1");
        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Completed));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_events_are_dropped() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::events(
            vec![
                "not json".to_string(),
                r#"{"type":"mystery"}"#.to_string(),
                r#"{"no_type":true}"#.to_string(),
                r#"{"type":"step","step":{"nested":"wrong"}}"#.to_string(),
                step("ok", "completed", "fine"),
                COMPLETE.to_string(),
            ],
            Tail::End,
        )]));
        let mut client = client(&transport);

        client.connect("S1");
        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Completed));
        assert_eq!(client.feed().snapshot().len(), 1);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_step_sets_pointer() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::events(
            vec![
                r#"{"type":"current_step","step":{"step_id":"p","agent":"llm","step":"ranking"}}"#
                    .to_string(),
            ],
            Tail::Hang,
        )]));
        let mut client = client(&transport);
        let mut steps = client.feed().subscribe();

        client.connect("S1");
        steps.changed().await.unwrap();

        let log = steps.borrow().clone();
        let current = log.current_in_progress().unwrap();
        assert_eq!(current.id, "p");
        assert_eq!(current.status, StepStatus::InProgress);
        assert!(log.steps().is_empty());
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.session_id().as_deref(), Some("S1"));
        assert_eq!(client.wait(Duration::from_secs(1)).await, None);
        assert!(client.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_closes_previous_connection() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Script::events(vec![], Tail::Hang),
            Script::events(vec![], Tail::Hang),
        ]));
        let mut client = client(&transport);

        client.connect("S1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.live(), 1);

        client.connect("S2");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.live(), 1);
        assert_eq!(transport.opened_sessions(), vec!["S1", "S2"]);
        assert_eq!(client.session_id().as_deref(), Some("S2"));

        client.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.live(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_releases_connection() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::events(vec![], Tail::Hang)]));
        {
            let mut client = client(&transport);
            client.connect("S1");
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(transport.live(), 1);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_once_session_id_resolves() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::events(
            vec![COMPLETE.to_string()],
            Tail::End,
        )]));
        let mut client = client(&transport);
        let (id_tx, id_rx) = watch::channel(None::<String>);
        let started = Instant::now();

        client.connect_when_resolved(&SessionIdResolver::default(), move || id_rx.borrow().clone());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(transport.open_count(), 0);
        id_tx.send_replace(Some("S9".to_string()));

        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Completed));
        assert_eq!(transport.opened_sessions(), vec!["S9"]);
        assert_eq!(
            transport.open_times()[0].duration_since(started),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_session_never_connects() {
        let transport = Arc::new(ScriptedTransport::refusing());
        let mut client = client(&transport);

        client.connect_when_resolved(&SessionIdResolver::default(), || None);
        assert_eq!(client.wait(FOREVER).await, Some(StreamOutcome::Unresolved));
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_in_flight_updates() {
        let feed = StepFeed::new();
        let stale = feed.epoch();
        feed.reset();

        let applied = feed.apply(
            stale,
            vec![LogUpdate::Append(
                ReasoningStep::from_value(serde_json::json!("late"), feed.ids()).unwrap(),
            )],
        );
        assert!(!applied);
        assert!(feed.snapshot().is_empty());
    }
}
