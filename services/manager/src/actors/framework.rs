//! Core actor framework types and traits.
//!
//! Provides the building blocks for the per-volume actors:
//! - `Actor` trait for defining actor behavior
//! - `Supervisor` for spawning and stopping actors
//! - `ActorHandle` for sending messages and making request/reply calls
//! - `BackoffPolicy` for spacing out automatic retries

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,
    pub shutdown: watch::Receiver<bool>,
    pub messages_processed: u64,
    pub state: ActorState,
}

impl ActorContext {
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
            state: ActorState::Starting,
        }
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// Sends a message carrying a reply channel and waits for the reply.
    pub async fn call<T, F>(&self, make: F) -> Result<T, ActorError>
    where
        F: FnOnce(oneshot::Sender<T>) -> M,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| ActorError::ActorStopped)
    }
}

/// A supervised actor's task and its private stop signal.
struct ActorRef {
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the running actors and stops them on demand or at shutdown.
pub struct Supervisor {
    children: HashMap<String, ActorRef>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// `shutdown` is the process-wide signal; every child also stops when it fires.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            children: HashMap::new(),
            shutdown,
        }
    }

    /// Spawns an actor under `actor_id`.
    pub fn spawn<A>(&mut self, actor_id: &str, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        self.spawn_with(actor_id, mailbox_size, |_| actor)
    }

    /// Spawns an actor built from its own handle, for actors that feed
    /// messages back into their mailbox.
    pub fn spawn_with<A, F>(
        &mut self,
        actor_id: &str,
        mailbox_size: usize,
        build: F,
    ) -> ActorHandle<A::Message>
    where
        A: Actor,
        F: FnOnce(ActorHandle<A::Message>) -> A,
    {
        let (tx, rx) = mpsc::channel(mailbox_size);
        let handle = ActorHandle { tx };
        let actor = build(handle.clone());
        let actor_type = actor.name().to_string();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut global = self.shutdown.clone();
        let child_shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            while global.changed().await.is_ok() {
                if *global.borrow() {
                    let _ = child_shutdown.send(true);
                    break;
                }
            }
        });

        let id = actor_id.to_string();
        let task_handle = tokio::spawn(async move {
            run_actor_loop(actor, rx, shutdown_rx, id).await;
        });

        if let Some(previous) = self.children.insert(
            actor_id.to_string(),
            ActorRef {
                task_handle,
                shutdown_tx,
            },
        ) {
            warn!(actor_id = %actor_id, "Replacing existing actor");
            previous.stop();
        }

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");
        handle
    }

    /// Signals one actor to stop and forgets it.
    pub fn stop(&mut self, actor_id: &str) -> bool {
        match self.children.remove(actor_id) {
            Some(child) => {
                child.stop();
                true
            }
            None => false,
        }
    }

    /// Forgets actors whose task has ended and returns their ids.
    pub fn reap(&mut self) -> Vec<String> {
        let finished: Vec<String> = self
            .children
            .iter()
            .filter(|(_, child)| !child.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            self.children.remove(id);
        }
        finished
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.stop();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (actor_id, child) in &self.children {
            if child.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.abort();
            }
        }

        self.children.clear();
    }

    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor error");
                        if matches!(e, ActorError::Permanent(_)) {
                            ctx.state = ActorState::Failed;
                            break;
                        }
                    }
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    ctx.state = ActorState::Stopped;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum CounterMessage {
        Add(u64),
        Get(oneshot::Sender<u64>),
        Stop,
    }

    struct Counter {
        total: u64,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: CounterMessage,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Add(n) => self.total += n,
                CounterMessage::Get(reply) => {
                    let _ = reply.send(self.total);
                }
                CounterMessage::Stop => return Ok(false),
            }
            Ok(true)
        }
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        assert!(policy.delay(0) < Duration::from_millis(200));
        assert!(policy.delay(1) < Duration::from_millis(400));
        assert!(policy.delay(2) < Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let handle = supervisor.spawn("counter-1", Counter { total: 0 }, 8);

        handle.send(CounterMessage::Add(2)).await.unwrap();
        handle.send(CounterMessage::Add(3)).await.unwrap();
        let total = handle.call(CounterMessage::Get).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(supervisor.running_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_message_ends_actor() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let handle = supervisor.spawn("counter-2", Counter { total: 0 }, 8);

        handle.send(CounterMessage::Stop).await.unwrap();
        let err = handle.call(CounterMessage::Get).await;
        assert!(err.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.reap(), vec!["counter-2".to_string()]);
    }

    #[tokio::test]
    async fn test_global_shutdown_stops_children() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(shutdown_rx);
        let handle = supervisor.spawn("counter-3", Counter { total: 0 }, 8);

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.call(CounterMessage::Get).await.is_err());
        assert_eq!(supervisor.running_count(), 0);
    }
}
