//! Per-stack update queue.
//!
//! At most one update per stack is in flight at the backend. Callers line up
//! in a persisted table; the oldest live row goes next, and a row that sees a
//! newer one behind it before its turn gives up, since its document is
//! already stale.
//!
//! The table is the only coordination point: there is no in-memory lock, so
//! the queue survives restarts. Every owner refreshes its row's heartbeat
//! while it waits and while its update runs; rows whose heartbeat is older
//! than [`QueueConfig::stale_after`] belong to a crashed process and are
//! skipped and reaped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockyard_reconcile::{Backoff, DEFAULT_MAX_POLL_INTERVAL, DEFAULT_POLL_INTERVAL};
use sqlx::postgres::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::cancellable;
use crate::backend::stack::{Parameter, Stack, UpdateStackInput};
use crate::backend::{BackendError, StackApi};
use crate::db::DbError;
use crate::error::SchedulerResult;

/// Queue timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// First delay between position checks.
    pub poll_interval: Duration,

    /// Ceiling for the doubling delay.
    pub max_poll_interval: Duration,

    /// Rows whose heartbeat is older than this are treated as abandoned.
    pub stale_after: Duration,

    /// How often an owner refreshes its row. Must be well below `stale_after`.
    pub heartbeat_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            stale_after: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Rows last heard from before this instant are stale.
    pub fn live_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Live rows of one stack, as seen by one waiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    /// The waiter's own row is still present.
    pub present: bool,
}

/// Where a waiter stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Active,
    Waiting,
    Superseded,
}

impl QueueSnapshot {
    pub fn position(&self, id: i64) -> Position {
        if !self.present {
            return Position::Superseded;
        }
        if self.oldest == Some(id) {
            return Position::Active;
        }
        if self.newest.is_some_and(|newest| newest > id) {
            return Position::Superseded;
        }
        Position::Waiting
    }
}

/// Storage for queue rows.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a row for `stack`, returning its id.
    async fn enqueue(&self, stack: &str) -> SchedulerResult<i64>;

    /// Mark the row as still owned.
    async fn heartbeat(&self, id: i64) -> SchedulerResult<()>;

    /// Oldest and newest rows of `stack` heard from since `live_since`.
    ///
    /// The row `own_id` always counts as live.
    async fn snapshot(
        &self,
        stack: &str,
        live_since: DateTime<Utc>,
        own_id: i64,
    ) -> SchedulerResult<QueueSnapshot>;

    async fn remove(&self, id: i64) -> SchedulerResult<()>;

    /// Delete rows of `stack` last heard from before `before`, except `own_id`.
    async fn reap(&self, stack: &str, before: DateTime<Utc>, own_id: i64)
        -> SchedulerResult<u64>;
}

/// Postgres-backed queue over `stack_update_queue`.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, stack: &str) -> SchedulerResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO stack_update_queue (stack) VALUES ($1) RETURNING id",
        )
        .bind(stack)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(id)
    }

    async fn heartbeat(&self, id: i64) -> SchedulerResult<()> {
        sqlx::query("UPDATE stack_update_queue SET heartbeat_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn snapshot(
        &self,
        stack: &str,
        live_since: DateTime<Utc>,
        own_id: i64,
    ) -> SchedulerResult<QueueSnapshot> {
        let (oldest, newest, present): (Option<i64>, Option<i64>, bool) = sqlx::query_as(
            r#"
            SELECT MIN(id), MAX(id), COALESCE(BOOL_OR(id = $3), false)
            FROM stack_update_queue
            WHERE stack = $1 AND (heartbeat_at >= $2 OR id = $3)
            "#,
        )
        .bind(stack)
        .bind(live_since)
        .bind(own_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(QueueSnapshot {
            oldest,
            newest,
            present,
        })
    }

    async fn remove(&self, id: i64) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM stack_update_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn reap(
        &self,
        stack: &str,
        before: DateTime<Utc>,
        own_id: i64,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM stack_update_queue WHERE stack = $1 AND heartbeat_at < $2 AND id <> $3",
        )
        .bind(stack)
        .bind(before)
        .bind(own_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
struct Row {
    stack: String,
    heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Rows {
    next_id: i64,
    rows: BTreeMap<i64, Row>,
}

/// In-memory queue for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    rows: Mutex<Rows>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row last heard from at `heartbeat_at`.
    pub fn enqueue_at(&self, stack: &str, heartbeat_at: DateTime<Utc>) -> i64 {
        let mut rows = self.lock();
        rows.next_id += 1;
        let id = rows.next_id;
        rows.rows.insert(
            id,
            Row {
                stack: stack.to_string(),
                heartbeat_at,
            },
        );
        id
    }

    /// Ids currently queued for `stack`.
    pub fn ids(&self, stack: &str) -> Vec<i64> {
        self.lock()
            .rows
            .iter()
            .filter(|(_, row)| row.stack == stack)
            .map(|(id, _)| *id)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, stack: &str) -> SchedulerResult<i64> {
        Ok(self.enqueue_at(stack, Utc::now()))
    }

    async fn heartbeat(&self, id: i64) -> SchedulerResult<()> {
        if let Some(row) = self.lock().rows.get_mut(&id) {
            row.heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        stack: &str,
        live_since: DateTime<Utc>,
        own_id: i64,
    ) -> SchedulerResult<QueueSnapshot> {
        let rows = self.lock();
        let live: BTreeSet<i64> = rows
            .rows
            .iter()
            .filter(|(id, row)| {
                row.stack == stack && (row.heartbeat_at >= live_since || **id == own_id)
            })
            .map(|(id, _)| *id)
            .collect();

        Ok(QueueSnapshot {
            oldest: live.first().copied(),
            newest: live.last().copied(),
            present: live.contains(&own_id),
        })
    }

    async fn remove(&self, id: i64) -> SchedulerResult<()> {
        self.lock().rows.remove(&id);
        Ok(())
    }

    async fn reap(
        &self,
        stack: &str,
        before: DateTime<Utc>,
        own_id: i64,
    ) -> SchedulerResult<u64> {
        let mut rows = self.lock();
        let before_len = rows.rows.len();
        rows.rows
            .retain(|id, row| !(row.stack == stack && row.heartbeat_at < before && *id != own_id));
        Ok((before_len - rows.rows.len()) as u64)
    }
}

/// How a queued update ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update ran to completion.
    Applied,
    /// The backend found nothing to change.
    NoChanges,
    /// A newer update arrived first; nothing was sent.
    Superseded,
}

impl UpdateOutcome {
    /// True when the stack now reflects the submitted update.
    pub fn is_current(&self) -> bool {
        matches!(self, Self::Applied | Self::NoChanges)
    }
}

/// A queue row owned by this process.
///
/// Keeps the row's heartbeat fresh until released. Dropping it without
/// releasing removes the row in the background.
struct Ticket {
    store: Arc<dyn QueueStore>,
    id: i64,
    armed: bool,
    heartbeat: JoinHandle<()>,
}

impl Ticket {
    fn issue(store: Arc<dyn QueueStore>, id: i64, interval: Duration) -> Self {
        let period = interval.max(Duration::from_millis(1));
        let heartbeat = tokio::spawn({
            let store = store.clone();
            async move {
                let mut ticker = tokio::time::interval(period);
                // The first tick completes immediately and the row is fresh.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = store.heartbeat(id).await {
                        warn!(queue_id = id, error = %err, "Failed to refresh queue row");
                    }
                }
            }
        });
        Self {
            store,
            id,
            armed: true,
            heartbeat,
        }
    }

    async fn release(mut self) -> SchedulerResult<()> {
        self.armed = false;
        self.heartbeat.abort();
        self.store.remove(self.id).await
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if !self.armed {
            return;
        }
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(err) = store.remove(id).await {
                        warn!(queue_id = id, error = %err, "Failed to remove abandoned queue row");
                    }
                });
            }
            Err(_) => warn!(queue_id = id, "No runtime to remove abandoned queue row"),
        }
    }
}

/// The exclusive right to update one stack.
///
/// Held from the moment the caller's row becomes the oldest live row until
/// [`QueueTurn::apply`] or [`QueueTurn::release`]. Dropping it ends the turn.
pub struct QueueTurn<'a> {
    queue: &'a StackUpdateQueue,
    ticket: Ticket,
    stack: String,
}

impl QueueTurn<'_> {
    /// The stack as it stands now, once any update started elsewhere settled.
    pub async fn current(&self, cancel: &CancellationToken) -> SchedulerResult<Stack> {
        self.queue.settled(&self.stack, cancel).await
    }

    /// Send `input` and wait for it to finish. The turn ends either way.
    pub async fn apply(
        self,
        input: UpdateStackInput,
        cancel: &CancellationToken,
    ) -> SchedulerResult<UpdateOutcome> {
        let result = self.queue.apply(self.ticket.id, input, cancel).await;
        self.ticket.release().await?;
        result
    }

    /// End the turn without updating.
    pub async fn release(self) -> SchedulerResult<()> {
        self.ticket.release().await
    }
}

/// Serializes updates per stack.
pub struct StackUpdateQueue {
    store: Arc<dyn QueueStore>,
    stacks: Arc<dyn StackApi>,
    config: QueueConfig,
}

impl StackUpdateQueue {
    pub fn new(store: Arc<dyn QueueStore>, stacks: Arc<dyn StackApi>, config: QueueConfig) -> Self {
        Self {
            store,
            stacks,
            config,
        }
    }

    /// Apply `input` once every earlier update of the same stack has finished.
    ///
    /// Returns [`UpdateOutcome::Superseded`] without touching the stack when a
    /// newer update was queued before this one's turn.
    #[instrument(skip_all, fields(stack = %input.name))]
    pub async fn update_stack(
        &self,
        input: UpdateStackInput,
        cancel: &CancellationToken,
    ) -> SchedulerResult<UpdateOutcome> {
        match self.take_turn(&input.name, cancel).await? {
            Some(turn) => turn.apply(input, cancel).await,
            None => Ok(UpdateOutcome::Superseded),
        }
    }

    /// Queue up for `stack` and wait until this caller is at the front.
    ///
    /// `None` means a newer caller queued up meanwhile; its row is gone.
    #[instrument(skip(self, cancel))]
    pub async fn take_turn(
        &self,
        stack: &str,
        cancel: &CancellationToken,
    ) -> SchedulerResult<Option<QueueTurn<'_>>> {
        let id = self.store.enqueue(stack).await?;
        let ticket = Ticket::issue(self.store.clone(), id, self.config.heartbeat_interval);
        debug!(queue_id = id, "Enqueued stack update");

        match self.wait_for_turn(stack, id, cancel).await {
            Ok(Position::Superseded) => {
                info!(queue_id = id, "Stack update superseded by a newer one");
                ticket.release().await?;
                Ok(None)
            }
            Ok(_) => {
                debug!(queue_id = id, "Stack update active");
                Ok(Some(QueueTurn {
                    queue: self,
                    ticket,
                    stack: stack.to_string(),
                }))
            }
            Err(err) => {
                if let Err(release) = ticket.release().await {
                    warn!(queue_id = id, error = %release, "Failed to leave the queue");
                }
                Err(err)
            }
        }
    }

    /// Describe the stack, first waiting out a create or update in progress.
    async fn settled(&self, name: &str, cancel: &CancellationToken) -> SchedulerResult<Stack> {
        let stack = self.stacks.describe_stack(name).await?;
        if stack.is_create_in_progress() {
            debug!(stack = %name, "Waiting for stack creation");
            cancellable(cancel, self.stacks.wait_until_create_complete(name)).await??;
        } else if stack.is_in_progress() {
            debug!(stack = %name, status = %stack.status, "Waiting for in-flight update");
            cancellable(cancel, self.stacks.wait_until_update_complete(name)).await??;
        } else {
            return Ok(stack);
        }
        Ok(self.stacks.describe_stack(name).await?)
    }

    async fn apply(
        &self,
        id: i64,
        mut input: UpdateStackInput,
        cancel: &CancellationToken,
    ) -> SchedulerResult<UpdateOutcome> {
        let current = self.settled(&input.name, cancel).await?;
        if input.use_previous_template {
            keep_missing_parameters(&mut input.parameters, &current.parameters);
        }

        let name = input.name.clone();
        match self.stacks.update_stack(input).await {
            Ok(()) => {}
            Err(BackendError::NoUpdatesToPerform) => {
                debug!("Stack already up to date");
                return Ok(UpdateOutcome::NoChanges);
            }
            Err(err) => return Err(err.into()),
        }

        cancellable(cancel, self.stacks.wait_until_update_complete(&name)).await??;
        info!(queue_id = id, "Stack update complete");
        Ok(UpdateOutcome::Applied)
    }

    async fn wait_for_turn(
        &self,
        stack: &str,
        id: i64,
        cancel: &CancellationToken,
    ) -> SchedulerResult<Position> {
        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_poll_interval);
        loop {
            let live_since = self.config.live_since(Utc::now());
            let snapshot = self.store.snapshot(stack, live_since, id).await?;

            match snapshot.position(id) {
                Position::Waiting => {}
                Position::Superseded if !snapshot.present => {
                    warn!(queue_id = id, "Queue row vanished while waiting");
                    return Ok(Position::Superseded);
                }
                position => return Ok(position),
            }

            let reaped = self.store.reap(stack, live_since, id).await?;
            if reaped > 0 {
                warn!(reaped, "Reaped stale queue rows");
            }

            let delay = backoff.next_delay();
            debug!(queue_id = id, delay_ms = delay.as_millis() as u64, "Waiting for turn");
            cancellable(cancel, tokio::time::sleep(delay)).await?;
        }
    }
}

/// Mark every current parameter the caller left out as keep-previous.
pub fn keep_missing_parameters(parameters: &mut Vec<Parameter>, current: &[Parameter]) {
    let supplied: BTreeSet<String> = parameters.iter().map(|p| p.key.clone()).collect();
    for existing in current {
        if !supplied.contains(&existing.key) {
            parameters.push(Parameter::keep(existing.key.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position() {
        let snapshot = QueueSnapshot {
            oldest: Some(1),
            newest: Some(3),
            present: true,
        };
        assert_eq!(snapshot.position(1), Position::Active);
        assert_eq!(snapshot.position(2), Position::Superseded);
        assert_eq!(snapshot.position(3), Position::Waiting);

        let gone = QueueSnapshot {
            present: false,
            ..snapshot
        };
        assert_eq!(gone.position(3), Position::Superseded);
    }

    #[test]
    fn test_keep_missing_parameters() {
        let mut parameters = vec![Parameter::new("WebScale", "3")];
        let current = vec![
            Parameter::new("WebScale", "1"),
            Parameter::new("WorkerScale", "2"),
            Parameter::new("DNS", "true"),
        ];

        keep_missing_parameters(&mut parameters, &current);

        assert_eq!(
            parameters,
            vec![
                Parameter::new("WebScale", "3"),
                Parameter::keep("WorkerScale"),
                Parameter::keep("DNS"),
            ]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_old_row_live() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let old = store.enqueue_at("dockyard-1234", now - chrono::Duration::hours(2));
        let newer = store.enqueue_at("dockyard-1234", now);
        let live_since = QueueConfig::default().live_since(now);

        store.heartbeat(old).await.unwrap();

        let snapshot = store.snapshot("dockyard-1234", live_since, newer).await.unwrap();
        assert_eq!(snapshot.oldest, Some(old));
        assert_eq!(snapshot.position(newer), Position::Waiting);
        assert_eq!(store.reap("dockyard-1234", live_since, newer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_snapshot_ignores_stale_rows() {
        let store = MemoryQueueStore::new();
        let now = Utc::now();
        let stale = store.enqueue_at("dockyard-1234", now - chrono::Duration::hours(2));
        let fresh = store.enqueue_at("dockyard-1234", now);
        store.enqueue_at("dockyard-other", now);

        let live_since = QueueConfig::default().live_since(now);
        let snapshot = store.snapshot("dockyard-1234", live_since, fresh).await.unwrap();
        assert_eq!(snapshot.oldest, Some(fresh));
        assert_eq!(snapshot.position(fresh), Position::Active);

        let reaped = store.reap("dockyard-1234", live_since, fresh).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(store.ids("dockyard-1234"), vec![fresh]);
        assert_ne!(stale, fresh);
    }

    #[test]
    fn test_live_since_saturates() {
        let config = QueueConfig {
            stale_after: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(config.live_since(Utc::now()), DateTime::<Utc>::MIN_UTC);
    }
}
