//! In-memory queue service with tube / lease semantics.
//!
//! # 実装詳細
//! - ジョブは `BTreeMap<JobId, JobRecord>` に 1 か所だけ保持（single source of truth）
//! - 接続ごとのセッション（use している tube と watch リスト）はサーバ側に持つ
//! - `Mutex` で排他制御、`Notify` で put/release 時に reserve 待ちを起こす
//! - 時刻は `tokio::time::Instant`（テストで時間を止めて進められる）
//!
//! # 使用例
//! ```ignore
//! let server = InMemoryServer::new();
//! let producer = server.client();
//! producer.connect().await?;
//! producer.put(0, Duration::ZERO, Duration::from_secs(60), body).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::{DEFAULT_TUBE, JobId, ProtocolError};
use crate::ports::{JobStateKind, JobStats, PeekedJob, QueueClient, ReservedJob};

type ConnId = u64;

const MAX_TUBE_NAME: usize = 200;

/// Delays, leases and waits are 32-bit seconds on the wire; longer values are clamped.
const MAX_DURATION: Duration = Duration::from_secs(u32::MAX as u64);

fn clamp(d: Duration) -> Duration {
    d.min(MAX_DURATION)
}

fn after(now: Instant, d: Duration) -> Instant {
    now + clamp(d)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Ready,
    Delayed { until: Instant },
    Reserved { by: ConnId, deadline: Instant },
    Buried,
}

#[derive(Debug, Clone)]
struct JobRecord {
    id: JobId,
    tube: String,
    priority: u32,
    delay: Duration,
    ttr: Duration,
    body: Vec<u8>,
    state: RecordState,
    created_at: Instant,
    reserves: u32,
    timeouts: u32,
    releases: u32,
    buries: u32,
}

impl JobRecord {
    fn kind(&self) -> JobStateKind {
        match self.state {
            RecordState::Ready => JobStateKind::Ready,
            RecordState::Delayed { .. } => JobStateKind::Delayed,
            RecordState::Reserved { .. } => JobStateKind::Reserved,
            RecordState::Buried => JobStateKind::Buried,
        }
    }

    fn is_reserved_by(&self, conn: ConnId) -> bool {
        matches!(self.state, RecordState::Reserved { by, .. } if by == conn)
    }

    fn stats(&self, now: Instant) -> JobStats {
        let time_left = match self.state {
            RecordState::Delayed { until } => until.saturating_duration_since(now),
            RecordState::Reserved { deadline, .. } => deadline.saturating_duration_since(now),
            RecordState::Ready | RecordState::Buried => Duration::ZERO,
        };
        JobStats {
            id: self.id,
            tube: self.tube.clone(),
            state: self.kind(),
            pri: self.priority,
            age: now.saturating_duration_since(self.created_at).as_secs(),
            delay: self.delay.as_secs(),
            ttr: self.ttr.as_secs(),
            time_left: time_left.as_secs(),
            reserves: self.reserves,
            timeouts: self.timeouts,
            releases: self.releases,
            buries: self.buries,
        }
    }
}

#[derive(Debug)]
struct Session {
    using: String,
    watching: Vec<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            using: DEFAULT_TUBE.to_string(),
            watching: vec![DEFAULT_TUBE.to_string()],
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    jobs: BTreeMap<JobId, JobRecord>,
    sessions: HashMap<ConnId, Session>,
    next_job_id: u64,
    next_conn_id: u64,
}

impl ServerState {
    /// Move delayed jobs whose time has come, and expired reservations, back to ready.
    fn promote(&mut self, now: Instant) {
        for job in self.jobs.values_mut() {
            match job.state {
                RecordState::Delayed { until } if until <= now => job.state = RecordState::Ready,
                RecordState::Reserved { deadline, .. } if deadline <= now => {
                    job.state = RecordState::Ready;
                    job.timeouts += 1;
                }
                _ => {}
            }
        }
    }

    /// Earliest instant at which `promote` would change something.
    fn next_wake(&self) -> Option<Instant> {
        self.jobs
            .values()
            .filter_map(|job| match job.state {
                RecordState::Delayed { until } => Some(until),
                RecordState::Reserved { deadline, .. } => Some(deadline),
                _ => None,
            })
            .min()
    }

    fn session(&self, conn: ConnId) -> Result<&Session, ProtocolError> {
        self.sessions.get(&conn).ok_or(ProtocolError::NotConnected)
    }

    fn session_mut(&mut self, conn: ConnId) -> Result<&mut Session, ProtocolError> {
        self.sessions.get_mut(&conn).ok_or(ProtocolError::NotConnected)
    }

    /// Reserve the most urgent ready job from a watched tube (priority, then FIFO).
    fn reserve_ready(&mut self, conn: ConnId, now: Instant) -> Result<Option<ReservedJob>, ProtocolError> {
        let watching = self.session(conn)?.watching.clone();
        let candidate = self
            .jobs
            .values()
            .filter(|job| job.state == RecordState::Ready && watching.contains(&job.tube))
            .min_by_key(|job| (job.priority, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = self.jobs.get_mut(&id).ok_or(ProtocolError::NotFound)?;
        job.state = RecordState::Reserved {
            by: conn,
            deadline: after(now, job.ttr),
        };
        job.reserves += 1;
        Ok(Some(ReservedJob {
            id,
            priority: Some(job.priority),
            body: job.body.clone(),
        }))
    }

    fn reserved_by(&mut self, conn: ConnId, id: JobId) -> Result<&mut JobRecord, ProtocolError> {
        match self.jobs.get_mut(&id) {
            Some(job) if job.is_reserved_by(conn) => Ok(job),
            _ => Err(ProtocolError::NotFound),
        }
    }

    fn peek(&self, tube: &str, kind: JobStateKind) -> Result<PeekedJob, ProtocolError> {
        self.jobs
            .values()
            .filter(|job| job.tube == tube && job.kind() == kind)
            .min_by_key(|job| match kind {
                // priority does not apply to buried jobs
                JobStateKind::Buried => (0, job.id),
                _ => (job.priority, job.id),
            })
            .map(|job| PeekedJob {
                id: job.id,
                body: job.body.clone(),
            })
            .ok_or(ProtocolError::NotFound)
    }
}

struct Shared {
    addr: String,
    online: AtomicBool,
    state: Mutex<ServerState>,
    notify: Notify,
}

/// A queue service living inside the process.
///
/// Cloning the server shares the same jobs; each `client()` is a separate connection.
#[derive(Clone)]
pub struct InMemoryServer {
    shared: Arc<Shared>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::with_addr("127.0.0.1:11300")
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                addr: addr.into(),
                online: AtomicBool::new(true),
                state: Mutex::new(ServerState {
                    next_job_id: 1,
                    next_conn_id: 1,
                    ..ServerState::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// A server nobody can connect to.
    pub fn unreachable(addr: impl Into<String>) -> Self {
        let server = Self::with_addr(addr);
        server.set_online(false);
        server
    }

    /// New connections are refused while offline; existing ones keep working.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn client(&self) -> InMemoryClient {
        InMemoryClient {
            shared: Arc::clone(&self.shared),
            conn: parking_lot::Mutex::new(None),
        }
    }

    /// Number of jobs in any state.
    pub async fn job_count(&self) -> usize {
        self.shared.state.lock().await.jobs.len()
    }
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to an `InMemoryServer`.
pub struct InMemoryClient {
    shared: Arc<Shared>,
    conn: parking_lot::Mutex<Option<ConnId>>,
}

impl InMemoryClient {
    fn conn(&self) -> Result<ConnId, ProtocolError> {
        (*self.conn.lock()).ok_or(ProtocolError::NotConnected)
    }
}

fn check_tube_name(tube: &str) -> Result<(), ProtocolError> {
    if tube.is_empty() || tube.len() > MAX_TUBE_NAME {
        return Err(ProtocolError::BadFormat(format!("invalid tube name {tube:?}")));
    }
    Ok(())
}

#[async_trait]
impl QueueClient for InMemoryClient {
    fn target(&self) -> String {
        self.shared.addr.clone()
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        if !self.shared.online.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionRefused(self.shared.addr.clone()));
        }
        if self.conn.lock().is_some() {
            return Ok(());
        }

        let mut state = self.shared.state.lock().await;
        let conn = state.next_conn_id;
        state.next_conn_id += 1;
        state.sessions.insert(conn, Session::new());
        *self.conn.lock() = Some(conn);
        debug!(conn, addr = %self.shared.addr, "connection opened");
        Ok(())
    }

    async fn quit(&self) -> Result<(), ProtocolError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };

        let mut state = self.shared.state.lock().await;
        state.sessions.remove(&conn);
        let mut returned = 0;
        for job in state.jobs.values_mut() {
            if job.is_reserved_by(conn) {
                job.state = RecordState::Ready;
                returned += 1;
            }
        }
        drop(state);

        if returned > 0 {
            self.shared.notify.notify_waiters();
        }
        debug!(conn, returned, "connection closed");
        Ok(())
    }

    async fn use_tube(&self, tube: &str) -> Result<String, ProtocolError> {
        check_tube_name(tube)?;
        let conn = self.conn()?;
        let mut state = self.shared.state.lock().await;
        state.session_mut(conn)?.using = tube.to_string();
        Ok(tube.to_string())
    }

    async fn watch(&self, tube: &str) -> Result<usize, ProtocolError> {
        check_tube_name(tube)?;
        let conn = self.conn()?;
        let mut state = self.shared.state.lock().await;
        let session = state.session_mut(conn)?;
        if !session.watching.iter().any(|t| t == tube) {
            session.watching.push(tube.to_string());
        }
        Ok(session.watching.len())
    }

    async fn ignore(&self, tube: &str) -> Result<usize, ProtocolError> {
        let conn = self.conn()?;
        let mut state = self.shared.state.lock().await;
        let session = state.session_mut(conn)?;
        if session.watching.len() == 1 && session.watching[0] == tube {
            return Err(ProtocolError::NotIgnored);
        }
        session.watching.retain(|t| t != tube);
        Ok(session.watching.len())
    }

    async fn list_tubes_watched(&self) -> Result<Vec<String>, ProtocolError> {
        let conn = self.conn()?;
        let state = self.shared.state.lock().await;
        Ok(state.session(conn)?.watching.clone())
    }

    async fn put(
        &self,
        priority: u32,
        delay: Duration,
        ttr: Duration,
        body: Vec<u8>,
    ) -> Result<JobId, ProtocolError> {
        let conn = self.conn()?;
        let now = Instant::now();

        let mut state = self.shared.state.lock().await;
        let tube = state.session(conn)?.using.clone();
        let id = JobId::new(state.next_job_id);
        state.next_job_id += 1;

        let job_state = if delay.is_zero() {
            RecordState::Ready
        } else {
            RecordState::Delayed { until: after(now, delay) }
        };
        state.jobs.insert(
            id,
            JobRecord {
                id,
                tube: tube.clone(),
                priority,
                delay: clamp(delay),
                // a zero time-to-run would expire before anyone could work on it
                ttr: clamp(ttr.max(Duration::from_secs(1))),
                body,
                state: job_state,
                created_at: now,
                reserves: 0,
                timeouts: 0,
                releases: 0,
                buries: 0,
            },
        );
        drop(state);

        self.shared.notify.notify_waiters();
        trace!(job_id = %id, %tube, priority, "job put");
        Ok(id)
    }

    async fn reserve_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<ReservedJob>, ProtocolError> {
        let conn = self.conn()?;
        let deadline = after(Instant::now(), timeout);

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);

            let wake_at = {
                let mut state = self.shared.state.lock().await;
                let now = Instant::now();
                state.promote(now);
                if let Some(job) = state.reserve_ready(conn, now)? {
                    trace!(conn, job_id = %job.id, "job reserved");
                    return Ok(Some(job));
                }
                if now >= deadline {
                    return Ok(None);
                }
                // register before releasing the lock so a put in between is not missed
                notified.as_mut().enable();
                state.next_wake().map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, id: JobId) -> Result<(), ProtocolError> {
        let conn = self.conn()?;
        let mut state = self.shared.state.lock().await;
        let reserved_elsewhere = match state.jobs.get(&id) {
            Some(job) => matches!(job.state, RecordState::Reserved { by, .. } if by != conn),
            None => return Err(ProtocolError::NotFound),
        };
        if reserved_elsewhere {
            return Err(ProtocolError::NotFound);
        }
        state.jobs.remove(&id);
        trace!(job_id = %id, "job deleted");
        Ok(())
    }

    async fn bury(&self, id: JobId, priority: u32) -> Result<(), ProtocolError> {
        let conn = self.conn()?;
        let mut state = self.shared.state.lock().await;
        let job = state.reserved_by(conn, id)?;
        job.state = RecordState::Buried;
        job.priority = priority;
        job.buries += 1;
        trace!(job_id = %id, "job buried");
        Ok(())
    }

    async fn release(
        &self,
        id: JobId,
        priority: u32,
        delay: Duration,
    ) -> Result<(), ProtocolError> {
        let conn = self.conn()?;
        let now = Instant::now();

        let mut state = self.shared.state.lock().await;
        let job = state.reserved_by(conn, id)?;
        job.priority = priority;
        job.delay = clamp(delay);
        job.releases += 1;
        job.state = if delay.is_zero() {
            RecordState::Ready
        } else {
            RecordState::Delayed { until: after(now, delay) }
        };
        drop(state);

        self.shared.notify.notify_waiters();
        trace!(job_id = %id, delay_secs = delay.as_secs(), "job released");
        Ok(())
    }

    async fn touch(&self, id: JobId) -> Result<(), ProtocolError> {
        let conn = self.conn()?;
        let now = Instant::now();

        let mut state = self.shared.state.lock().await;
        let job = state.reserved_by(conn, id)?;
        job.state = RecordState::Reserved {
            by: conn,
            deadline: after(now, job.ttr),
        };
        Ok(())
    }

    async fn peek_ready(&self) -> Result<PeekedJob, ProtocolError> {
        let conn = self.conn()?;
        let mut state = self.shared.state.lock().await;
        state.promote(Instant::now());
        let tube = state.session(conn)?.using.clone();
        state.peek(&tube, JobStateKind::Ready)
    }

    async fn peek_buried(&self) -> Result<PeekedJob, ProtocolError> {
        let conn = self.conn()?;
        let state = self.shared.state.lock().await;
        let tube = &state.session(conn)?.using;
        state.peek(tube, JobStateKind::Buried)
    }

    async fn stats_job(&self, id: JobId) -> Result<JobStats, ProtocolError> {
        self.conn()?;
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        state.promote(now);
        state
            .jobs
            .get(&id)
            .map(|job| job.stats(now))
            .ok_or(ProtocolError::NotFound)
    }
}
