//! WorkerEngine - reserve → decode → route → handle → dispose
//!
//! # フロー
//! 1. `start()` で接続し、tube を watch してから `started` を publish
//! 2. ループ: `reserve_with_timeout` → `job.reserved`
//! 3. body を decode（壊れていれば delete）
//! 4. registry で handler を引く（無ければ bury）
//! 5. handler を別タスクで実行 → `job.handled`
//! 6. `HandlerResult` に従って delete / bury / release を 1 回だけ実行
//!
//! 停止は協調的: `request_stop()` はフラグを立てるだけで、実行中の
//! reserve や handler は中断しない。ループ先頭でフラグを見て抜け、
//! 接続を閉じてから `stopped` を publish する。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::config::WorkerConfig;
use super::event_bus::EventBus;
use super::status::WorkerStatus;
use crate::domain::{
    DEFAULT_TUBE, Disposition, HandlerResult, JobEnvelope, JobId, LOWEST_PRIORITY, Warning,
    WorkerError, WorkerEvent, WorkerState,
};
use crate::ports::{QueueClient, ReservedJob};
use crate::typed::{DynHandler, HandlerRegistry, JobContext, codec};

/// Pause after a failed reservation before trying again.
const RESERVE_RETRY_PAUSE: Duration = Duration::from_millis(250);

pub struct WorkerEngine {
    config: WorkerConfig,
    registry: Arc<HandlerRegistry>,
    client: Arc<dyn QueueClient>,
    events: Arc<EventBus>,
    state: watch::Sender<WorkerState>,
    stop_flag: watch::Sender<bool>,
    stopped: AtomicBool,
    status: Mutex<WorkerStatus>,
}

impl WorkerEngine {
    pub fn new(
        config: WorkerConfig,
        registry: HandlerRegistry,
        client: Arc<dyn QueueClient>,
        events: Arc<EventBus>,
    ) -> Self {
        let status = WorkerStatus::new(config.id.clone());
        Self {
            config,
            registry: Arc::new(registry),
            client,
            events,
            state: watch::Sender::new(WorkerState::Idle),
            stop_flag: watch::Sender::new(false),
            stopped: AtomicBool::new(false),
            status: Mutex::new(status),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Reservation timeout in seconds.
    pub fn timeout(&self) -> u64 {
        self.config.timeout
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Set once the connection is closed, right before `stopped` is published.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Connection shared with handlers, e.g. for `touch` or `stats_job`.
    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn status(&self) -> WorkerStatus {
        let mut status = self.status.lock().clone();
        status.state = self.state();
        status
    }

    /// Connect, watch `tubes` (configured tubes when empty) and spawn the loop.
    ///
    /// A refused connection publishes `error` and returns the engine to `Idle`.
    pub async fn start(self: &Arc<Self>, tubes: &[&str]) -> Result<(), WorkerError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == WorkerState::Idle {
                *state = WorkerState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(WorkerError::AlreadyStarted);
        }

        let target = self.client.target();
        info!(worker = %self.config.id, %target, "connecting");

        if let Err(source) = self.client.connect().await {
            error!(worker = %self.config.id, %target, error = %source, "connection failed");
            self.publish(WorkerEvent::error(&source));
            // a stop that landed while connecting has already moved us to Stopping
            let reset = self.state.send_if_modified(|state| {
                if *state == WorkerState::Connecting {
                    *state = WorkerState::Idle;
                    true
                } else {
                    false
                }
            });
            if !reset {
                self.mark_stopped();
            }
            return Err(WorkerError::Connect { target, source });
        }

        if self.stop_requested() {
            self.finish().await;
            return Ok(());
        }

        self.advance(WorkerState::Watching);
        self.watch_tubes(tubes).await;

        if self.stop_requested() {
            self.finish().await;
            return Ok(());
        }

        self.advance(WorkerState::Reserving);
        info!(worker = %self.config.id, "started");
        self.publish(WorkerEvent::Started);

        let worker = tokio::spawn(Arc::clone(self).run());
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                engine.recover(e).await;
            }
        });
        Ok(())
    }

    /// Ask the loop to stop after the job in flight, without waiting.
    ///
    /// Safe to call from an event listener.
    pub fn request_stop(&self) {
        self.stop_flag.send_replace(true);

        let mut never_started = false;
        self.state.send_if_modified(|state| match *state {
            WorkerState::Idle => {
                never_started = true;
                *state = WorkerState::Stopped;
                true
            }
            WorkerState::Stopping | WorkerState::Stopped => false,
            _ => {
                *state = WorkerState::Stopping;
                true
            }
        });

        if never_started {
            self.mark_stopped();
        }
    }

    /// Request a stop and wait until `stopped` has been published.
    ///
    /// Must not be awaited from inside a handler or listener of this engine;
    /// use `request_stop` there.
    pub async fn stop(&self) {
        self.request_stop();
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == WorkerState::Stopped).await;
    }

    async fn watch_tubes(&self, tubes: &[&str]) {
        let tubes: Vec<&str> = if tubes.is_empty() {
            self.config.tubes.iter().map(String::as_str).collect()
        } else {
            tubes.to_vec()
        };

        let mut watched = 0;
        for tube in &tubes {
            match self.client.watch(tube).await {
                Ok(count) => {
                    watched += 1;
                    debug!(worker = %self.config.id, %tube, count, "watching");
                }
                Err(e) => self.warn(Warning::new("watch", None, format!("{tube}: {e}"))),
            }
        }

        // the default tube stays when it was asked for explicitly
        if self.config.ignore_default && watched > 0 && !tubes.contains(&DEFAULT_TUBE) {
            match self.client.ignore(DEFAULT_TUBE).await {
                Ok(count) => debug!(worker = %self.config.id, tube = DEFAULT_TUBE, count, "ignored"),
                Err(e) => self.warn(Warning::new("ignore", None, format!("{DEFAULT_TUBE}: {e}"))),
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_flag.subscribe();
        let timeout = self.config.reserve_timeout();

        while !self.stop_requested() {
            self.advance(WorkerState::Reserving);

            match self.client.reserve_with_timeout(timeout).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => trace!(worker = %self.config.id, "reserve timed out"),
                Err(e) if e.is_timeout() => trace!(worker = %self.config.id, "reserve timed out"),
                Err(e) => {
                    self.warn(Warning::new("reserve", None, e.to_string()));
                    tokio::select! {
                        _ = tokio::time::sleep(RESERVE_RETRY_PAUSE) => {}
                        _ = stop_rx.wait_for(|stop| *stop) => {}
                    }
                }
            }
        }

        self.finish().await;
    }

    async fn process(&self, job: ReservedJob) {
        let id = job.id;
        let priority = job.priority.unwrap_or(LOWEST_PRIORITY);

        self.advance(WorkerState::Processing);
        debug!(worker = %self.config.id, job_id = %id, "job reserved");
        self.publish(WorkerEvent::JobReserved(id));

        let envelope = match codec::decode(id, &job.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.warn(Warning::new("decode", Some(id), e.to_string()));
                self.dispose(id, priority, Disposition::Delete).await;
                return;
            }
        };

        let Some(handler) = self.registry.get(envelope.job_type()) else {
            let message = format!("no handler for job type {:?}", envelope.job_type());
            self.warn(Warning::new("route", Some(id), message));
            self.dispose(id, priority, Disposition::Bury).await;
            return;
        };

        let result = self.dispatch(handler, envelope).await;
        debug!(worker = %self.config.id, job_id = %id, ?result, "job handled");
        self.publish(WorkerEvent::JobHandled(id));

        self.dispose(id, priority, result.disposition()).await;
    }

    /// Run the handler on its own task; an error or a panic buries the job.
    async fn dispatch(&self, handler: Arc<dyn DynHandler>, envelope: JobEnvelope) -> HandlerResult {
        let id = envelope.id();
        let ctx = JobContext::new(id, Arc::clone(&self.client));
        let payload = envelope.into_payload();

        let task = tokio::spawn(async move { handler.handle_dyn(ctx, payload).await });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.warn(Warning::new("handle", Some(id), e.to_string()));
                HandlerResult::bury()
            }
            Err(e) => {
                let message = if e.is_panic() {
                    "handler panicked"
                } else {
                    "handler task was cancelled"
                };
                self.warn(Warning::new("handle", Some(id), message));
                HandlerResult::bury()
            }
        }
    }

    async fn dispose(&self, id: JobId, priority: u32, disposition: Disposition) {
        let outcome = match disposition {
            Disposition::Delete => self.client.delete(id).await.map(|_| WorkerEvent::JobDeleted(id)),
            Disposition::Bury => self
                .client
                .bury(id, priority)
                .await
                .map(|_| WorkerEvent::JobBuried(id)),
            Disposition::Release { delay } => self
                .client
                .release(id, priority, delay)
                .await
                .map(|_| WorkerEvent::JobReleased(id)),
        };

        match outcome {
            Ok(event) => {
                debug!(worker = %self.config.id, job_id = %id, action = disposition.as_str(), "job settled");
                self.publish(event);
            }
            Err(e) => {
                self.status.lock().current_job = None;
                self.warn(Warning::new(disposition.as_str(), Some(id), e.to_string()));
            }
        }
    }

    /// The loop task died without reaching `finish`; close up on its behalf.
    async fn recover(&self, e: tokio::task::JoinError) {
        let message = if e.is_panic() {
            "worker loop panicked"
        } else {
            "worker loop was cancelled"
        };
        error!(worker = %self.config.id, "{message}");
        self.stop_flag.send_replace(true);
        self.status.lock().current_job = None;
        self.warn(Warning::new("run", None, message));
        self.finish().await;
    }

    async fn finish(&self) {
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Stopped {
                false
            } else {
                *state = WorkerState::Stopping;
                true
            }
        });

        if let Err(e) = self.client.quit().await {
            warn!(worker = %self.config.id, error = %e, "quit failed");
        }
        self.mark_stopped();
    }

    fn mark_stopped(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(WorkerState::Stopped);
        info!(worker = %self.config.id, "stopped");
        self.publish(WorkerEvent::Stopped);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_flag.borrow()
    }

    /// Move to `to` unless a stop is underway.
    fn advance(&self, to: WorkerState) {
        self.state.send_if_modified(|state| {
            if state.is_shutting_down() || *state == to {
                false
            } else {
                *state = to;
                true
            }
        });
    }

    fn publish(&self, event: WorkerEvent) {
        self.status.lock().record(&event);
        self.events.publish(&event);
    }

    fn warn(&self, warning: Warning) {
        warn!(
            worker = %self.config.id,
            job_id = warning.job_id.map(JobId::get),
            operation = warning.operation,
            error = %warning.message,
            "transient error"
        );
        self.publish(WorkerEvent::Warning(warning));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProtocolError;
    use crate::impls::{InMemoryClient, InMemoryServer};
    use crate::typed::{Handler, HandlerError, Job};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use crate::ports::{JobStats, PeekedJob};
    use std::collections::VecDeque;
    use std::sync::Weak;
    use tokio::sync::{Notify, mpsc};

    const TUBE: &str = "testtube";
    const TTR: Duration = Duration::from_secs(60);

    #[derive(Debug, Serialize, Deserialize)]
    struct Reverse {
        words: String,
        #[serde(default)]
        trigger: Option<String>,
    }

    impl Job for Reverse {
        const TYPE: &'static str = "reverse";
    }

    /// Reports the reversed words, then answers with the payload's trigger.
    struct ReverseHandler {
        results: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Handler<Reverse> for ReverseHandler {
        async fn handle(&self, _ctx: JobContext, job: Reverse) -> Result<HandlerResult, HandlerError> {
            let reversed: Vec<&str> = job.words.split(' ').rev().collect();
            let _ = self.results.send(reversed.join(" "));
            Ok(HandlerResult::from_tag(job.trigger.as_deref().unwrap_or("success"), None))
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct LongAsync {}

    impl Job for LongAsync {
        const TYPE: &'static str = "longasync";
    }

    struct LongAsyncHandler;

    #[async_trait]
    impl Handler<LongAsync> for LongAsyncHandler {
        async fn handle(&self, _ctx: JobContext, _job: LongAsync) -> Result<HandlerResult, HandlerError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(HandlerResult::success())
        }
    }

    struct Failing;

    #[async_trait]
    impl DynHandler for Failing {
        async fn handle_dyn(&self, _ctx: JobContext, _payload: Value) -> Result<HandlerResult, HandlerError> {
            Err(HandlerError::failed("disk full"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl DynHandler for Panicking {
        async fn handle_dyn(&self, _ctx: JobContext, _payload: Value) -> Result<HandlerResult, HandlerError> {
            panic!("handler bug");
        }
    }

    /// Deletes its own job, so the worker's delete finds nothing.
    struct SelfDeleting;

    #[async_trait]
    impl DynHandler for SelfDeleting {
        async fn handle_dyn(&self, ctx: JobContext, _payload: Value) -> Result<HandlerResult, HandlerError> {
            ctx.client()
                .delete(ctx.job_id())
                .await
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            Ok(HandlerResult::success())
        }
    }

    enum Scripted {
        Fail(ProtocolError),
        Panic,
    }

    /// Real in-memory connection whose reserves replay `script` first.
    struct ScriptedClient {
        inner: InMemoryClient,
        script: parking_lot::Mutex<VecDeque<Scripted>>,
        connect_gate: Option<Arc<Notify>>,
    }

    impl ScriptedClient {
        fn new(inner: InMemoryClient, script: impl IntoIterator<Item = Scripted>) -> Self {
            Self {
                inner,
                script: parking_lot::Mutex::new(script.into_iter().collect()),
                connect_gate: None,
            }
        }

        /// `connect` blocks until `gate` is notified.
        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.connect_gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl QueueClient for ScriptedClient {
        fn target(&self) -> String {
            self.inner.target()
        }

        async fn connect(&self) -> Result<(), ProtocolError> {
            if let Some(gate) = &self.connect_gate {
                gate.notified().await;
            }
            self.inner.connect().await
        }

        async fn quit(&self) -> Result<(), ProtocolError> {
            self.inner.quit().await
        }

        async fn use_tube(&self, tube: &str) -> Result<String, ProtocolError> {
            self.inner.use_tube(tube).await
        }

        async fn watch(&self, tube: &str) -> Result<usize, ProtocolError> {
            self.inner.watch(tube).await
        }

        async fn ignore(&self, tube: &str) -> Result<usize, ProtocolError> {
            self.inner.ignore(tube).await
        }

        async fn list_tubes_watched(&self) -> Result<Vec<String>, ProtocolError> {
            self.inner.list_tubes_watched().await
        }

        async fn put(
            &self,
            priority: u32,
            delay: Duration,
            ttr: Duration,
            body: Vec<u8>,
        ) -> Result<JobId, ProtocolError> {
            self.inner.put(priority, delay, ttr, body).await
        }

        async fn reserve_with_timeout(
            &self,
            timeout: Duration,
        ) -> Result<Option<ReservedJob>, ProtocolError> {
            let next = self.script.lock().pop_front();
            match next {
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::Panic) => panic!("reserve blew up"),
                None => self.inner.reserve_with_timeout(timeout).await,
            }
        }

        async fn delete(&self, id: JobId) -> Result<(), ProtocolError> {
            self.inner.delete(id).await
        }

        async fn bury(&self, id: JobId, priority: u32) -> Result<(), ProtocolError> {
            self.inner.bury(id, priority).await
        }

        async fn release(&self, id: JobId, priority: u32, delay: Duration) -> Result<(), ProtocolError> {
            self.inner.release(id, priority, delay).await
        }

        async fn touch(&self, id: JobId) -> Result<(), ProtocolError> {
            self.inner.touch(id).await
        }

        async fn peek_ready(&self) -> Result<PeekedJob, ProtocolError> {
            self.inner.peek_ready().await
        }

        async fn peek_buried(&self) -> Result<PeekedJob, ProtocolError> {
            self.inner.peek_buried().await
        }

        async fn stats_job(&self, id: JobId) -> Result<JobStats, ProtocolError> {
            self.inner.stats_job(id).await
        }
    }

    fn server_error() -> ProtocolError {
        ProtocolError::Server {
            code: "INTERNAL_ERROR".to_string(),
            message: "try again".to_string(),
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig::new("testworker")
            .with_ignore_default(true)
            .with_timeout(1)
    }

    struct Harness {
        server: InMemoryServer,
        producer: InMemoryClient,
        engine: Arc<WorkerEngine>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        results: mpsc::UnboundedReceiver<String>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_server(InMemoryServer::new()).await
        }

        async fn with_server(server: InMemoryServer) -> Self {
            let client = Arc::new(server.client());
            Self::with_client(server, client).await
        }

        async fn with_client(server: InMemoryServer, client: Arc<dyn QueueClient>) -> Self {
            let producer = server.client();
            producer.connect().await.unwrap();
            producer.use_tube(TUBE).await.unwrap();

            let (tx, results) = mpsc::unbounded_channel();
            let mut registry = HandlerRegistry::new();
            registry.register::<Reverse, _>(ReverseHandler { results: tx }).unwrap();
            registry.register::<LongAsync, _>(LongAsyncHandler).unwrap();
            registry.insert("failing", Arc::new(Failing)).unwrap();
            registry.insert("panicking", Arc::new(Panicking)).unwrap();
            registry.insert("self_deleting", Arc::new(SelfDeleting)).unwrap();

            let bus = Arc::new(EventBus::new());
            let events = bus.channel();
            let engine = Arc::new(WorkerEngine::new(test_config(), registry, client, bus));

            Self {
                server,
                producer,
                engine,
                events,
                results,
            }
        }

        async fn started(server: InMemoryServer) -> Self {
            let mut h = Self::with_server(server).await;
            h.engine.start(&[TUBE, "unused"]).await.unwrap();
            assert_eq!(h.next("started").await, WorkerEvent::Started);
            h
        }

        async fn put(&self, body: Value) -> JobId {
            self.put_raw(body.to_string().into_bytes(), TTR).await
        }

        async fn put_raw(&self, body: Vec<u8>, ttr: Duration) -> JobId {
            self.producer.put(0, Duration::ZERO, ttr, body).await.unwrap()
        }

        /// Skip events until one named `name` arrives.
        async fn next(&mut self, name: &str) -> WorkerEvent {
            let wait = async {
                loop {
                    let event = self.events.recv().await.expect("event bus closed");
                    if event.name() == name {
                        return event;
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(30), wait)
                .await
                .unwrap_or_else(|_| panic!("no {name} event"))
        }

        /// Every event published for `id`, up to and including the terminal one.
        async fn trail(&mut self, id: JobId) -> Vec<&'static str> {
            let mut names = Vec::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(30), self.events.recv())
                    .await
                    .expect("job never settled")
                    .expect("event bus closed");
                if event.job_id() != Some(id) {
                    continue;
                }
                names.push(event.name());
                if event.is_terminal() {
                    return names;
                }
            }
        }

        async fn result(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(30), self.results.recv())
                .await
                .expect("handler never reported")
                .expect("handler dropped")
        }
    }

    #[tokio::test]
    async fn exposes_configuration() {
        let config = WorkerConfig::new("testworker").with_target("example.com", 3000);
        let engine = WorkerEngine::new(
            config,
            HandlerRegistry::new(),
            Arc::new(InMemoryServer::new().client()),
            Arc::new(EventBus::new()),
        );

        assert_eq!(engine.id(), "testworker");
        assert_eq!(engine.host(), "example.com");
        assert_eq!(engine.port(), 3000);
        assert_eq!(engine.timeout(), 10);
        assert_eq!(engine.state(), WorkerState::Idle);

        let engine = WorkerEngine::new(
            WorkerConfig::new("testworker").with_timeout(20),
            HandlerRegistry::new(),
            Arc::new(InMemoryServer::new().client()),
            Arc::new(EventBus::new()),
        );
        assert_eq!(engine.timeout(), 20);
    }

    #[tokio::test]
    async fn refused_connection_publishes_error() {
        let mut h = Harness::with_server(InMemoryServer::new()).await;
        let engine = Arc::new(WorkerEngine::new(
            WorkerConfig::new("fail").with_target("127.0.0.1", 5000),
            HandlerRegistry::new(),
            Arc::new(InMemoryServer::unreachable("127.0.0.1:5000").client()),
            Arc::clone(h.engine.events()),
        ));

        let err = engine.start(&[]).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Connect { source: ProtocolError::ConnectionRefused(_), .. }
        ));

        match h.events.try_recv().unwrap() {
            WorkerEvent::Error { code, .. } => assert_eq!(code, "ECONNREFUSED"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.events.try_recv().is_err(), "nothing after error");
        assert_eq!(engine.state(), WorkerState::Idle);
        assert!(!engine.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn start_watches_tubes_and_stop_cleans_up() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let watched = h.engine.client().list_tubes_watched().await.unwrap();
        assert_eq!(watched.len(), 2);
        assert!(watched.iter().any(|t| t == TUBE));
        assert!(!watched.iter().any(|t| t == DEFAULT_TUBE));

        h.engine.stop().await;
        assert_eq!(h.next("stopped").await, WorkerEvent::Stopped);
        assert!(h.engine.is_stopped());
        assert_eq!(h.engine.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn default_tube_kept_without_ignore_default() {
        let server = InMemoryServer::new();
        let engine = Arc::new(WorkerEngine::new(
            WorkerConfig::new("w").with_timeout(1).with_tubes([TUBE]),
            HandlerRegistry::new(),
            Arc::new(server.client()),
            Arc::new(EventBus::new()),
        ));

        engine.start(&[]).await.unwrap();
        let watched = engine.client().list_tubes_watched().await.unwrap();
        assert_eq!(watched, vec![DEFAULT_TUBE.to_string(), TUBE.to_string()]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_before_start_publishes_stopped_once() {
        let mut h = Harness::new().await;

        h.engine.stop().await;
        h.engine.stop().await;

        assert_eq!(h.events.try_recv().unwrap(), WorkerEvent::Stopped);
        assert!(h.events.try_recv().is_err());
        assert!(h.engine.is_stopped());
        assert!(matches!(h.engine.start(&[]).await, Err(WorkerError::AlreadyStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let h = Harness::started(InMemoryServer::new()).await;
        assert!(matches!(h.engine.start(&[TUBE]).await, Err(WorkerError::AlreadyStarted)));
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_jobs_are_deleted() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h.put(json!({"format": "bad"})).await;
        assert_eq!(h.trail(id).await, ["job.reserved", "warning", "job.deleted"]);

        let id = h.put_raw(b"{ I am invalid JSON".to_vec(), TTR).await;
        assert_eq!(h.trail(id).await, ["job.reserved", "warning", "job.deleted"]);

        assert_eq!(h.producer.peek_ready().await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(h.server.job_count().await, 0);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_type_is_buried() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h.put(json!({"type": "unknown", "payload": "extremely important!"})).await;
        assert_eq!(h.trail(id).await, ["job.reserved", "warning", "job.buried"]);

        let buried = h.producer.peek_buried().await.unwrap();
        assert_eq!(buried.id, id);
        h.producer.delete(id).await.unwrap();
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn good_jobs_reach_their_handler() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h
            .put(json!({"type": "reverse", "payload": {"words": "success yo", "trigger": "success"}}))
            .await;
        assert_eq!(h.result().await, "yo success");
        assert_eq!(h.trail(id).await, ["job.reserved", "job.handled", "job.deleted"]);

        let status = h.engine.status();
        assert_eq!(status.counts.reserved, 1);
        assert_eq!(status.counts.handled, 1);
        assert_eq!(status.counts.deleted, 1);
        assert_eq!(status.current_job, None);
        assert!(status.started_at.is_some());
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_array_jobs_are_unwrapped() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h
            .put(json!(["stalker", {"type": "reverse", "payload": {"words": "not important", "trigger": "success"}}]))
            .await;
        assert_eq!(h.next("job.deleted").await, WorkerEvent::JobDeleted(id));
        assert_eq!(h.result().await, "important not");
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bury_result_buries_the_job() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h
            .put(json!({"type": "reverse", "payload": {"words": "bury", "trigger": "bury"}}))
            .await;
        assert_eq!(h.trail(id).await, ["job.reserved", "job.handled", "job.buried"]);

        assert_eq!(h.producer.peek_buried().await.unwrap().id, id);
        h.producer.delete(id).await.unwrap();
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_ascii_payload_round_trips() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        h.put(json!({"type": "reverse", "payload": {"words": "crèmes brûlée", "trigger": "success"}}))
            .await;
        assert_eq!(h.result().await, "brûlée crèmes");
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_a_job_in_progress() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let body = json!({"type": "longasync", "payload": {"words": "ignored"}});
        let id = h.put_raw(body.to_string().into_bytes(), Duration::from_secs(30)).await;
        assert_eq!(h.next("job.reserved").await, WorkerEvent::JobReserved(id));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let before = h.engine.client().stats_job(id).await.unwrap();
        assert!(before.time_left <= 27, "time left {}", before.time_left);

        h.engine.client().touch(id).await.unwrap();
        let after = h.engine.client().stats_job(id).await.unwrap();
        assert!(after.time_left > before.time_left);

        assert_eq!(h.next("job.handled").await, WorkerEvent::JobHandled(id));
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn release_result_puts_the_job_back() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        // stop synchronously so the released job is not reserved again
        let engine: Weak<WorkerEngine> = Arc::downgrade(&h.engine);
        h.engine.events().on(move |event| {
            if let (WorkerEvent::JobReleased(_), Some(engine)) = (event, engine.upgrade()) {
                engine.request_stop();
            }
        });

        let id = h
            .put(json!({"type": "reverse", "payload": {"words": "release", "trigger": "release"}}))
            .await;
        assert_eq!(h.trail(id).await, ["job.reserved", "job.handled", "job.released"]);
        assert_eq!(h.next("stopped").await, WorkerEvent::Stopped);

        assert_eq!(h.producer.peek_ready().await.unwrap().id, id);
        h.producer.delete(id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_job_in_flight_settle() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let slow = h
            .put_raw(json!({"type": "longasync", "payload": {}}).to_string().into_bytes(), TTR)
            .await;
        assert_eq!(h.next("job.reserved").await, WorkerEvent::JobReserved(slow));
        let waiting = h.put(json!({"type": "reverse", "payload": {"words": "later"}})).await;

        h.engine.stop().await;

        let mut rest = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            rest.push(event);
        }
        assert_eq!(
            rest,
            vec![
                WorkerEvent::JobHandled(slow),
                WorkerEvent::JobDeleted(slow),
                WorkerEvent::Stopped,
            ]
        );
        assert_eq!(h.producer.peek_ready().await.unwrap().id, waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_error_buries_with_warning() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h.put(json!({"type": "failing", "payload": null})).await;
        assert_eq!(
            h.trail(id).await,
            ["job.reserved", "warning", "job.handled", "job.buried"]
        );
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_buries_and_loop_survives() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h.put(json!({"type": "panicking"})).await;
        assert_eq!(
            h.trail(id).await,
            ["job.reserved", "warning", "job.handled", "job.buried"]
        );

        h.put(json!({"type": "reverse", "payload": {"words": "still here"}})).await;
        assert_eq!(h.result().await, "here still");
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_payload_buries() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h.put(json!({"type": "reverse", "payload": {"wrong": 1}})).await;
        assert_eq!(
            h.trail(id).await,
            ["job.reserved", "warning", "job.handled", "job.buried"]
        );
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_disposition_is_a_warning() {
        let mut h = Harness::started(InMemoryServer::new()).await;

        let id = h.put(json!({"type": "self_deleting"})).await;
        assert_eq!(h.next("job.handled").await, WorkerEvent::JobHandled(id));
        match h.next("warning").await {
            WorkerEvent::Warning(w) => {
                assert_eq!(w.operation, "delete");
                assert_eq!(w.job_id, Some(id));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.engine.status().counts.deleted, 0);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_connecting_ends_stopped() {
        let server = InMemoryServer::unreachable("127.0.0.1:5000");
        let gate = Arc::new(Notify::new());
        let bus = Arc::new(EventBus::new());
        let mut events = bus.channel();
        let engine = Arc::new(WorkerEngine::new(
            test_config(),
            HandlerRegistry::new(),
            Arc::new(ScriptedClient::new(server.client(), []).gated(Arc::clone(&gate))),
            bus,
        ));

        let starting = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.start(&[TUBE]).await }
        });
        let mut states = engine.subscribe_state();
        states.wait_for(|s| *s == WorkerState::Connecting).await.unwrap();

        engine.request_stop();
        assert_eq!(engine.state(), WorkerState::Stopping);
        gate.notify_one();

        assert!(matches!(starting.await.unwrap(), Err(WorkerError::Connect { .. })));
        engine.stop().await;
        assert!(engine.is_stopped());
        assert_eq!(engine.state(), WorkerState::Stopped);
        assert_eq!(events.try_recv().unwrap().name(), "error");
        assert_eq!(events.try_recv().unwrap(), WorkerEvent::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_errors_are_warnings_and_the_loop_continues() {
        let server = InMemoryServer::new();
        let client = ScriptedClient::new(
            server.client(),
            [Scripted::Fail(server_error()), Scripted::Fail(server_error())],
        );
        let mut h = Harness::with_client(server, Arc::new(client)).await;
        h.engine.start(&[TUBE]).await.unwrap();
        assert!(h.engine.state().is_running());

        for _ in 0..2 {
            match h.next("warning").await {
                WorkerEvent::Warning(w) => {
                    assert_eq!(w.operation, "reserve");
                    assert_eq!(w.job_id, None);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        h.put(json!({"type": "reverse", "payload": {"words": "back again"}})).await;
        assert_eq!(h.result().await, "again back");
        assert_eq!(h.engine.status().counts.warnings, 2);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_the_retry_pause_short() {
        let server = InMemoryServer::new();
        let client = ScriptedClient::new(server.client(), (0..100).map(|_| Scripted::Fail(server_error())));
        let mut h = Harness::with_client(server, Arc::new(client)).await;
        h.engine.start(&[TUBE]).await.unwrap();
        h.next("warning").await;

        let began = tokio::time::Instant::now();
        h.engine.stop().await;
        assert!(began.elapsed() < RESERVE_RETRY_PAUSE);
        assert!(h.engine.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_reserve_is_not_a_warning() {
        let server = InMemoryServer::new();
        let client = ScriptedClient::new(
            server.client(),
            [Scripted::Fail(ProtocolError::TimedOut), Scripted::Fail(ProtocolError::TimedOut)],
        );
        let mut h = Harness::with_client(server, Arc::new(client)).await;
        h.engine.start(&[TUBE]).await.unwrap();

        let id = h.put(json!({"type": "reverse", "payload": {"words": "on time"}})).await;
        assert_eq!(h.result().await, "time on");
        assert_eq!(h.trail(id).await, ["job.reserved", "job.handled", "job.deleted"]);
        assert_eq!(h.engine.status().counts.warnings, 0);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_loop_still_reaches_stopped() {
        let server = InMemoryServer::new();
        let client = ScriptedClient::new(server.client(), [Scripted::Panic]);
        let mut h = Harness::with_client(server, Arc::new(client)).await;
        h.engine.start(&[TUBE]).await.unwrap();

        match h.next("warning").await {
            WorkerEvent::Warning(w) => assert_eq!(w.operation, "run"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.next("stopped").await, WorkerEvent::Stopped);

        tokio::time::timeout(Duration::from_secs(5), h.engine.stop())
            .await
            .expect("stop hung after the loop died");
        assert!(h.engine.is_stopped());
        assert_eq!(h.engine.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_watch_is_a_warning_and_start_goes_on() {
        let mut h = Harness::new().await;
        h.engine.start(&["", TUBE]).await.unwrap();

        match h.events.try_recv().unwrap() {
            WorkerEvent::Warning(w) => {
                assert_eq!(w.operation, "watch");
                assert_eq!(w.job_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.events.try_recv().unwrap(), WorkerEvent::Started);

        let watched = h.engine.client().list_tubes_watched().await.unwrap();
        assert_eq!(watched, vec![TUBE.to_string()]);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_default_tube_survives_ignore_default() {
        let h = Harness::new().await;
        h.engine.start(&[DEFAULT_TUBE, TUBE]).await.unwrap();

        let watched = h.engine.client().list_tubes_watched().await.unwrap();
        assert_eq!(watched, vec![DEFAULT_TUBE.to_string(), TUBE.to_string()]);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn default_tube_kept_when_every_watch_fails() {
        let mut h = Harness::new().await;
        h.engine.start(&[""]).await.unwrap();
        assert_eq!(h.next("started").await, WorkerEvent::Started);

        let watched = h.engine.client().list_tubes_watched().await.unwrap();
        assert_eq!(watched, vec![DEFAULT_TUBE.to_string()]);
        assert_eq!(h.engine.status().counts.warnings, 1);
        h.engine.stop().await;
    }
}
