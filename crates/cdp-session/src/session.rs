//! The protocol session engine: id allocation, pending-call correlation,
//! inbound routing in wire order, and the forward-only lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdp_wire::{parse_message, CallId, Command, CommandResponse, Envelope, Message};

use crate::config::SessionConfig;
use crate::correlation::{CorrelationTable, FailureCause};
use crate::error::SessionError;
use crate::events::{EventDispatcher, SubscriptionHandle};
use crate::metrics;
use crate::transport::Transport;

/// Lifecycle of one session. Transitions only ever move forward; a closed
/// session is never reopened — build a new [`Session`] to reconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Connecting => 0,
            SessionState::Open => 1,
            SessionState::Closing => 2,
            SessionState::Closed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

enum WorkerPool {
    Unstarted,
    Owned(Runtime),
    External(Handle),
    Terminated,
}

/// One logical connection lifetime to a DevTools endpoint.
///
/// All commands share the session's transport, id counter and worker pool.
/// The message pump routes every inbound frame in strict wire arrival order:
/// replies complete their pending call, events fan out to subscribers, and
/// malformed frames are logged and dropped without disturbing anything else.
pub struct Session {
    cfg: SessionConfig,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: CorrelationTable,
    dispatcher: EventDispatcher,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
    workers: StdMutex<WorkerPool>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build a session that owns a worker pool sized by `cfg`.
    pub fn new(cfg: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self::build(cfg, transport, WorkerPool::Unstarted)
    }

    /// Build a session that runs its pump and event callbacks on `handle`
    /// instead of an owned pool.
    pub fn with_executor(
        cfg: SessionConfig,
        transport: Arc<dyn Transport>,
        handle: Handle,
    ) -> Self {
        Self::build(cfg, transport, WorkerPool::External(handle))
    }

    fn build(cfg: SessionConfig, transport: Arc<dyn Transport>, pool: WorkerPool) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        Self {
            cfg,
            transport,
            next_id: AtomicU64::new(1),
            pending: CorrelationTable::new(),
            dispatcher: EventDispatcher::new(),
            state_tx,
            state_rx,
            shutdown: CancellationToken::new(),
            workers: StdMutex::new(pool),
            pump: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Watch lifecycle transitions. This is also where connection loss is
    /// reported: the state moves to Closing and then Closed without a
    /// `close` call.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Allocate the next command id: strictly increasing, never reused for
    /// the lifetime of this session.
    pub fn next_call_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Establish the connection and start the message pump. `Ok` means the
    /// session reached `Open`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Open => return Ok(()),
            SessionState::Connecting => {}
            SessionState::Closing | SessionState::Closed => {
                return Err(SessionError::NotConnected)
            }
        }

        let handle = self.worker_handle()?;

        let started = match self.cfg.connect_timeout() {
            Some(deadline) => match timeout(deadline, self.transport.start()).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::ConnectTimeout(deadline)),
            },
            None => self.transport.start().await,
        };

        if let Err(err) = started {
            warn!(target: "cdp-session", ?err, "handshake failed");
            self.finish_close();
            return Err(err);
        }

        if !self.advance(SessionState::Connecting, SessionState::Open) {
            if self.state() == SessionState::Open {
                // Lost a benign race against another connect call.
                return Ok(());
            }
            // A concurrent close won during the handshake.
            self.transport.close().await;
            return Err(SessionError::NotConnected);
        }

        self.spawn_pump(&handle);
        info!(target: "cdp-session", "session open");
        Ok(())
    }

    /// Validate, send, and decode one typed command.
    pub async fn execute<C: Command>(
        &self,
        command: C,
    ) -> Result<CommandResponse<C::Response>, SessionError> {
        let method = command.method_name();
        command
            .validate()
            .map_err(|reason| SessionError::InvalidParams {
                method: method.to_string(),
                reason,
            })?;
        let params = serde_json::to_value(&command).map_err(cdp_wire::CodecError::from)?;
        let raw = self.execute_raw(method, params).await?;
        let result = serde_json::from_value(raw.result).map_err(cdp_wire::CodecError::from)?;
        Ok(CommandResponse {
            id: raw.id,
            method: raw.method,
            result,
        })
    }

    /// Send one command and wait for its reply.
    ///
    /// The returned future resolves exactly once: with the reply payload,
    /// with the remote's error object, or with `Closed` if teardown wins the
    /// race. There is no deadline here; callers wanting one wrap the future
    /// themselves.
    pub async fn execute_raw(
        &self,
        method: &str,
        params: Value,
    ) -> Result<CommandResponse<Value>, SessionError> {
        if self.state() != SessionState::Open {
            return Err(SessionError::NotConnected);
        }

        let id = self.next_call_id();
        let text = Envelope::new(id, method, params).encode()?;

        let rx = self.pending.register(id)?;
        metrics::record_command(method);
        let started = Instant::now();
        debug!(target: "cdp-session", %id, method = %method, "sending command");

        if let Err(err) = self.transport.send_text(text).await {
            self.pending.discard(id);
            metrics::record_command_failure(method);
            return Err(err);
        }

        // A close may have raced the send; reclaim the slot if the drain
        // already ran so this caller cannot wait on a reply nobody will
        // route.
        if self.state() != SessionState::Open && self.pending.discard(id).is_some() {
            metrics::record_command_failure(method);
            return Err(SessionError::Closed { id });
        }

        match rx.await {
            Ok(Ok(result)) => {
                metrics::record_command_success(method, started.elapsed());
                Ok(CommandResponse {
                    id,
                    method: method.to_string(),
                    result,
                })
            }
            Ok(Err(FailureCause::Protocol(error))) => {
                metrics::record_command_failure(method);
                Err(SessionError::Protocol {
                    id,
                    code: error.code,
                    message: error.message,
                    data: error.data,
                })
            }
            Ok(Err(FailureCause::SessionClosed)) | Err(_) => {
                metrics::record_command_failure(method);
                Err(SessionError::Closed { id })
            }
        }
    }

    /// Register `callback` for every event named `method`.
    ///
    /// Callbacks run on the pump task in wire arrival order; anything that
    /// could block belongs on another task, spawned from the callback.
    pub fn subscribe<F>(&self, method: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(method, callback)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.dispatcher.unsubscribe(handle)
    }

    /// Request teardown and wait for it to finish. Idempotent; concurrent
    /// callers all return once the session reaches `Closed`.
    pub async fn close(&self) {
        if self.begin_close() {
            self.teardown().await;
        } else {
            self.closed().await;
        }
    }

    /// Non-blocking close; observe completion through [`state_changes`].
    ///
    /// [`state_changes`]: Session::state_changes
    pub fn close_async(self: &Arc<Self>) {
        if !self.begin_close() {
            return;
        }
        match self.worker_handle() {
            Ok(handle) => {
                let session = Arc::clone(self);
                let _task = handle.spawn(async move {
                    session.teardown().await;
                });
            }
            Err(_) => {
                // No pool to run teardown on; the transport was never
                // started, so failing the table and flipping the state is
                // all that is left to do.
                self.shutdown.cancel();
                self.pending.drain();
                self.finish_close();
            }
        }
    }

    /// Number of commands still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == from && to.rank() > state.rank() {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Claim teardown ownership. Exactly one caller wins per session.
    fn begin_close(&self) -> bool {
        self.state_tx.send_if_modified(|state| match *state {
            SessionState::Connecting | SessionState::Open => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        })
    }

    async fn teardown(&self) {
        self.shutdown.cancel();
        self.transport.close().await;
        let drained = self.pending.drain();
        if drained > 0 {
            info!(target: "cdp-session", drained, "failed outstanding calls on close");
        }
        self.finish_close();
    }

    fn finish_close(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        info!(target: "cdp-session", "session closed");
        self.shutdown_workers();
    }

    async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == SessionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn_pump(self: &Arc<Self>, handle: &Handle) {
        let session = Arc::clone(self);
        let task = handle.spawn(async move {
            debug!(target: "cdp-session", "message pump started");
            loop {
                tokio::select! {
                    _ = session.shutdown.cancelled() => break,
                    message = session.transport.next_message() => match message {
                        Some(text) => session.route_inbound(&text),
                        None => {
                            warn!(target: "cdp-session", "connection lost");
                            if session.begin_close() {
                                session.teardown().await;
                            }
                            break;
                        }
                    }
                }
            }
            debug!(target: "cdp-session", "message pump exiting");
        });
        *self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Classify one inbound frame and route it. Nothing here blocks: a reply
    /// is an atomic remove plus a oneshot send, an event is a snapshot
    /// dispatch, and malformed text is dropped.
    fn route_inbound(&self, text: &str) {
        match parse_message(text) {
            Ok(Message::Response(reply)) => {
                let id = reply.id;
                let outcome = reply.into_outcome().map_err(FailureCause::Protocol);
                if !self.pending.complete(id, outcome) {
                    debug!(target: "cdp-session", %id, "reply with no pending call dropped");
                    metrics::record_dropped();
                }
            }
            Ok(Message::Event(event)) => {
                metrics::record_event();
                self.dispatcher.dispatch(&event.method, &event.params);
            }
            Err(err) => {
                warn!(target: "cdp-session", ?err, "malformed inbound message dropped");
                metrics::record_dropped();
            }
        }
    }

    fn worker_handle(&self) -> Result<Handle, SessionError> {
        let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*guard, WorkerPool::Unstarted) {
            let runtime = RuntimeBuilder::new_multi_thread()
                .worker_threads(self.cfg.worker_threads.max(1))
                .thread_name("cdp-session-worker")
                .enable_all()
                .build()
                .map_err(|err| SessionError::transport(format!("worker pool: {err}")))?;
            *guard = WorkerPool::Owned(runtime);
        }
        match &*guard {
            WorkerPool::Owned(runtime) => Ok(runtime.handle().clone()),
            WorkerPool::External(handle) => Ok(handle.clone()),
            WorkerPool::Unstarted | WorkerPool::Terminated => Err(SessionError::NotConnected),
        }
    }

    fn shutdown_workers(&self) {
        if !self.cfg.own_executor {
            return;
        }
        let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*guard, WorkerPool::Owned(_)) {
            if let WorkerPool::Owned(runtime) =
                std::mem::replace(&mut *guard, WorkerPool::Terminated)
            {
                // shutdown_background never blocks, so this is safe from
                // async contexts, including the pool's own tasks.
                runtime.shutdown_background();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let WorkerPool::Owned(runtime) = std::mem::replace(&mut *guard, WorkerPool::Terminated)
        {
            runtime.shutdown_background();
        }
    }
}
