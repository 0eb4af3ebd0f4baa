//! Connection lifecycle manager
//!
//! `StreamClient::run` owns the physical connection and loops through
//! dial, optional login, resubscribe and streaming until the client is
//! closed. The read loop is the only reader of the socket. Writes come from
//! any task and are serialized through one coarse lock that also guards the
//! desired subscription set, each bounded by the write timeout.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pushfeed_book::BookSnapshot;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{AuthError, Credentials};
use crate::backoff::Backoff;
use crate::books::BookManager;
use crate::config::{ClientConfig, Endpoint};
use crate::dispatch::{
    DispatchError, PanicReporter, Pipeline, RawTask, Runner, TypedTask,
};
use crate::error::ClientError;
use crate::frame::{
    Arg, Command, EventFrame, Frame, OpReply, PushFrame, EVENT_ERROR, EVENT_LOGIN,
    EVENT_SUBSCRIBE, EVENT_UNSUBSCRIBE,
};
use crate::handlers::Handlers;
use crate::metrics::ClientMetrics;
use crate::orders::{self, AmendOrder, CancelOrder, PlaceOrder};
use crate::registry::{Registry, WaitKind};
use crate::rest::{self, HttpRestClient, RestApi};
use crate::shutdown;
use crate::subscription::DesiredSet;
use crate::topics::TopicKind;
use crate::transport::{Dialer, TungsteniteDialer, WsStream};

/// Text heartbeat the server answers with `pong`.
const PING_TEXT: &str = "ping";
const PONG_TEXT: &str = "pong";

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// State behind the coarse lock.
struct Shared {
    desired: DesiredSet,
    writer: Option<WsSink>,
    /// Set once login is done and the desired set has been replayed on the
    /// current connection. Topic changes and ops are only written while set.
    streaming: bool,
}

impl Shared {
    fn disconnect(&mut self) -> Option<WsSink> {
        self.streaming = false;
        self.writer.take()
    }
}

/// Why a session ended without an error.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Reconnect(&'static str),
}

struct Pipelines {
    raw: Pipeline<RawTask>,
    typed: Pipeline<TypedTask>,
}

struct Inner {
    config: ClientConfig,
    credentials: Option<Credentials>,
    dialer: Arc<dyn Dialer>,
    rest: Option<Arc<dyn RestApi>>,
    handlers: Handlers,
    registry: Registry,
    books: BookManager,
    metrics: ClientMetrics,
    shared: Mutex<Shared>,
    next_id: AtomicU64,
    /// Server clock minus local clock, applied to login timestamps
    clock_offset_ms: AtomicI64,
    connected: AtomicBool,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

/// Builder for [`StreamClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    credentials: Option<Credentials>,
    dialer: Option<Arc<dyn Dialer>>,
    rest: Option<Arc<dyn RestApi>>,
}

impl ClientBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn rest(mut self, rest: Arc<dyn RestApi>) -> Self {
        self.rest = Some(rest);
        self
    }

    pub fn build(self) -> Result<StreamClient, ClientError> {
        self.config.validate()?;

        let rest = match self.rest {
            Some(rest) => Some(rest),
            None if self.config.sync_server_time => {
                let client = HttpRestClient::new(
                    self.config.rest_url.clone(),
                    self.credentials.clone(),
                    self.config.simulated,
                )?;
                Some(Arc::new(client) as Arc<dyn RestApi>)
            }
            None => None,
        };

        let (shutdown_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        let metrics = ClientMetrics::new(self.config.endpoint.label());

        Ok(StreamClient {
            inner: Arc::new(Inner {
                credentials: self.credentials,
                dialer: self.dialer.unwrap_or_else(|| Arc::new(TungsteniteDialer)),
                rest,
                handlers: Handlers::new(),
                registry: Registry::new(),
                books: BookManager::new(),
                metrics,
                shared: Mutex::new(Shared {
                    desired: DesiredSet::new(),
                    writer: None,
                    streaming: false,
                }),
                next_id: AtomicU64::new(0),
                clock_offset_ms: AtomicI64::new(0),
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown_tx,
                closed_tx,
                config: self.config,
            }),
        })
    }
}

/// Streaming client handle. Clones share one connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("url", &self.inner.config.url())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl StreamClient {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            credentials: None,
            dialer: None,
            rest: None,
        }
    }

    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Callback slots; handlers may be installed or replaced at any time.
    pub fn handlers(&self) -> &Handlers {
        &self.inner.handlers
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Current verified state of a book subscription.
    pub fn book(&self, arg: &Arg) -> Option<BookSnapshot> {
        self.inner.books.snapshot(arg)
    }

    /// Topics that will be replayed on the next connect.
    pub async fn subscriptions(&self) -> Vec<Arg> {
        self.inner.shared.lock().await.desired.snapshot()
    }

    /// Run the connection until [`close`](Self::close) is called.
    ///
    /// Transport failures are retried with backoff and reported through the
    /// error handler. Missing credentials for a private endpoint fail before
    /// any network I/O. Once `run` has returned it may be called again; after
    /// `close` it returns immediately.
    pub async fn run(&self) -> Result<(), ClientError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ClientError::InvalidArgument(
                "client is already running".to_string(),
            ));
        }
        self.inner.closed_tx.send_replace(false);

        let result = self.inner.run().await;
        self.inner.running.store(false, Ordering::Release);
        self.inner.closed_tx.send_replace(true);
        result
    }

    /// Stop the run loop, close the socket and fail outstanding waiters.
    pub async fn close(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        info!(endpoint = self.inner.metrics.endpoint(), "closing client");

        let writer = self.inner.shared.lock().await.disconnect();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(self.inner.config.write_timeout(), writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "close frame failed"),
                Err(_) => debug!("close frame timed out"),
            }
        }
        self.inner.registry.fail_all("client closed");

        if !self.inner.running.load(Ordering::Acquire) {
            self.inner.closed_tx.send_replace(true);
        }
    }

    /// Resolves once the run loop has finished.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Add topics to the desired set and subscribe if connected.
    pub async fn subscribe(&self, args: &[Arg]) -> Result<(), ClientError> {
        self.inner.change_subscriptions(WaitKind::Subscribe, args).await?;
        Ok(())
    }

    /// Subscribe and wait until every topic is acknowledged.
    pub async fn subscribe_and_wait(
        &self,
        args: &[Arg],
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.inner
            .change_subscriptions_and_wait(WaitKind::Subscribe, args, timeout)
            .await
    }

    pub async fn unsubscribe(&self, args: &[Arg]) -> Result<(), ClientError> {
        self.inner
            .change_subscriptions(WaitKind::Unsubscribe, args)
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_and_wait(
        &self,
        args: &[Arg],
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.inner
            .change_subscriptions_and_wait(WaitKind::Unsubscribe, args, timeout)
            .await
    }

    /// Send a command op and wait for its reply.
    pub async fn send_op(
        &self,
        op: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<OpReply, ClientError> {
        let id = self.inner.next_id();
        let pending = self.inner.registry.register_op(id.clone())?;
        self.inner
            .write_streaming(&Command::op(id, op, args))
            .await?;
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        pending.wait(timeout, &mut shutdown_rx).await
    }

    pub async fn place_orders(
        &self,
        orders: &[PlaceOrder],
        timeout: Duration,
    ) -> Result<OpReply, ClientError> {
        let (op, args) = orders::prepare(orders)?;
        self.send_op(op, args, timeout).await
    }

    pub async fn cancel_orders(
        &self,
        orders: &[CancelOrder],
        timeout: Duration,
    ) -> Result<OpReply, ClientError> {
        let (op, args) = orders::prepare(orders)?;
        self.send_op(op, args, timeout).await
    }

    pub async fn amend_orders(
        &self,
        orders: &[AmendOrder],
        timeout: Duration,
    ) -> Result<OpReply, ClientError> {
        let (op, args) = orders::prepare(orders)?;
        self.send_op(op, args, timeout).await
    }
}

impl Inner {
    fn next_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn endpoint(&self) -> &str {
        self.metrics.endpoint()
    }

    /// Credentials to log in with, if this endpoint logs in at all.
    fn login_credentials(&self) -> Option<&Credentials> {
        match self.config.endpoint {
            Endpoint::Public => None,
            _ => self.credentials.as_ref(),
        }
    }

    /// Hand an error to the error handler, containing any panic.
    fn report(&self, err: &ClientError) {
        if let Some(handler) = self.handlers.error() {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                error!(endpoint = self.endpoint(), "error handler panicked");
                self.metrics.inc_callback_panic("error");
            }
        }
    }

    fn pipelines(self: &Arc<Self>) -> Pipelines {
        let dispatch = &self.config.dispatch;
        let shutdown_rx = self.shutdown_tx.subscribe();

        let reporter: PanicReporter = {
            let inner = Arc::downgrade(self);
            Arc::new(move |err: DispatchError| {
                if let Some(inner) = inner.upgrade() {
                    inner.report(&ClientError::Dispatch(err));
                }
            })
        };

        let raw_runner: Runner<RawTask> = {
            let inner = Arc::downgrade(self);
            Arc::new(move |RawTask(text)| {
                if let Some(handler) = inner.upgrade().and_then(|i| i.handlers.raw()) {
                    handler(&text);
                }
            })
        };

        let typed_runner: Runner<TypedTask> = {
            let inner = Arc::downgrade(self);
            Arc::new(move |task: TypedTask| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match task {
                    TypedTask::Push(kind, frame) => {
                        if let Some(handler) = inner.handlers.push(kind) {
                            handler(&frame);
                        }
                    }
                    TypedTask::Book(event) => {
                        if let Some(handler) = inner.handlers.book() {
                            handler(&event);
                        }
                    }
                }
            })
        };

        Pipelines {
            raw: Pipeline::new(
                "raw",
                dispatch.options(false),
                raw_runner,
                Arc::clone(&reporter),
                self.metrics.clone(),
                shutdown_rx.clone(),
            ),
            typed: Pipeline::new(
                "typed",
                dispatch.options(dispatch.synchronous),
                typed_runner,
                reporter,
                self.metrics.clone(),
                shutdown_rx,
            ),
        }
    }

    async fn run(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.config.endpoint.requires_login() && self.credentials.is_none() {
            error!(endpoint = self.endpoint(), "private endpoint requires credentials");
            return Err(ClientError::MissingCredentials);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let pipelines = self.pipelines();
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_floor_ms),
            Duration::from_millis(self.config.backoff_ceiling_ms),
        );

        info!(endpoint = self.endpoint(), url = %self.config.url(), "starting stream client");

        let result = loop {
            if shutdown::is_cancelled(&shutdown_rx) {
                break Ok(());
            }

            let reason = match self.session(&pipelines, &mut backoff, &mut shutdown_rx).await {
                Ok(SessionEnd::Shutdown) | Err(ClientError::Shutdown) => break Ok(()),
                Ok(SessionEnd::Reconnect(reason)) => {
                    info!(endpoint = self.endpoint(), reason, "reconnecting");
                    reason.to_string()
                }
                Err(e @ (ClientError::MissingCredentials
                | ClientError::Auth(_)
                | ClientError::Config(_))) => {
                    error!(endpoint = self.endpoint(), error = %e, "session failed permanently");
                    self.teardown("session failed").await;
                    break Err(e);
                }
                Err(e) => {
                    warn!(endpoint = self.endpoint(), error = %e, "session ended");
                    self.report(&e);
                    e.to_string()
                }
            };

            self.teardown(&reason).await;
            self.metrics.inc_reconnect();

            let delay = backoff.current();
            debug!(endpoint = self.endpoint(), delay_ms = delay.as_millis() as u64, "backing off");
            if !backoff.wait(&mut shutdown_rx).await {
                break Ok(());
            }
        };

        self.teardown("client closed").await;
        pipelines.raw.close().await;
        pipelines.typed.close().await;
        info!(endpoint = self.endpoint(), "stream client stopped");
        result
    }

    /// Drop the connection and everything tied to it.
    async fn teardown(&self, reason: &str) {
        let writer = self.shared.lock().await.disconnect();
        drop(writer);
        if self.connected.swap(false, Ordering::AcqRel) {
            self.metrics.set_disconnected();
        }
        self.registry.fail_all(reason);
        self.books.reset_all();
    }

    async fn session(
        self: &Arc<Self>,
        pipelines: &Pipelines,
        backoff: &mut Backoff,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ClientError> {
        let credentials = self.login_credentials();

        if credentials.is_some() && self.config.sync_server_time {
            if let Some(rest) = &self.rest {
                let server_ms = rest::server_time(rest.as_ref()).await?;
                let offset = server_ms - chrono::Utc::now().timestamp_millis();
                self.clock_offset_ms.store(offset, Ordering::Relaxed);
                debug!(offset_ms = offset, "synced server time");
            }
        }

        let url = self.config.url();
        let headers = self.config.handshake_headers();
        let handshake_timeout = self.config.handshake_timeout();
        let ws = tokio::select! {
            dialed = tokio::time::timeout(handshake_timeout, self.dialer.dial(&url, &headers)) => {
                match dialed {
                    Ok(ws) => ws?,
                    Err(_) => {
                        return Err(ClientError::Timeout {
                            what: "handshake",
                            timeout_ms: self.config.handshake_timeout_ms,
                        })
                    }
                }
            }
            _ = shutdown::cancelled(shutdown_rx) => return Ok(SessionEnd::Shutdown),
        };

        let (sink, mut source) = ws.split();
        self.shared.lock().await.writer = Some(sink);

        if let Some(credentials) = credentials {
            self.login(credentials, &mut source, pipelines, shutdown_rx)
                .await?;
        }

        self.resubscribe().await?;

        backoff.reset();
        self.connected.store(true, Ordering::Release);
        self.metrics.set_connected();
        info!(endpoint = self.endpoint(), "streaming");

        self.read_loop(&mut source, pipelines, shutdown_rx).await
    }

    async fn login(
        &self,
        credentials: &Credentials,
        source: &mut WsSource,
        pipelines: &Pipelines,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let now_ms =
            chrono::Utc::now().timestamp_millis() + self.clock_offset_ms.load(Ordering::Relaxed);
        let args = credentials.login_args(now_ms / 1000)?;
        let command = Command::op("", EVENT_LOGIN, vec![serde_json::to_value(args)?]);
        self.write_command(&command).await?;
        debug!(endpoint = self.endpoint(), "login sent");

        let deadline = tokio::time::sleep(self.config.login_timeout());
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                message = source.next() => message,
                _ = &mut deadline => {
                    return Err(ClientError::Timeout {
                        what: "login",
                        timeout_ms: self.config.login_timeout_ms,
                    })
                }
                _ = shutdown::cancelled(shutdown_rx) => return Err(ClientError::Shutdown),
            };

            let text = match message {
                None => return Err(ClientError::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(data))) => {
                    self.write_message(Message::Pong(data)).await?;
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(endpoint = self.endpoint(), frame = ?frame, "closed during login");
                    return Err(ClientError::ConnectionClosed);
                }
                Some(Ok(_)) => continue,
            };

            if self.handlers.has_raw() {
                pipelines.raw.submit(RawTask(text.clone())).await?;
            }

            match Frame::parse(&text) {
                Ok(Frame::Event(event)) if event.event == EVENT_LOGIN => {
                    if event.code.is_empty() || event.code == "0" {
                        info!(endpoint = self.endpoint(), conn_id = %event.conn_id, "logged in");
                        return Ok(());
                    }
                    return Err(AuthError::Rejected {
                        code: event.code,
                        msg: event.msg,
                    }
                    .into());
                }
                Ok(Frame::Event(event)) if event.event == EVENT_ERROR && event.id.is_empty() => {
                    return Err(AuthError::Rejected {
                        code: event.code,
                        msg: event.msg,
                    }
                    .into());
                }
                Ok(other) => trace!(frame = ?other, "frame before login completed"),
                Err(e) => debug!(error = %e, "unparseable frame during login"),
            }
        }
    }

    /// Send one subscribe for the whole desired set and wait for its acks in
    /// the background. From here on topic changes go straight to the socket.
    async fn resubscribe(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut shared = self.shared.lock().await;
        shared.streaming = true;
        if shared.desired.is_empty() {
            return Ok(());
        }
        let args = shared.desired.snapshot();
        let id = self.next_id();
        let pending = self
            .registry
            .register_ack(id.clone(), WaitKind::Subscribe, &args)?;
        let command = Command::subscribe(id, &args)?;
        self.write_locked(&mut shared, Message::Text(command.to_text()?))
            .await?;
        drop(shared);
        info!(endpoint = self.endpoint(), topics = args.len(), "resubscribed desired set");

        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let timeout = self.config.resubscribe_wait_timeout();
        tokio::spawn(async move {
            match pending.wait(timeout, &mut shutdown_rx).await {
                Ok(()) => debug!(endpoint = inner.endpoint(), "resubscribe acknowledged"),
                Err(ClientError::Shutdown) | Err(ClientError::Disconnected(_)) => {}
                Err(e) => {
                    warn!(endpoint = inner.endpoint(), error = %e, "resubscribe not acknowledged");
                    inner.report(&e);
                }
            }
        });
        Ok(())
    }

    async fn read_loop(
        &self,
        source: &mut WsSource,
        pipelines: &Pipelines,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ClientError> {
        let read_timeout = self.config.read_timeout();
        let heartbeat = self.config.heartbeat_interval();
        let mut last_inbound = Instant::now();
        let mut last_ping: Option<Instant> = None;

        loop {
            let read_deadline = last_inbound + read_timeout;
            let heartbeat_at = heartbeat.map(|interval| {
                let quiet_since = last_ping.map_or(last_inbound, |ping| ping.max(last_inbound));
                quiet_since + interval
            });

            tokio::select! {
                _ = shutdown::cancelled(shutdown_rx) => return Ok(SessionEnd::Shutdown),
                _ = tokio::time::sleep_until(read_deadline) => {
                    return Err(ClientError::Timeout {
                        what: "read",
                        timeout_ms: self.config.read_timeout_ms,
                    });
                }
                _ = sleep_until_opt(heartbeat_at), if heartbeat_at.is_some() => {
                    trace!(endpoint = self.endpoint(), "sending heartbeat");
                    self.write_message(Message::Text(PING_TEXT.to_string())).await?;
                    last_ping = Some(Instant::now());
                }
                message = source.next() => {
                    let Some(message) = message else {
                        return Err(ClientError::ConnectionClosed);
                    };
                    last_inbound = Instant::now();
                    match message? {
                        Message::Text(text) => {
                            if let Some(end) = self.handle_text(text, pipelines).await? {
                                return Ok(end);
                            }
                        }
                        Message::Ping(data) => {
                            self.metrics.inc_frame("ping");
                            self.write_message(Message::Pong(data)).await?;
                        }
                        Message::Pong(_) => self.metrics.inc_frame("pong"),
                        Message::Close(frame) => {
                            info!(endpoint = self.endpoint(), frame = ?frame, "server closed connection");
                            return Err(ClientError::ConnectionClosed);
                        }
                        Message::Binary(data) => {
                            trace!(len = data.len(), "ignoring binary frame");
                        }
                        Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Classify and route one text frame. `Some` ends the session.
    async fn handle_text(
        &self,
        text: String,
        pipelines: &Pipelines,
    ) -> Result<Option<SessionEnd>, ClientError> {
        if text == PONG_TEXT {
            self.metrics.inc_frame("pong");
            return Ok(None);
        }

        let frame = Frame::parse(&text);
        if self.handlers.has_raw() {
            pipelines.raw.submit(RawTask(text)).await?;
        }

        match frame {
            Ok(Frame::Event(event)) => {
                self.metrics.inc_frame("event");
                Ok(self.handle_event(event))
            }
            Ok(Frame::OpReply(reply)) => {
                self.metrics.inc_frame("op_reply");
                let (id, op) = (reply.id.clone(), reply.op.clone());
                if !self.registry.notify_op(reply) {
                    debug!(id = %id, op = %op, "op reply with no waiter");
                }
                Ok(None)
            }
            Ok(Frame::Push(push)) => {
                self.metrics.inc_frame("push");
                self.handle_push(push, pipelines).await?;
                Ok(None)
            }
            Err(e) => {
                self.metrics.inc_frame("malformed");
                warn!(endpoint = self.endpoint(), error = %e, "unroutable frame");
                self.report(&e);
                Ok(None)
            }
        }
    }

    fn handle_event(&self, event: EventFrame) -> Option<SessionEnd> {
        if event.is_upgrade_notice() {
            warn!(endpoint = self.endpoint(), msg = %event.msg, "server upgrade notice");
            return Some(SessionEnd::Reconnect("server upgrade notice"));
        }

        if self.registry.notify_event(&event) {
            trace!(id = %event.id, event = %event.event, "event routed to waiter");
            return None;
        }

        match event.event.as_str() {
            EVENT_ERROR => {
                warn!(code = %event.code, msg = %event.msg, "server error event");
                self.report(&ClientError::Server {
                    code: event.code,
                    msg: event.msg,
                });
            }
            EVENT_SUBSCRIBE | EVENT_UNSUBSCRIBE | EVENT_LOGIN => {
                debug!(event = %event.event, arg = ?event.arg, "unawaited ack");
            }
            _ => {
                if let Some(handler) = self.handlers.event() {
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        error!(endpoint = self.endpoint(), "event handler panicked");
                        self.metrics.inc_callback_panic("event");
                    }
                }
            }
        }
        None
    }

    async fn handle_push(&self, push: PushFrame, pipelines: &Pipelines) -> Result<(), ClientError> {
        let kind = TopicKind::from_channel(&push.arg.channel);
        if kind != TopicKind::OrderBook {
            if self.handlers.push(kind).is_some() {
                pipelines.typed.submit(TypedTask::Push(kind, push)).await?;
            }
            return Ok(());
        }

        match self.books.apply(&push) {
            Ok(events) => {
                for event in events {
                    pipelines.typed.submit(TypedTask::Book(event)).await?;
                }
            }
            Err(e) if self.books.is_resyncing(&push.arg) && e.requires_resync() => {
                trace!(channel = %push.arg.channel, error = %e, "awaiting resync snapshot");
            }
            Err(e) => {
                warn!(
                    endpoint = self.endpoint(),
                    channel = %push.arg.channel,
                    inst_id = ?push.arg.inst_id,
                    error = %e,
                    "order book verification failed"
                );
                let resync = e.requires_resync();
                if resync {
                    self.metrics.inc_book_reset(&push.arg.channel, e.reason());
                }
                self.report(&ClientError::Book(e));
                if resync && self.config.auto_resync_books {
                    self.resync(&push.arg).await?;
                }
            }
        }

        if self.handlers.push(TopicKind::OrderBook).is_some() {
            pipelines
                .typed
                .submit(TypedTask::Push(TopicKind::OrderBook, push))
                .await?;
        }
        Ok(())
    }

    /// Unsubscribe and resubscribe one book to get a fresh snapshot. The
    /// desired set is left as it is.
    async fn resync(&self, arg: &Arg) -> Result<(), ClientError> {
        let mut shared = self.shared.lock().await;
        if !shared.desired.contains(arg) || !self.books.begin_resync(arg) {
            return Ok(());
        }
        let topic = slice::from_ref(arg);
        let unsubscribe = Command::unsubscribe(self.next_id(), topic)?;
        let subscribe = Command::subscribe(self.next_id(), topic)?;
        self.write_locked(&mut shared, Message::Text(unsubscribe.to_text()?))
            .await?;
        self.write_locked(&mut shared, Message::Text(subscribe.to_text()?))
            .await?;
        info!(channel = %arg.channel, inst_id = ?arg.inst_id, "resubscribing book for fresh snapshot");
        Ok(())
    }

    /// Update the desired set and, if connected, send the command.
    /// Returns the command id when one was sent.
    async fn change_subscriptions(
        &self,
        kind: WaitKind,
        args: &[Arg],
    ) -> Result<Option<String>, ClientError> {
        if args.is_empty() {
            return Err(ClientError::InvalidArgument("no topics given".to_string()));
        }
        let mut shared = self.shared.lock().await;
        self.apply_desired(&mut shared, kind, args);
        if !shared.streaming {
            debug!(topics = args.len(), ?kind, "not streaming, change applies on connect");
            return Ok(None);
        }
        let id = self.next_id();
        let command = self.topic_command(kind, &id, args)?;
        self.write_locked(&mut shared, Message::Text(command.to_text()?))
            .await?;
        Ok(Some(id))
    }

    async fn change_subscriptions_and_wait(
        &self,
        kind: WaitKind,
        args: &[Arg],
        timeout: Duration,
    ) -> Result<(), ClientError> {
        if args.is_empty() {
            return Err(ClientError::InvalidArgument("no topics given".to_string()));
        }
        let mut shared = self.shared.lock().await;
        self.apply_desired(&mut shared, kind, args);
        if !shared.streaming {
            return Err(ClientError::Disconnected(
                "not streaming; the change applies on connect".to_string(),
            ));
        }
        let id = self.next_id();
        let pending = self.registry.register_ack(id.clone(), kind, args)?;
        let command = self.topic_command(kind, &id, args)?;
        self.write_locked(&mut shared, Message::Text(command.to_text()?))
            .await?;
        drop(shared);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        pending.wait(timeout, &mut shutdown_rx).await
    }

    fn apply_desired(&self, shared: &mut Shared, kind: WaitKind, args: &[Arg]) {
        match kind {
            WaitKind::Subscribe => {
                shared.desired.insert_all(args);
                for arg in args {
                    self.books.track(arg);
                }
            }
            WaitKind::Unsubscribe => {
                shared.desired.remove_all(args);
                for arg in args {
                    self.books.untrack(arg);
                }
            }
            WaitKind::Op => {}
        }
    }

    fn topic_command(&self, kind: WaitKind, id: &str, args: &[Arg]) -> Result<Command, ClientError> {
        match kind {
            WaitKind::Subscribe => Command::subscribe(id, args),
            WaitKind::Unsubscribe => Command::unsubscribe(id, args),
            WaitKind::Op => Err(ClientError::InvalidArgument(
                "op is not a topic command".to_string(),
            )),
        }
    }

    async fn write_command(&self, command: &Command) -> Result<(), ClientError> {
        let text = command.to_text()?;
        debug!(id = %command.id, op = %command.op, "sending command");
        self.write_message(Message::Text(text)).await
    }

    /// Write a command that must not reach the server before login and
    /// resubscribe have completed.
    async fn write_streaming(&self, command: &Command) -> Result<(), ClientError> {
        let text = command.to_text()?;
        let mut shared = self.shared.lock().await;
        if !shared.streaming {
            return Err(ClientError::Disconnected("not streaming".to_string()));
        }
        debug!(id = %command.id, op = %command.op, "sending command");
        self.write_locked(&mut shared, Message::Text(text)).await
    }

    async fn write_message(&self, message: Message) -> Result<(), ClientError> {
        let mut shared = self.shared.lock().await;
        self.write_locked(&mut shared, message).await
    }

    async fn write_locked(&self, shared: &mut Shared, message: Message) -> Result<(), ClientError> {
        let writer = shared
            .writer
            .as_mut()
            .ok_or_else(|| ClientError::Disconnected("not connected".to_string()))?;
        match tokio::time::timeout(self.config.write_timeout(), writer.send(message)).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::Timeout {
                what: "write",
                timeout_ms: self.config.write_timeout_ms,
            }),
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
