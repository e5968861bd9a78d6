use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::compression::maybe_compress;
use crate::codec::envelope::{Container, MessageEnvelope, MessageId};
use crate::codec::frame::Frame;
use crate::codec::service_messages::{AckSet, BadMsgNotificationData, PongData, RpcErrorData, RpcResultBody, RpcResultData, ServiceMessage};
use crate::config::EngineConfig;
use crate::datacenter::address::DatacenterId;
use crate::datacenter::connector::TransportConnection;
use crate::datacenter::DatacenterAddressResolver;
use crate::error::{RpcFailure, RpcResult};
use crate::keepalive::KeepaliveController;
use crate::persistence::SessionMaterialStore;
use crate::rpc::correlator::{CallId, Completion, DropResponseContext, PendingCall, RpcCorrelator};
use crate::rpc::error_classification::RpcErrorKind;
use crate::rpc::RpcOutcome;
use crate::session::ack_coordinator::AckCoordinator;
use crate::session::message_id::{SystemClock, WallClock};
use crate::session::session_state::{IncomingCheck, SessionState};
use crate::util::backoff::ExponentialBackoff;
use crate::util::bag::Bag;
use crate::util::random::{Random, RngRandom};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Things a session reports to its subscribers
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// the session was replaced by a fresh one, failing all calls that were in flight
    Reset,
    /// the auth key is missing or was rejected; the session is closed
    AuthenticationRequired,
    ConnectivityUnavailable { rounds: u32 },
    /// a message from the server that is not the reply to a call
    Update(Bytes),
    Closed,
}

pub enum SessionCommand {
    Invoke { call_id: CallId, body: Bytes, completion: Completion },
    Cancel { call_id: CallId },
    Subscribe(mpsc::UnboundedSender<SessionEvent>),
    Close,
}

/// The collaborators a session is built from. Sessions for different datacenters share them.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<EngineConfig>,
    pub resolver: Arc<DatacenterAddressResolver>,
    pub materials: Arc<SessionMaterialStore>,
    pub clock: Arc<dyn WallClock>,
}

impl SessionContext {
    /// A context running on the system's wall clock
    pub fn new(config: Arc<EngineConfig>, resolver: Arc<DatacenterAddressResolver>, materials: Arc<SessionMaterialStore>) -> SessionContext {
        SessionContext {
            config,
            resolver,
            materials,
            clock: Arc::new(SystemClock),
        }
    }
}

/// The application's side of a session. All state is owned by the session's task; the handle
///  only sends commands to it, so it is cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    dc: DatacenterId,
    commands: mpsc::Sender<SessionCommand>,
    next_call_id: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn dc(&self) -> DatacenterId {
        self.dc
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// true if both handles refer to the same session
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    pub async fn invoke(&self, body: Bytes) -> RpcResult<RpcOutcome> {
        self.invoke_cancellable(body, CancellationToken::new()).await
    }

    /// Cancelling the token completes the call with [RpcFailure::Cancelled] and asks the server
    ///  to drop its answer. No result is delivered after cancellation.
    pub async fn invoke_cancellable(&self, body: Bytes, cancel: CancellationToken) -> RpcResult<RpcOutcome> {
        if cancel.is_cancelled() {
            return Err(RpcFailure::Cancelled);
        }

        let call_id = CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed));
        let (completion, reply) = oneshot::channel();
        self.commands.send(SessionCommand::Invoke { call_id, body, completion }).await
            .map_err(|_| RpcFailure::Closed)?;

        select! {
            reply = reply => reply.unwrap_or(Err(RpcFailure::Closed)),
            _ = cancel.cancelled() => {
                let _ = self.commands.send(SessionCommand::Cancel { call_id }).await;
                Err(RpcFailure::Cancelled)
            }
        }
    }

    pub async fn subscribe(&self) -> RpcResult<mpsc::UnboundedReceiver<SessionEvent>> {
        let (send, recv) = mpsc::unbounded_channel();
        self.commands.send(SessionCommand::Subscribe(send)).await
            .map_err(|_| RpcFailure::Closed)?;
        Ok(recv)
    }

    pub async fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }
}

/// Starts a session's task, which connects right away and keeps reconnecting until the session
///  is closed
pub fn spawn_session(context: SessionContext, dc: DatacenterId) -> SessionHandle {
    let (send, recv) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let driver = SessionDriver::new(context, dc).await;
        driver.run(recv).await;
    });

    SessionHandle {
        dc,
        commands: send,
        next_call_id: Default::default(),
    }
}


enum Control {
    Continue,
    Reconnect,
    Reset(String),
    FatalAuth,
    Close,
}

enum Outgoing {
    /// `replaces` is the id the call was previously sent under, if any
    Call { call: PendingCall, replaces: Option<MessageId> },
    Message { body: Bytes, resend_after_reconnect: bool },
    DropAnswer(MessageId),
    /// retransmission with the original id and sequence number
    Resend(MessageEnvelope),
}

struct ScheduledRetry {
    due: Instant,
    replaces: MessageId,
    call: PendingCall,
}

struct SessionDriver {
    config: Arc<EngineConfig>,
    dc: DatacenterId,
    resolver: Arc<DatacenterAddressResolver>,
    materials: Arc<SessionMaterialStore>,
    clock: Arc<dyn WallClock>,

    auth_key_id: i64,
    state: SessionState,
    acks: AckCoordinator,
    rpc: RpcCorrelator,
    keepalive: KeepaliveController<RngRandom>,

    outgoing: VecDeque<Outgoing>,
    retries: Vec<ScheduledRetry>,
    subscribers: Bag<mpsc::UnboundedSender<SessionEvent>>,

    backoff: ExponentialBackoff,
    reconnect_delay: Option<Duration>,
    consecutive_decode_errors: u32,
    /// what calls still waiting in the command channel fail with once the session is closed
    terminal_failure: RpcFailure,
}

impl SessionDriver {
    async fn new(context: SessionContext, dc: DatacenterId) -> SessionDriver {
        let server_salt = context.materials.load_server_salt(dc).await;
        let time_offset_millis = context.materials.load_time_offset_millis(dc).await;
        let config = context.config;

        SessionDriver {
            state: SessionState::new(config.clone(), context.clock.clone(), RngRandom::next_i64(), server_salt, time_offset_millis),
            acks: AckCoordinator::new(config.clone()),
            rpc: RpcCorrelator::new(config.clone()),
            keepalive: KeepaliveController::new(config.clone(), Instant::now()),
            backoff: ExponentialBackoff::new(config.reconnect_initial_delay, config.reconnect_max_delay, config.reconnect_factor_eighths),
            config,
            dc,
            resolver: context.resolver,
            materials: context.materials,
            clock: context.clock,
            auth_key_id: 0,
            outgoing: VecDeque::new(),
            retries: Vec::new(),
            subscribers: Bag::new(),
            reconnect_delay: None,
            consecutive_decode_errors: 0,
            terminal_failure: RpcFailure::Closed,
        }
    }

    #[tracing::instrument(name = "session", skip_all, fields(dc = ?self.dc))]
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            let Some(connection) = self.connect(&mut commands).await else {
                break;
            };

            match self.run_connection(connection, &mut commands).await {
                Control::Continue | Control::Reconnect => {
                    self.emit(SessionEvent::Disconnected);
                }
                Control::Reset(reason) => {
                    self.emit(SessionEvent::Disconnected);
                    self.reset_session(&reason);
                }
                Control::FatalAuth => {
                    self.on_fatal_auth().await;
                    break;
                }
                Control::Close => break,
            }
            self.reconnect_delay = Some(self.backoff.next_delay());
        }

        self.shutdown(commands);
    }

    /// Runs `until` to completion while serving commands. Returns `None` if the session was closed
    ///  in the meantime.
    async fn serve_commands_until<F: Future>(&mut self, until: F, commands: &mut mpsc::Receiver<SessionCommand>) -> Option<F::Output> {
        tokio::pin!(until);
        loop {
            select! {
                result = &mut until => return Some(result),
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if let Control::Close = self.on_command(command) {
                                return None;
                            }
                        }
                        None => return None,
                    }
                }
            }
        }
    }

    async fn connect(&mut self, commands: &mut mpsc::Receiver<SessionCommand>) -> Option<TransportConnection> {
        loop {
            if let Some(delay) = self.reconnect_delay.take() {
                debug!(?delay, "waiting before reconnecting");
                self.serve_commands_until(sleep(delay), commands).await?;
            }

            let auth_key = match self.materials.load_auth_key(self.dc).await {
                Ok(auth_key) => auth_key,
                Err(failure) => {
                    warn!("no usable auth key - closing session");
                    self.terminal_failure = failure.clone();
                    self.fail_everything(failure);
                    self.emit(SessionEvent::AuthenticationRequired);
                    return None;
                }
            };
            self.auth_key_id = auth_key.id();

            let resolver = self.resolver.clone();
            let dc = self.dc;
            let connecting = async move { resolver.connect(dc, &auth_key).await };

            match self.serve_commands_until(connecting, commands).await? {
                Ok(connection) => return Some(connection),
                Err(failure) => {
                    warn!("connecting failed: {}", failure);
                    if let RpcFailure::ConnectivityUnavailable { rounds, .. } = &failure {
                        self.emit(SessionEvent::ConnectivityUnavailable { rounds: *rounds });
                    }
                    self.fail_everything(failure);
                    self.reconnect_delay = Some(self.backoff.next_delay());
                }
            }
        }
    }

    async fn run_connection(&mut self, mut connection: TransportConnection, commands: &mut mpsc::Receiver<SessionCommand>) -> Control {
        info!(candidate = connection.candidate.index, addr = %connection.candidate.socket_addr, "connected");

        self.keepalive.reset(Instant::now());
        self.consecutive_decode_errors = 0;
        self.outgoing.retain(|item| match item {
            Outgoing::Resend(_) => false,
            Outgoing::Message { resend_after_reconnect, .. } => *resend_after_reconnect,
            _ => true,
        });
        for envelope in self.acks.on_reconnect() {
            self.outgoing.push_back(Outgoing::Resend(envelope));
        }
        self.emit(SessionEvent::Connected);

        loop {
            if let Err(control) = self.flush(&connection).await {
                return control;
            }

            let now = Instant::now();
            let ack_deadline = self.acks.ack_flush_deadline();
            let retry_deadline = self.retries.iter().map(|r| r.due).min();
            let keepalive_deadline = self.keepalive.next_deadline();

            let control = select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => Control::Close,
                },
                frame = connection.incoming.recv() => match frame {
                    Some(raw) => self.on_frame(raw),
                    None => {
                        info!("connection lost");
                        Control::Reconnect
                    }
                },
                _ = sleep_until(ack_deadline.unwrap_or(now)), if ack_deadline.is_some() => Control::Continue,
                _ = sleep_until(retry_deadline.unwrap_or(now)), if retry_deadline.is_some() => {
                    self.release_due_retries();
                    Control::Continue
                }
                _ = sleep_until(keepalive_deadline) => self.on_keepalive_tick(),
            };

            if !matches!(control, Control::Continue) {
                return control;
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) -> Control {
        match command {
            SessionCommand::Invoke { call_id, body, completion } => {
                let call = PendingCall::new(call_id, body, completion);
                if call.body.len() % 4 != 0 || call.body.len() > self.config.max_message_size {
                    warn!(?call_id, len = call.body.len(), "request body is not a valid message body");
                    call.complete(Err(RpcFailure::Rpc { code: 400, description: "INVALID_REQUEST_BODY".to_string() }));
                }
                else {
                    trace!(?call_id, "queueing call");
                    self.outgoing.push_back(Outgoing::Call { call, replaces: None });
                }
            }
            SessionCommand::Cancel { call_id } => self.cancel(call_id),
            SessionCommand::Subscribe(subscriber) => {
                self.subscribers.add(subscriber);
            }
            SessionCommand::Close => return Control::Close,
        }
        Control::Continue
    }

    fn cancel(&mut self, call_id: CallId) {
        let queued = self.outgoing.iter()
            .position(|item| matches!(item, Outgoing::Call { call, .. } if call.call_id == call_id));
        if let Some(pos) = queued {
            if let Some(Outgoing::Call { call, .. }) = self.outgoing.remove(pos) {
                debug!(?call_id, "cancelled call before sending it");
                call.complete(Err(RpcFailure::Cancelled));
            }
            return;
        }

        if let Some(pos) = self.retries.iter().position(|r| r.call.call_id == call_id) {
            debug!(?call_id, "cancelled call waiting for retry");
            self.retries.remove(pos).call.complete(Err(RpcFailure::Cancelled));
            return;
        }

        match self.rpc.cancel(call_id) {
            Some((message_id, call)) => {
                debug!(?call_id, msg_id = ?message_id, "cancelled call - asking server to drop the answer");
                call.complete(Err(RpcFailure::Cancelled));
                self.acks.drop_message(message_id);
                self.outgoing.push_back(Outgoing::DropAnswer(message_id));
            }
            None => debug!(?call_id, "cancel for a call that is not pending - ignoring"),
        }
    }

    fn new_envelope(&mut self, body: Bytes, content_related: bool) -> MessageEnvelope {
        let (message_id, seq_no) = self.state.next_message(content_related);
        MessageEnvelope { message_id, seq_no, body }
    }

    /// Sends everything that is queued, together with owed acks. Acks are also sent on their
    ///  own once enough are owed or the oldest has waited for the debounce delay.
    async fn flush(&mut self, connection: &TransportConnection) -> Result<(), Control> {
        let now = Instant::now();
        let acks_due = self.acks.has_ack_debt() && (
            !self.outgoing.is_empty()
                || self.acks.should_flush_acks_now()
                || self.acks.ack_flush_deadline().is_some_and(|deadline| deadline <= now)
        );
        if !acks_due && self.outgoing.is_empty() {
            return Ok(());
        }

        let mut envelopes = Vec::new();
        let mut acked = Vec::new();
        if acks_due {
            acked = self.acks.take_ack_debt();
            trace!("acknowledging {} message(s)", acked.len());
            let body = ServiceMessage::MsgsAck(AckSet { message_ids: acked.clone() }).to_bytes();
            envelopes.push(self.new_envelope(body, false));
        }

        let mut limit_exceeded = false;
        while let Some(item) = self.outgoing.pop_front() {
            let envelope = match item {
                Outgoing::Resend(envelope) => envelope,
                Outgoing::Call { call, replaces } => {
                    let body = match maybe_compress(call.body.clone(), self.config.compression_threshold) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!("compressing request body failed - sending it uncompressed: {}", e);
                            call.body.clone()
                        }
                    };
                    let envelope = self.new_envelope(body, true);
                    limit_exceeded |= self.acks.on_sent(&envelope, true).is_err();
                    match replaces {
                        Some(old_id) => self.rpc.rebind(old_id, envelope.message_id, envelope.seq_no, call),
                        None => self.rpc.register(envelope.message_id, call),
                    }
                    envelope
                }
                Outgoing::Message { body, resend_after_reconnect } => {
                    let envelope = self.new_envelope(body, true);
                    limit_exceeded |= self.acks.on_sent(&envelope, resend_after_reconnect).is_err();
                    envelope
                }
                Outgoing::DropAnswer(request_message_id) => {
                    let envelope = self.new_envelope(ServiceMessage::RpcDropAnswer { request_message_id }.to_bytes(), true);
                    self.rpc.register_drop_request(envelope.message_id, request_message_id);
                    limit_exceeded |= self.acks.on_sent(&envelope, true).is_err();
                    envelope
                }
            };
            envelopes.push(envelope);
        }

        if limit_exceeded {
            return Err(Control::Reset("too many unacknowledged messages".to_string()));
        }

        for envelope in self.pack(envelopes) {
            let frame = Frame {
                auth_key_id: self.auth_key_id,
                server_salt: self.state.server_salt(),
                session_id: self.state.session_id(),
                envelope,
            };
            trace!(?frame, "sending");
            if connection.outgoing.send(frame.to_bytes()).await.is_err() {
                info!("connection closed while sending");
                for message_id in acked.drain(..) {
                    self.acks.add_ack_debt(message_id, now);
                }
                return Err(Control::Reconnect);
            }
        }
        Ok(())
    }

    /// Puts several envelopes into containers, each of them staying within the maximum message size
    fn pack(&mut self, envelopes: Vec<MessageEnvelope>) -> Vec<MessageEnvelope> {
        if envelopes.len() <= 1 {
            return envelopes;
        }

        let mut result = Vec::new();
        let mut batch: Vec<MessageEnvelope> = Vec::new();
        for envelope in envelopes {
            if !batch.is_empty() && Container::body_len(&batch) + envelope.serialized_len() > self.config.max_message_size {
                let full_batch = std::mem::take(&mut batch);
                result.push(self.container(full_batch));
            }
            batch.push(envelope);
        }
        if !batch.is_empty() {
            result.push(self.container(batch));
        }
        result
    }

    fn container(&mut self, mut batch: Vec<MessageEnvelope>) -> MessageEnvelope {
        if batch.len() == 1 {
            if let Some(single) = batch.pop() {
                return single;
            }
        }

        let mut body = BytesMut::with_capacity(Container::body_len(&batch));
        Container::ser_body(&batch, &mut body);
        let envelope = self.new_envelope(body.freeze(), false);
        self.acks.on_container_sent(envelope.message_id, batch.iter().map(|e| e.message_id).collect());
        envelope
    }

    fn on_frame(&mut self, raw: Bytes) -> Control {
        let frame = match Frame::try_deser(&raw, self.config.max_message_size) {
            Ok(frame) => frame,
            Err(e) => return self.on_decode_error(e),
        };
        if frame.session_id != self.state.session_id() {
            debug!(session_id = frame.session_id, "frame for a different session - ignoring");
            return Control::Continue;
        }
        trace!(?frame, "received");

        let control = self.on_envelope(frame.envelope);
        if self.state.take_material_changed() {
            self.persist_material();
        }
        control
    }

    fn on_decode_error(&mut self, e: anyhow::Error) -> Control {
        self.consecutive_decode_errors += 1;
        warn!("discarding undecodable message ({} in a row): {}", self.consecutive_decode_errors, e);
        if self.consecutive_decode_errors >= self.config.max_consecutive_decode_errors {
            warn!("too many undecodable messages - replacing the connection");
            return Control::Reconnect;
        }
        Control::Continue
    }

    fn on_envelope(&mut self, envelope: MessageEnvelope) -> Control {
        let now = Instant::now();
        let message_id = envelope.message_id;
        let content_related = envelope.is_content_related();

        match self.state.check_incoming(message_id) {
            IncomingCheck::Accept => {}
            IncomingCheck::Duplicate => {
                debug!(msg_id = ?message_id, "duplicate message - ignoring");
                if content_related {
                    self.acks.add_ack_debt(message_id, now);
                }
                return Control::Continue;
            }
            IncomingCheck::Reset(reason) => return Control::Reset(reason),
        }

        let message = match ServiceMessage::deser(envelope.body, self.config.max_message_size) {
            Ok(message) => message,
            Err(e) => return self.on_decode_error(e),
        };
        self.consecutive_decode_errors = 0;
        self.backoff.reset();
        self.keepalive.on_activity(now);
        if content_related {
            self.acks.add_ack_debt(message_id, now);
        }

        match message {
            ServiceMessage::Container(items) => {
                for item in items {
                    let control = self.on_envelope(item);
                    if !matches!(control, Control::Continue) {
                        return control;
                    }
                }
            }
            ServiceMessage::MsgsAck(ack_set) => {
                self.acks.on_ack(&ack_set.message_ids);
            }
            ServiceMessage::MsgResendReq(request) => {
                for resent in self.acks.on_resend_request(&request.message_ids) {
                    debug!(msg_id = ?resent.message_id, "resending on request");
                    self.outgoing.push_back(Outgoing::Resend(resent));
                }
            }
            ServiceMessage::Ping { ping_id } | ServiceMessage::PingDelayDisconnect { ping_id, .. } => {
                let pong = ServiceMessage::Pong(PongData { message_id, ping_id });
                self.outgoing.push_back(Outgoing::Message { body: pong.to_bytes(), resend_after_reconnect: false });
            }
            ServiceMessage::Pong(pong) => {
                trace!(ping_id = pong.ping_id, "pong");
                self.keepalive.on_pong(pong.ping_id);
                self.acks.on_ack(&[pong.message_id]);
            }
            ServiceMessage::RpcResult(result) => return self.on_rpc_result(result),
            ServiceMessage::RpcDropAnswer { request_message_id } => {
                debug!(msg_id = ?request_message_id, "server sent a drop request - ignoring");
            }
            ServiceMessage::BadMsgNotification(notification) => return self.on_bad_msg(notification, message_id),
            ServiceMessage::BadServerSalt { notification, new_server_salt } => {
                self.state.set_server_salt(new_server_salt);
                return self.on_bad_msg(notification, message_id);
            }
            ServiceMessage::NewSessionCreated(data) => {
                info!(first_msg_id = ?data.first_message_id, "server created a new session");
                self.state.set_server_salt(data.server_salt);
                for pending in self.acks.pending_before(data.first_message_id) {
                    self.resend_under_new_id(pending);
                }
            }
            ServiceMessage::Payload(data) => self.emit(SessionEvent::Update(data)),
        }
        Control::Continue
    }

    fn on_rpc_result(&mut self, result: RpcResultData) -> Control {
        let request_id = result.request_message_id;
        self.acks.on_ack(&[request_id]);

        if self.rpc.take_drop_request(request_id) {
            debug!(msg_id = ?request_id, result = ?result.result, "server answered drop request");
            return Control::Continue;
        }

        match result.result {
            RpcResultBody::Data(data) => {
                self.rpc.resolve(request_id, Ok(RpcOutcome::Response(data)));
            }
            RpcResultBody::Error(error) => return self.on_rpc_error(request_id, error),
            other => debug!(msg_id = ?request_id, result = ?other, "drop answer for a regular request - ignoring"),
        }
        Control::Continue
    }

    fn on_rpc_error(&mut self, request_id: MessageId, error: RpcErrorData) -> Control {
        let kind = RpcErrorKind::classify(error.error_code, &error.description, &self.config);
        debug!(msg_id = ?request_id, code = error.error_code, description = %error.description, ?kind, "rpc error");

        match kind {
            RpcErrorKind::FloodWait(delay) => self.schedule_retry(request_id, delay, None),
            RpcErrorKind::InternalError(delay) => self.schedule_retry(request_id, delay, Some(error)),
            RpcErrorKind::Migrate(dc) => {
                self.rpc.resolve(request_id, Ok(RpcOutcome::Migrate { dc, error_code: error.error_code, description: error.description }));
            }
            RpcErrorKind::FatalAuth => {
                self.rpc.resolve(request_id, Err(RpcFailure::AuthenticationRequired));
                return Control::FatalAuth;
            }
            RpcErrorKind::Generic => {
                self.rpc.resolve(request_id, Err(RpcFailure::Rpc { code: error.error_code, description: error.description }));
            }
        }
        Control::Continue
    }

    /// `bounded_error` is passed for errors that are retried a limited number of times, and is
    ///  surfaced to the caller once the retries are used up
    fn schedule_retry(&mut self, request_id: MessageId, delay: Duration, bounded_error: Option<RpcErrorData>) {
        let Some(mut call) = self.rpc.take(request_id) else {
            debug!(msg_id = ?request_id, "error for an unknown or dropped request - ignoring");
            return;
        };

        if let Some(error) = bounded_error {
            if call.internal_retries >= self.config.max_internal_retries {
                warn!(msg_id = ?request_id, "giving up after {} retries", call.internal_retries);
                call.complete(Err(RpcFailure::Rpc { code: error.error_code, description: error.description }));
                return;
            }
            call.internal_retries += 1;
        }

        info!(msg_id = ?request_id, ?delay, "retrying call after delay");
        self.rpc.record_drop(DropResponseContext {
            drop_message_id: request_id,
            replacement: None,
        });
        self.retries.push(ScheduledRetry {
            due: Instant::now() + delay,
            replaces: request_id,
            call,
        });
    }

    fn release_due_retries(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retries)
            .into_iter()
            .partition(|r| r.due <= now);
        self.retries = waiting;

        for retry in due {
            self.outgoing.push_back(Outgoing::Call { call: retry.call, replaces: Some(retry.replaces) });
        }
    }

    fn on_bad_msg(&mut self, notification: BadMsgNotificationData, server_message_id: MessageId) -> Control {
        let affected = self.acks.expand_container(notification.bad_message_id);
        warn!(msg_id = ?notification.bad_message_id, code = notification.error_code, "bad message notification");

        match notification.error_code {
            16 | 17 => {
                self.state.resync_time(server_message_id);
                for message_id in affected {
                    self.resend_under_new_id(message_id);
                }
            }
            48 => {
                for message_id in affected {
                    self.resend_under_new_id(message_id);
                }
            }
            32 | 33 | 64 => {
                return Control::Reset(format!("bad message notification with code {}", notification.error_code));
            }
            code => {
                for message_id in affected {
                    self.acks.drop_message(message_id);
                    self.rpc.resolve(message_id, Err(RpcFailure::Rpc { code, description: format!("BAD_MSG_NOTIFICATION_{}", code) }));
                }
            }
        }
        Control::Continue
    }

    fn resend_under_new_id(&mut self, message_id: MessageId) {
        let envelope = self.acks.take(message_id);
        if let Some(call) = self.rpc.take(message_id) {
            debug!(msg_id = ?message_id, "re-sending call under a new id");
            self.rpc.record_drop(DropResponseContext {
                drop_message_id: message_id,
                replacement: None,
            });
            self.outgoing.push_back(Outgoing::Call { call, replaces: Some(message_id) });
        }
        else if let Some(request_message_id) = self.rpc.drop_request_target(message_id) {
            debug!(msg_id = ?message_id, request_msg_id = ?request_message_id, "re-sending drop request under a new id");
            self.outgoing.push_back(Outgoing::DropAnswer(request_message_id));
        }
        else if let Some(envelope) = envelope {
            debug!(msg_id = ?message_id, "re-sending message under a new id");
            self.outgoing.push_back(Outgoing::Message { body: envelope.body, resend_after_reconnect: true });
        }
        else {
            debug!(msg_id = ?message_id, "message is not pending - not re-sending");
        }
    }

    fn on_keepalive_tick(&mut self) -> Control {
        let tick = self.keepalive.on_tick(Instant::now());
        if tick.reconnect {
            return Control::Reconnect;
        }
        if let Some(ping_id) = tick.ping_id {
            trace!(ping_id, "ping");
            self.outgoing.push_back(Outgoing::Message {
                body: ServiceMessage::Ping { ping_id }.to_bytes(),
                resend_after_reconnect: false,
            });
        }
        Control::Continue
    }

    fn persist_material(&self) {
        let materials = self.materials.clone();
        let dc = self.dc;
        let server_salt = self.state.server_salt();
        let time_offset_millis = self.state.time_offset_millis();
        tokio::spawn(async move {
            materials.store_session_material(dc, server_salt, time_offset_millis).await;
        });
    }

    fn emit(&mut self, event: SessionEvent) {
        trace!(?event, "session event");
        self.subscribers.retain(|_, subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Fails all calls, both those in flight and those waiting to be sent
    fn fail_everything(&mut self, failure: RpcFailure) {
        self.rpc.fail_all(failure.clone());
        for retry in self.retries.drain(..) {
            retry.call.complete(Err(failure.clone()));
        }
        for item in self.outgoing.drain(..) {
            if let Outgoing::Call { call, .. } = item {
                call.complete(Err(failure.clone()));
            }
        }
        self.acks = AckCoordinator::new(self.config.clone());
    }

    /// Replaces the session with a fresh one. Calls that were sent on the old session fail, calls
    ///  that were not sent yet go out on the new one.
    fn reset_session(&mut self, reason: &str) {
        warn!(reason, "resetting session");

        self.rpc.fail_all(RpcFailure::SessionReset);
        for retry in self.retries.drain(..) {
            retry.call.complete(Err(RpcFailure::SessionReset));
        }
        let mut unsent = VecDeque::new();
        for item in self.outgoing.drain(..) {
            match item {
                Outgoing::Call { call, replaces: None } => unsent.push_back(Outgoing::Call { call, replaces: None }),
                Outgoing::Call { call, replaces: Some(_) } => call.complete(Err(RpcFailure::SessionReset)),
                _ => {}
            }
        }
        self.outgoing = unsent;

        self.state = SessionState::new(
            self.config.clone(),
            self.clock.clone(),
            RngRandom::next_i64(),
            self.state.server_salt(),
            self.state.time_offset_millis(),
        );
        self.acks = AckCoordinator::new(self.config.clone());
        self.rpc = RpcCorrelator::new(self.config.clone());

        self.emit(SessionEvent::Reset);
    }

    async fn on_fatal_auth(&mut self) {
        error!("auth key was rejected - closing session");
        self.terminal_failure = RpcFailure::AuthenticationRequired;
        self.fail_everything(RpcFailure::AuthenticationRequired);
        if let Err(e) = self.materials.forget(self.dc).await {
            warn!("error removing rejected auth key: {}", e);
        }
        self.emit(SessionEvent::AuthenticationRequired);
    }

    fn shutdown(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("session closed");
        self.fail_everything(RpcFailure::Closed);

        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                SessionCommand::Invoke { completion, .. } => {
                    let _ = completion.send(Err(self.terminal_failure.clone()));
                }
                SessionCommand::Subscribe(subscriber) => {
                    self.subscribers.add(subscriber);
                }
                SessionCommand::Cancel { .. } | SessionCommand::Close => {}
            }
        }
        self.emit(SessionEvent::Closed);
    }
}
