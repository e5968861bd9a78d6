use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::trace;

use crate::codec::envelope::{MessageEnvelope, MessageId};
use crate::codec::frame::Frame;
use crate::codec::service_messages::ServiceMessage;
use crate::datacenter::address::{ConnectionCandidate, DatacenterId};
use crate::datacenter::connector::{TransportConnection, TransportConnector};
use crate::session::auth_key::AuthKey;
use crate::session::message_id::WallClock;
use crate::util::atomic_box::AtomicBox;

const CHANNEL_CAPACITY: usize = 256;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A message received by a [ServerConnection], with the header fields of the frame carrying it
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub session_id: i64,
    pub server_salt: i64,
    pub envelope: MessageEnvelope,
    pub message: ServiceMessage,
}

/// The server side of a connection made through a [ChannelConnector]
pub struct ServerConnection {
    pub dc: DatacenterId,
    pub candidate: ConnectionCandidate,
    from_client: mpsc::Receiver<Bytes>,
    to_client: mpsc::Sender<Bytes>,
    clock: Arc<dyn WallClock>,
    received: VecDeque<ReceivedMessage>,
    num_sent: i64,
    num_content_sent: i32,
}

impl ServerConnection {
    /// Message ids as a server generates them: odd, with the wall clock's seconds in the upper
    ///  half and a counter below
    pub fn next_message_id(&mut self) -> MessageId {
        self.num_sent += 1;
        let seconds = self.clock.unix_time().as_secs() as i64;
        MessageId((seconds << 32) | (self.num_sent << 2) | 1)
    }

    /// Next message from the client, containers unpacked. Returns `None` once the client closed
    ///  the connection.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        loop {
            if let Some(message) = self.received.pop_front() {
                return Some(message);
            }

            let raw = self.from_client.recv().await?;
            let Ok(frame) = Frame::try_deser(&raw, MAX_FRAME_LEN) else {
                continue;
            };
            trace!(?frame, "server received");
            self.unpack(frame.session_id, frame.server_salt, frame.envelope);
        }
    }

    fn unpack(&mut self, session_id: i64, server_salt: i64, envelope: MessageEnvelope) {
        let Ok(message) = ServiceMessage::deser(envelope.body.clone(), MAX_FRAME_LEN) else {
            return;
        };
        match message {
            ServiceMessage::Container(items) => {
                for item in items {
                    self.unpack(session_id, server_salt, item);
                }
            }
            message => self.received.push_back(ReceivedMessage {
                session_id,
                server_salt,
                envelope,
                message,
            }),
        }
    }

    /// Receives messages until one matches, discarding the others
    pub async fn recv_matching(&mut self, predicate: impl Fn(&ServiceMessage) -> bool) -> Option<ReceivedMessage> {
        loop {
            let received = self.recv().await?;
            if predicate(&received.message) {
                return Some(received);
            }
        }
    }

    pub async fn send(&mut self, session_id: i64, message: ServiceMessage) -> anyhow::Result<MessageId> {
        let message_id = self.next_message_id();
        self.send_with_id(session_id, message_id, message).await?;
        Ok(message_id)
    }

    pub async fn send_with_id(&mut self, session_id: i64, message_id: MessageId, message: ServiceMessage) -> anyhow::Result<()> {
        let seq_no = if message.is_content_related() {
            self.num_content_sent += 1;
            2 * self.num_content_sent - 1
        }
        else {
            2 * self.num_content_sent
        };
        let frame = Frame {
            auth_key_id: 0,
            server_salt: 0,
            session_id,
            envelope: MessageEnvelope {
                message_id,
                seq_no,
                body: message.to_bytes(),
            },
        };
        self.send_raw(frame.to_bytes()).await
    }

    pub async fn send_raw(&self, raw: Bytes) -> anyhow::Result<()> {
        self.to_client.send(raw).await
            .map_err(|_| anyhow!("client closed the connection"))
    }
}


/// An in-process transport: every successful connection attempt hands a [ServerConnection] to
///  the test through the receiver returned by [ChannelConnector::new]. Hosts can be marked as
///  unreachable, and attempts are recorded.
pub struct ChannelConnector {
    clock: Arc<dyn WallClock>,
    connections: mpsc::UnboundedSender<ServerConnection>,
    unreachable: AtomicBox<FxHashSet<String>>,
    attempts: AtomicBox<Vec<String>>,
}

impl ChannelConnector {
    pub fn new(clock: Arc<dyn WallClock>) -> (ChannelConnector, mpsc::UnboundedReceiver<ServerConnection>) {
        let (send, recv) = mpsc::unbounded_channel();
        let connector = ChannelConnector {
            clock,
            connections: send,
            unreachable: Default::default(),
            attempts: Default::default(),
        };
        (connector, recv)
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.unreachable.modify(|unreachable| {
            if reachable {
                unreachable.remove(host);
            }
            else {
                unreachable.insert(host.to_string());
            }
        });
    }

    /// hosts of all connection attempts so far, in the order they were started
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.attempts.get()
    }

    fn is_reachable(&self, candidate: &ConnectionCandidate) -> bool {
        self.unreachable.with(|unreachable| !unreachable.contains(&candidate.address.host))
    }
}

#[async_trait]
impl TransportConnector for ChannelConnector {
    async fn connect(&self, dc: DatacenterId, candidate: &ConnectionCandidate, _auth_key: &AuthKey) -> anyhow::Result<TransportConnection> {
        self.attempts.modify(|attempts| attempts.push(candidate.address.host.clone()));
        if !self.is_reachable(candidate) {
            bail!("{} is unreachable", candidate.address.host);
        }

        let (to_server, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, from_server) = mpsc::channel(CHANNEL_CAPACITY);
        let server = ServerConnection {
            dc,
            candidate: candidate.clone(),
            from_client,
            to_client,
            clock: self.clock.clone(),
            received: VecDeque::new(),
            num_sent: 0,
            num_content_sent: 0,
        };
        if self.connections.send(server).is_err() {
            bail!("test is no longer accepting connections");
        }

        Ok(TransportConnection {
            candidate: candidate.clone(),
            outgoing: to_server,
            incoming: from_server,
        })
    }

    async fn probe(&self, candidate: &ConnectionCandidate) -> anyhow::Result<Duration> {
        if !self.is_reachable(candidate) {
            bail!("{} is unreachable", candidate.address.host);
        }
        Ok(Duration::ZERO)
    }
}
