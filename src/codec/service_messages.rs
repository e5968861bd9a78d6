use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::codec::compression::decompress_if_packed;
use crate::codec::constructors::ConstructorId;
use crate::codec::envelope::{Container, MessageEnvelope, MessageId};
use crate::util::buf::{TlBuf, TlBufMut};

/// Message ids the peer has acknowledged
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckSet {
    pub message_ids: Vec<MessageId>,
}

/// Message ids the peer asks to be retransmitted in full
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResendRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PongData {
    pub message_id: MessageId,
    pub ping_id: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcErrorData {
    pub error_code: i32,
    pub description: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcAnswerDroppedData {
    pub message_id: MessageId,
    pub seq_no: i32,
    pub bytes: i32,
}

/// The `result` part of an `rpc_result`
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RpcResultBody {
    Data(Bytes),
    Error(RpcErrorData),
    AnswerUnknown,
    AnswerDroppedRunning,
    AnswerDropped(RpcAnswerDroppedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcResultData {
    pub request_message_id: MessageId,
    pub result: RpcResultBody,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BadMsgNotificationData {
    pub bad_message_id: MessageId,
    pub bad_seq_no: i32,
    pub error_code: i32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewSessionCreatedData {
    pub first_message_id: MessageId,
    pub unique_id: i64,
    pub server_salt: i64,
}

/// Everything that can be the body of a single message. Bodies with unknown constructors are
///  application payloads and are passed through as opaque bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceMessage {
    MsgsAck(AckSet),
    MsgResendReq(ResendRequest),
    Ping { ping_id: i64 },
    PingDelayDisconnect { ping_id: i64, disconnect_delay_secs: i32 },
    Pong(PongData),
    RpcResult(RpcResultData),
    RpcDropAnswer { request_message_id: MessageId },
    BadMsgNotification(BadMsgNotificationData),
    BadServerSalt { notification: BadMsgNotificationData, new_server_salt: i64 },
    NewSessionCreated(NewSessionCreatedData),
    Container(Vec<MessageEnvelope>),
    Payload(Bytes),
}

impl ServiceMessage {
    /// Acknowledgements and containers are the only messages that do not require
    ///  acknowledgement themselves.
    pub fn is_content_related(&self) -> bool {
        !matches!(self, ServiceMessage::MsgsAck(_) | ServiceMessage::Container(_))
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ServiceMessage::MsgsAck(data) => {
                buf.put_tl_constructor(ConstructorId::MsgsAck);
                Self::ser_id_vector(&data.message_ids, buf);
            }
            ServiceMessage::MsgResendReq(data) => {
                buf.put_tl_constructor(ConstructorId::MsgResendReq);
                Self::ser_id_vector(&data.message_ids, buf);
            }
            ServiceMessage::Ping { ping_id } => {
                buf.put_tl_constructor(ConstructorId::Ping);
                buf.put_tl_long(*ping_id);
            }
            ServiceMessage::PingDelayDisconnect { ping_id, disconnect_delay_secs } => {
                buf.put_tl_constructor(ConstructorId::PingDelayDisconnect);
                buf.put_tl_long(*ping_id);
                buf.put_tl_int(*disconnect_delay_secs);
            }
            ServiceMessage::Pong(data) => {
                buf.put_tl_constructor(ConstructorId::Pong);
                buf.put_tl_long(data.message_id.0);
                buf.put_tl_long(data.ping_id);
            }
            ServiceMessage::RpcResult(data) => Self::ser_rpc_result(data, buf),
            ServiceMessage::RpcDropAnswer { request_message_id } => {
                buf.put_tl_constructor(ConstructorId::RpcDropAnswer);
                buf.put_tl_long(request_message_id.0);
            }
            ServiceMessage::BadMsgNotification(data) => {
                buf.put_tl_constructor(ConstructorId::BadMsgNotification);
                Self::ser_bad_msg_notification(data, buf);
            }
            ServiceMessage::BadServerSalt { notification, new_server_salt } => {
                buf.put_tl_constructor(ConstructorId::BadServerSalt);
                Self::ser_bad_msg_notification(notification, buf);
                buf.put_tl_long(*new_server_salt);
            }
            ServiceMessage::NewSessionCreated(data) => {
                buf.put_tl_constructor(ConstructorId::NewSessionCreated);
                buf.put_tl_long(data.first_message_id.0);
                buf.put_tl_long(data.unique_id);
                buf.put_tl_long(data.server_salt);
            }
            ServiceMessage::Container(items) => Container::ser_body(items, buf),
            ServiceMessage::Payload(data) => buf.put_slice(data),
        }
    }

    fn ser_id_vector(ids: &[MessageId], buf: &mut BytesMut) {
        let raw = ids.iter().map(|id| id.0).collect::<Vec<_>>();
        buf.put_tl_long_vector(&raw);
    }

    fn ser_bad_msg_notification(data: &BadMsgNotificationData, buf: &mut BytesMut) {
        buf.put_tl_long(data.bad_message_id.0);
        buf.put_tl_int(data.bad_seq_no);
        buf.put_tl_int(data.error_code);
    }

    fn ser_rpc_result(data: &RpcResultData, buf: &mut BytesMut) {
        buf.put_tl_constructor(ConstructorId::RpcResult);
        buf.put_tl_long(data.request_message_id.0);
        match &data.result {
            RpcResultBody::Data(bytes) => buf.put_slice(bytes),
            RpcResultBody::Error(error) => {
                buf.put_tl_constructor(ConstructorId::RpcError);
                buf.put_tl_int(error.error_code);
                buf.put_tl_string(&error.description);
            }
            RpcResultBody::AnswerUnknown => buf.put_tl_constructor(ConstructorId::RpcAnswerUnknown),
            RpcResultBody::AnswerDroppedRunning => buf.put_tl_constructor(ConstructorId::RpcAnswerDroppedRunning),
            RpcResultBody::AnswerDropped(dropped) => {
                buf.put_tl_constructor(ConstructorId::RpcAnswerDropped);
                buf.put_tl_long(dropped.message_id.0);
                buf.put_tl_int(dropped.seq_no);
                buf.put_tl_int(dropped.bytes);
            }
        }
    }

    /// Decodes a message body, transparently reversing `gzip_packed` wrapping. Malformed bodies
    ///  of known constructors are errors, never partially parsed.
    pub fn deser(body: Bytes, max_len: usize) -> anyhow::Result<ServiceMessage> {
        let body = decompress_if_packed(body, max_len)?;

        let Some(raw_constructor) = ConstructorId::peek(&body) else {
            return Ok(ServiceMessage::Payload(body));
        };
        let Ok(constructor) = ConstructorId::try_from_primitive(raw_constructor) else {
            return Ok(ServiceMessage::Payload(body));
        };

        let mut buf: &[u8] = &body;
        buf.advance(4);

        let result = match constructor {
            ConstructorId::MsgsAck => ServiceMessage::MsgsAck(AckSet {
                message_ids: Self::deser_id_vector(&mut buf)?,
            }),
            ConstructorId::MsgResendReq => ServiceMessage::MsgResendReq(ResendRequest {
                message_ids: Self::deser_id_vector(&mut buf)?,
            }),
            ConstructorId::Ping => ServiceMessage::Ping {
                ping_id: buf.try_get_tl_long()?,
            },
            ConstructorId::PingDelayDisconnect => ServiceMessage::PingDelayDisconnect {
                ping_id: buf.try_get_tl_long()?,
                disconnect_delay_secs: buf.try_get_tl_int()?,
            },
            ConstructorId::Pong => ServiceMessage::Pong(PongData {
                message_id: MessageId(buf.try_get_tl_long()?),
                ping_id: buf.try_get_tl_long()?,
            }),
            ConstructorId::RpcResult => {
                let request_message_id = MessageId(buf.try_get_tl_long()?);
                let rest = body.slice(body.len() - buf.remaining()..);
                buf = &[];
                ServiceMessage::RpcResult(RpcResultData {
                    request_message_id,
                    result: Self::deser_rpc_result_body(rest, max_len)?,
                })
            }
            ConstructorId::RpcDropAnswer => ServiceMessage::RpcDropAnswer {
                request_message_id: MessageId(buf.try_get_tl_long()?),
            },
            ConstructorId::BadMsgNotification => ServiceMessage::BadMsgNotification(
                Self::deser_bad_msg_notification(&mut buf)?
            ),
            ConstructorId::BadServerSalt => ServiceMessage::BadServerSalt {
                notification: Self::deser_bad_msg_notification(&mut buf)?,
                new_server_salt: buf.try_get_tl_long()?,
            },
            ConstructorId::NewSessionCreated => ServiceMessage::NewSessionCreated(NewSessionCreatedData {
                first_message_id: MessageId(buf.try_get_tl_long()?),
                unique_id: buf.try_get_tl_long()?,
                server_salt: buf.try_get_tl_long()?,
            }),
            ConstructorId::MsgContainer => ServiceMessage::Container(
                Container::try_deser_items(&mut buf, max_len)?
            ),
            ConstructorId::RpcError
            | ConstructorId::RpcAnswerUnknown
            | ConstructorId::RpcAnswerDroppedRunning
            | ConstructorId::RpcAnswerDropped
            | ConstructorId::Vector
            | ConstructorId::GzipPacked => {
                bail!("constructor {:?} is not valid as a top-level message", constructor);
            }
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?}", buf.remaining(), constructor);
        }
        Ok(result)
    }

    fn deser_id_vector(buf: &mut impl Buf) -> anyhow::Result<Vec<MessageId>> {
        Ok(buf.try_get_tl_long_vector()?
            .into_iter()
            .map(MessageId)
            .collect())
    }

    fn deser_bad_msg_notification(buf: &mut impl Buf) -> anyhow::Result<BadMsgNotificationData> {
        Ok(BadMsgNotificationData {
            bad_message_id: MessageId(buf.try_get_tl_long()?),
            bad_seq_no: buf.try_get_tl_int()?,
            error_code: buf.try_get_tl_int()?,
        })
    }

    fn deser_rpc_result_body(rest: Bytes, max_len: usize) -> anyhow::Result<RpcResultBody> {
        let rest = decompress_if_packed(rest, max_len)?;
        let mut buf: &[u8] = &rest;

        let result = match ConstructorId::peek_known(&rest) {
            Some(ConstructorId::RpcError) => {
                buf.advance(4);
                RpcResultBody::Error(RpcErrorData {
                    error_code: buf.try_get_tl_int()?,
                    description: buf.try_get_tl_string()?,
                })
            }
            Some(ConstructorId::RpcAnswerUnknown) => {
                buf.advance(4);
                RpcResultBody::AnswerUnknown
            }
            Some(ConstructorId::RpcAnswerDroppedRunning) => {
                buf.advance(4);
                RpcResultBody::AnswerDroppedRunning
            }
            Some(ConstructorId::RpcAnswerDropped) => {
                buf.advance(4);
                RpcResultBody::AnswerDropped(RpcAnswerDroppedData {
                    message_id: MessageId(buf.try_get_tl_long()?),
                    seq_no: buf.try_get_tl_int()?,
                    bytes: buf.try_get_tl_int()?,
                })
            }
            _ => return Ok(RpcResultBody::Data(rest)),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes in rpc_result", buf.remaining());
        }
        Ok(result)
    }
}
