use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::constructors::ConstructorId;
use crate::util::buf::{TlBuf, TlBufMut};

/// A message id is derived from wall-clock time: the upper 32 bits are seconds since the epoch,
///  the lower 32 bits a sub-second fraction. This makes ids strictly ordered within a session
///  and roughly comparable across sessions and with the peer's clock.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub i64);

impl MessageId {
    pub fn unix_seconds(&self) -> i64 {
        self.0 >> 32
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// The per-message header (id, sequence number, length) wrapping a body. The body is opaque
///  at this level.
#[derive(Clone, Eq, PartialEq)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub seq_no: i32,
    pub body: Bytes,
}

impl Debug for MessageEnvelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope{{{:?} seq={} len={}}}", self.message_id, self.seq_no, self.body.len())
    }
}

impl MessageEnvelope {
    pub const HEADER_LEN: usize = size_of::<i64>() + 2 * size_of::<i32>();

    /// Odd sequence numbers mark content-related messages, i.e. messages that require an
    ///  acknowledgement.
    pub fn is_content_related(&self) -> bool {
        self.seq_no & 1 == 1
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.body.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_tl_long(self.message_id.0);
        buf.put_tl_int(self.seq_no);
        buf.put_tl_int(self.body.len() as i32);
        buf.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf, max_body_len: usize) -> anyhow::Result<MessageEnvelope> {
        let message_id = MessageId(buf.try_get_tl_long()?);
        let seq_no = buf.try_get_tl_int()?;
        let len = buf.try_get_tl_int()?;

        if len < 0 || len as usize > max_body_len {
            bail!("invalid body length {} for message {:?}", len, message_id);
        }
        let len = len as usize;
        if len % 4 != 0 {
            bail!("body length {} of message {:?} is not 4-byte aligned", len, message_id);
        }
        if buf.remaining() < len {
            bail!("truncated message {:?}: expected {} bytes, {} remaining", message_id, len, buf.remaining());
        }

        Ok(MessageEnvelope {
            message_id,
            seq_no,
            body: buf.copy_to_bytes(len),
        })
    }
}


/// A batch of messages sent as one network unit. Acknowledgement and resending always refer to
///  the inner messages.
pub struct Container;

impl Container {
    pub fn ser_body(inner: &[MessageEnvelope], buf: &mut impl BufMut) {
        buf.put_tl_constructor(ConstructorId::MsgContainer);
        buf.put_tl_int(inner.len() as i32);
        for msg in inner {
            msg.ser(buf);
        }
    }

    pub fn body_len(inner: &[MessageEnvelope]) -> usize {
        2 * size_of::<i32>() + inner.iter().map(|m| m.serialized_len()).sum::<usize>()
    }

    /// Deserializes a container body *after* its constructor. Containers must not be nested,
    ///  and the item count must be consistent with the actual buffer.
    pub fn try_deser_items(buf: &mut impl Buf, max_body_len: usize) -> anyhow::Result<Vec<MessageEnvelope>> {
        let count = buf.try_get_tl_int()?;
        if count < 0 || (count as usize).saturating_mul(MessageEnvelope::HEADER_LEN) > buf.remaining() {
            bail!("invalid container item count {}", count);
        }

        let mut result = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let msg = MessageEnvelope::try_deser(buf, max_body_len)?;
            if ConstructorId::peek_known(&msg.body) == Some(ConstructorId::MsgContainer) {
                bail!("nested container in message {:?}", msg.message_id);
            }
            result.push(msg);
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes after container items", buf.remaining());
        }
        Ok(result)
    }
}
