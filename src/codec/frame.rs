use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::envelope::MessageEnvelope;
use crate::util::buf::{TlBuf, TlBufMut};

/// The unit exchanged with a transport connection: session scoped header fields followed by a
///  single envelope. The envelope's body may be a container. Encryption with the auth key is
///  the transport connection's business and happens below this level.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub auth_key_id: i64,
    pub server_salt: i64,
    pub session_id: i64,
    pub envelope: MessageEnvelope,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame{{session={:x} {:?}}}", self.session_id, self.envelope)
    }
}

impl Frame {
    pub const HEADER_LEN: usize = 3 * size_of::<i64>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_tl_long(self.auth_key_id);
        buf.put_tl_long(self.server_salt);
        buf.put_tl_long(self.session_id);
        self.envelope.ser(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.envelope.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8], max_message_size: usize) -> anyhow::Result<Frame> {
        let auth_key_id = buf.try_get_tl_long()?;
        let server_salt = buf.try_get_tl_long()?;
        let session_id = buf.try_get_tl_long()?;
        let envelope = MessageEnvelope::try_deser(&mut buf, max_message_size)?;
        if buf.has_remaining() {
            anyhow::bail!("{} trailing bytes after frame", buf.remaining());
        }
        Ok(Frame {
            auth_key_id,
            server_salt,
            session_id,
            envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::envelope::MessageId;

    #[test]
    fn test_frame_ser() {
        let frame = Frame {
            auth_key_id: 9,
            server_salt: 1,
            session_id: 2,
            envelope: MessageEnvelope { message_id: MessageId(3), seq_no: 4, body: Bytes::from_static(&[5,5,5,5]) },
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.as_ref(), &[9,0,0,0,0,0,0,0, 1,0,0,0,0,0,0,0, 2,0,0,0,0,0,0,0, 3,0,0,0,0,0,0,0, 4,0,0,0, 4,0,0,0, 5,5,5,5]);
        assert_eq!(Frame::try_deser(&bytes, 1024).unwrap(), frame);
    }

    #[test]
    fn test_frame_trailing_bytes() {
        let frame = Frame {
            auth_key_id: 9,
            server_salt: 1,
            session_id: 2,
            envelope: MessageEnvelope { message_id: MessageId(3), seq_no: 4, body: Bytes::new() },
        };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        buf.put_u8(0);
        assert!(Frame::try_deser(&buf, 1024).is_err());
    }
}
