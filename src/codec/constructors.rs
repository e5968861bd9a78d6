use num_enum::TryFromPrimitive;

/// Constructor ids of the service-level objects the engine understands. Bodies starting with
///  any other constructor are opaque application payloads.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive)]
pub enum ConstructorId {
    MsgContainer = 0x73f1_f8dc,
    GzipPacked = 0x3072_cfa1,
    MsgsAck = 0x62d6_b459,
    MsgResendReq = 0x7d86_1a08,
    Vector = 0x1cb5_c415,
    Ping = 0x7abe_77ec,
    PingDelayDisconnect = 0xf342_7b8c,
    Pong = 0x3477_73c5,
    RpcResult = 0xf35c_6d01,
    RpcError = 0x2144_ca19,
    RpcDropAnswer = 0x58e4_a740,
    RpcAnswerUnknown = 0x5e2a_d36e,
    RpcAnswerDroppedRunning = 0xcd78_e586,
    RpcAnswerDropped = 0xa43a_d8b7,
    BadMsgNotification = 0xa7ef_f811,
    BadServerSalt = 0xedab_447b,
    NewSessionCreated = 0x9ec2_0908,
}

impl ConstructorId {
    /// peeks at the constructor at the start of a body without consuming it
    pub fn peek(body: &[u8]) -> Option<u32> {
        let raw: [u8; 4] = body.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(raw))
    }

    pub fn peek_known(body: &[u8]) -> Option<ConstructorId> {
        Self::peek(body)
            .and_then(|raw| ConstructorId::try_from(raw).ok())
    }
}
