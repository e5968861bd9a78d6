use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// The long-lived shared secret negotiated with a datacenter. Its contents are never logged.
#[derive(Clone, Eq, PartialEq)]
pub struct AuthKey {
    data: Bytes,
    id: i64,
}

impl Debug for AuthKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey{{id={:x}}}", self.id)
    }
}

impl AuthKey {
    pub fn new(data: Bytes) -> AuthKey {
        let digest = Sha256::digest(&data);
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&digest[digest.len() - 8..]);

        AuthKey {
            id: i64::from_le_bytes(id_bytes),
            data,
        }
    }

    /// identifies the key on the wire without revealing it
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
