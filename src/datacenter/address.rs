use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use rustc_hash::FxHashSet;

use crate::util::buf::{put_string, put_varint_bytes, try_get_string, try_get_varint_bytes};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DatacenterId(pub i32);

impl Debug for DatacenterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dc{}", self.0)
    }
}

impl Display for DatacenterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct AddressFlags: u32 {
        const IPV6 = 1;
        const MEDIA_ONLY = 2;
        const SUPPORTS_PROXY = 4;
        const CDN = 8;
        const STATIC = 16;
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct DatacenterAddress {
    /// IP literal or host name
    pub host: String,
    pub port: u16,
    pub flags: AddressFlags,
    pub secret: Option<Bytes>,
}

impl DatacenterAddress {
    pub fn new(host: impl Into<String>, port: u16) -> DatacenterAddress {
        DatacenterAddress {
            host: host.into(),
            port,
            flags: AddressFlags::empty(),
            secret: None,
        }
    }

    pub fn with_flags(mut self, flags: AddressFlags) -> DatacenterAddress {
        self.flags = flags;
        self
    }

    /// host and port, which is what identifies an address for failure tracking
    pub fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// addresses reserved for media or CDN traffic are not used for sessions
    pub fn is_usable_for_sessions(&self) -> bool {
        !self.flags.intersects(AddressFlags::MEDIA_ONLY | AddressFlags::CDN)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub secret: Option<Bytes>,
}

/// A single way of reaching a datacenter: a resolved address, optionally through a proxy. The
///  index is the candidate's rank in the preferred ordering, lower is better.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionCandidate {
    pub index: usize,
    pub address: DatacenterAddress,
    pub socket_addr: SocketAddr,
    pub proxy: Option<ProxyConfig>,
}

const ADDRESS_SET_FORMAT_VERSION: u8 = 1;
const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// The known addresses of a datacenter in order of preference
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DatacenterAddressSet {
    addresses: Vec<DatacenterAddress>,
}

impl DatacenterAddressSet {
    pub fn new(addresses: Vec<DatacenterAddress>) -> DatacenterAddressSet {
        DatacenterAddressSet { addresses }
    }

    pub fn first(&self) -> Option<&DatacenterAddress> {
        self.addresses.first()
    }

    pub fn addresses(&self) -> &[DatacenterAddress] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Moves an address to the front. Returns false if it is not part of the set.
    pub fn prefer(&mut self, address: &DatacenterAddress) -> bool {
        match self.addresses.iter().position(|a| a == address) {
            Some(pos) => {
                let preferred = self.addresses.remove(pos);
                self.addresses.insert(0, preferred);
                true
            }
            None => false,
        }
    }

    pub fn without(&self, endpoints: &FxHashSet<(String, u16)>) -> DatacenterAddressSet {
        DatacenterAddressSet {
            addresses: self.addresses.iter()
                .filter(|a| !endpoints.contains(&a.endpoint()))
                .cloned()
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(ADDRESS_SET_FORMAT_VERSION);
        buf.put_usize_varint(self.addresses.len());
        for address in &self.addresses {
            put_string(&mut buf, &address.host);
            buf.put_u32_varint(address.port as u32);
            buf.put_u32_varint(address.flags.bits());
            match &address.secret {
                None => buf.put_u32_varint(0),
                Some(secret) => {
                    buf.put_u32_varint(1);
                    put_varint_bytes(&mut buf, secret);
                }
            }
        }
        let checksum = CHECKSUM.checksum(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    pub fn try_from_bytes(raw: &[u8]) -> anyhow::Result<DatacenterAddressSet> {
        if raw.len() < size_of::<u32>() {
            bail!("persisted address set is too short");
        }
        let (mut buf, mut checksum_buf) = raw.split_at(raw.len() - size_of::<u32>());
        if CHECKSUM.checksum(buf) != checksum_buf.get_u32_le() {
            bail!("checksum mismatch in persisted address set");
        }

        if buf.first() != Some(&ADDRESS_SET_FORMAT_VERSION) {
            bail!("unsupported address set format version {:?}", buf.first());
        }
        buf.advance(1);
        let count = buf.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid address count: {:?}", e))?;
        if count > buf.remaining() {
            bail!("address count {} exceeds buffer", count);
        }

        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let host = try_get_string(&mut buf)?;
            let port = u16::try_from(try_get_u32(&mut buf)?)?;
            let flags = try_get_u32(&mut buf)?;
            let secret = match try_get_u32(&mut buf)? {
                0 => None,
                1 => Some(try_get_varint_bytes(&mut buf)?),
                other => bail!("invalid secret marker {}", other),
            };
            addresses.push(DatacenterAddress {
                host,
                port,
                flags: AddressFlags::from_bits_truncate(flags),
                secret,
            });
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes in persisted address set", buf.remaining());
        }
        Ok(DatacenterAddressSet { addresses })
    }
}

fn try_get_u32(buf: &mut impl Buf) -> anyhow::Result<u32> {
    buf.try_get_u32_varint()
        .map_err(|e| anyhow!("invalid varint: {:?}", e))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr(host: &str, port: u16) -> DatacenterAddress {
        DatacenterAddress::new(host, port)
    }

    fn sample_set() -> DatacenterAddressSet {
        DatacenterAddressSet::new(vec![
            addr("149.154.167.51", 443),
            DatacenterAddress {
                host: "2001:67c:4e8:f002::a".to_string(),
                port: 443,
                flags: AddressFlags::IPV6 | AddressFlags::STATIC,
                secret: Some(Bytes::from_static(b"s3cr3t")),
            },
            addr("dc2.example.org", 80).with_flags(AddressFlags::MEDIA_ONLY),
        ])
    }

    #[test]
    fn test_prefer() {
        let mut set = sample_set();
        let third = set.addresses()[2].clone();
        assert!(set.prefer(&third));
        assert_eq!(set.first(), Some(&third));
        assert_eq!(set.len(), 3);
        assert!(!set.prefer(&addr("1.1.1.1", 1)));
    }

    #[test]
    fn test_without() {
        let set = sample_set();
        let failed = [("149.154.167.51".to_string(), 443)].into_iter().collect::<FxHashSet<_>>();
        let remaining = set.without(&failed);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.first().unwrap().port, 443);
        assert_eq!(remaining.first().unwrap().flags, AddressFlags::IPV6 | AddressFlags::STATIC);
    }

    #[rstest]
    #[case::usable(AddressFlags::IPV6 | AddressFlags::STATIC, true)]
    #[case::media(AddressFlags::MEDIA_ONLY, false)]
    #[case::cdn(AddressFlags::CDN, false)]
    fn test_usable_for_sessions(#[case] flags: AddressFlags, #[case] expected: bool) {
        assert_eq!(addr("a", 1).with_flags(flags).is_usable_for_sessions(), expected);
    }

    #[test]
    fn test_persisted_format() {
        let set = sample_set();
        let bytes = set.to_bytes();
        assert_eq!(DatacenterAddressSet::try_from_bytes(&bytes).unwrap(), set);
        assert_eq!(DatacenterAddressSet::try_from_bytes(&DatacenterAddressSet::default().to_bytes()).unwrap(), DatacenterAddressSet::default());
    }

    #[rstest]
    #[case::flipped_bit(5)]
    #[case::flipped_checksum(usize::MAX)]
    fn test_persisted_corrupt(#[case] pos: usize) {
        let mut bytes = sample_set().to_bytes().to_vec();
        let pos = pos.min(bytes.len() - 1);
        bytes[pos] ^= 0x10;
        assert!(DatacenterAddressSet::try_from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_persisted_truncated() {
        assert!(DatacenterAddressSet::try_from_bytes(&[1, 2]).is_err());
        let bytes = sample_set().to_bytes();
        assert!(DatacenterAddressSet::try_from_bytes(&bytes[..bytes.len() - 6]).is_err());
    }
}
