use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::codec::constructors::ConstructorId;

/// Encoded byte strings of at least this length use the long form (0xFE + 3 length bytes)
const LONG_BYTES_MARKER: u8 = 0xFE;
const MAX_SHORT_BYTES_LEN: usize = 253;
const MAX_BYTES_LEN: usize = 0x00FF_FFFF;

macro_rules! tl_try_get {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                bail!("buffer underflow reading {}", stringify!($ty));
            }
            Ok(self.$getter())
        }
    }
}

/// Reading the protocol's primitive types. All numbers are little endian, byte strings are
///  length prefixed and padded to a multiple of four bytes.
pub trait TlBuf: Buf {
    tl_try_get!(try_get_tl_int, i32, get_i32_le);
    tl_try_get!(try_get_tl_uint, u32, get_u32_le);
    tl_try_get!(try_get_tl_long, i64, get_i64_le);

    fn try_get_tl_bytes(&mut self) -> anyhow::Result<Bytes> {
        if !self.has_remaining() {
            bail!("buffer underflow reading byte string length");
        }
        let first = self.get_u8();
        let (len, prefix_len) = if first == LONG_BYTES_MARKER {
            if self.remaining() < 3 {
                bail!("buffer underflow reading long byte string length");
            }
            let mut len_bytes = [0u8; 4];
            self.copy_to_slice(&mut len_bytes[..3]);
            (u32::from_le_bytes(len_bytes) as usize, 4)
        }
        else if first as usize <= MAX_SHORT_BYTES_LEN {
            (first as usize, 1)
        }
        else {
            bail!("invalid byte string length marker {:#x}", first);
        };

        let padding = padding_for(prefix_len + len);
        if self.remaining() < len + padding {
            bail!("byte string of length {} exceeds remaining buffer of {} bytes", len, self.remaining());
        }
        let data = self.copy_to_bytes(len);
        self.advance(padding);
        Ok(data)
    }

    fn try_get_tl_string(&mut self) -> anyhow::Result<String> {
        let raw = self.try_get_tl_bytes()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn try_get_tl_constructor(&mut self) -> anyhow::Result<u32> {
        self.try_get_tl_uint()
    }

    /// reads a boxed `Vector<long>`, rejecting counts that cannot possibly fit the remaining buffer
    fn try_get_tl_long_vector(&mut self) -> anyhow::Result<Vec<i64>> {
        let constructor = self.try_get_tl_constructor()?;
        if constructor != ConstructorId::Vector as u32 {
            bail!("expected vector constructor, was {:#010x}", constructor);
        }
        let count = self.try_get_tl_int()?;
        if count < 0 || (count as usize).saturating_mul(size_of::<i64>()) > self.remaining() {
            bail!("invalid vector length {}", count);
        }
        let mut result = Vec::with_capacity(count as usize);
        for _ in 0..count {
            result.push(self.try_get_tl_long()?);
        }
        Ok(result)
    }
}

pub trait TlBufMut: BufMut {
    fn put_tl_int(&mut self, v: i32) {
        self.put_i32_le(v);
    }
    fn put_tl_uint(&mut self, v: u32) {
        self.put_u32_le(v);
    }
    fn put_tl_long(&mut self, v: i64) {
        self.put_i64_le(v);
    }
    fn put_tl_constructor(&mut self, constructor: ConstructorId) {
        self.put_u32_le(constructor as u32);
    }

    /// NB: byte strings longer than 16 MiB can not be represented; callers enforce the engine's
    ///      (much smaller) message size limit before getting here
    fn put_tl_bytes(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= MAX_BYTES_LEN);

        let prefix_len = if data.len() <= MAX_SHORT_BYTES_LEN {
            self.put_u8(data.len() as u8);
            1
        }
        else {
            self.put_u8(LONG_BYTES_MARKER);
            self.put_slice(&(data.len() as u32).to_le_bytes()[..3]);
            4
        };
        self.put_slice(data);
        self.put_bytes(0, padding_for(prefix_len + data.len()));
    }

    fn put_tl_string(&mut self, s: &str) {
        self.put_tl_bytes(s.as_bytes());
    }

    fn put_tl_long_vector(&mut self, values: &[i64]) {
        self.put_tl_constructor(ConstructorId::Vector);
        self.put_tl_int(values.len() as i32);
        for &v in values {
            self.put_tl_long(v);
        }
    }
}

impl <T: Buf> TlBuf for T {}
impl <T: BufMut> TlBufMut for T {}

fn padding_for(len: usize) -> usize {
    (4 - len % 4) % 4
}


// The following helpers are for the engine's own persisted formats, which use varint lengths
//  rather than the wire protocol's padded encoding.

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_varint_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_varint_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_varint_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_varint_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()
        .map_err(|e| anyhow!("invalid varint length: {:?}", e))?;
    if buf.remaining() < len {
        bail!("buffer underflow: length {} with {} bytes remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty(b"".to_vec(), vec![0,0,0,0])]
    #[case::one(b"a".to_vec(), vec![1,97,0,0])]
    #[case::three(b"abc".to_vec(), vec![3,97,98,99])]
    #[case::four(b"abcd".to_vec(), vec![4,97,98,99,100,0,0,0])]
    fn test_put_tl_bytes_short(#[case] data: Vec<u8>, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_tl_bytes(&data);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut deser_buf: &[u8] = &buf;
        let deser = deser_buf.try_get_tl_bytes().unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(deser.as_ref(), data.as_slice());
    }

    #[rstest]
    #[case::boundary(254)]
    #[case::odd(1001)]
    #[case::large(70_000)]
    fn test_tl_bytes_long_form(#[case] len: usize) {
        let data = (0..len).map(|i| i as u8).collect::<Vec<_>>();

        let mut buf = BytesMut::new();
        buf.put_tl_bytes(&data);
        assert_eq!(buf[0], LONG_BYTES_MARKER);
        assert_eq!(buf.len() % 4, 0);
        assert_eq!(buf.len(), 4 + len + padding_for(4 + len));

        let mut deser_buf: &[u8] = &buf;
        assert_eq!(deser_buf.try_get_tl_bytes().unwrap().as_ref(), data.as_slice());
        assert!(deser_buf.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::missing_padding(vec![3,97,98])]
    #[case::truncated(vec![5,97,98,99])]
    #[case::truncated_long_len(vec![0xFE,1])]
    #[case::invalid_marker(vec![0xFF,0,0,0])]
    fn test_try_get_tl_bytes_malformed(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(buf.try_get_tl_bytes().is_err());
    }

    #[test]
    fn test_tl_bytes_leaves_remainder() {
        let raw = vec![2,7,8,0, 9,9];
        let mut buf: &[u8] = &raw;
        assert_eq!(buf.try_get_tl_bytes().unwrap().as_ref(), &[7,8]);
        assert_eq!(buf.chunk(), &[9,9]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::some(vec![1, -2, i64::MAX, i64::MIN])]
    fn test_tl_long_vector(#[case] values: Vec<i64>) {
        let mut buf = BytesMut::new();
        buf.put_tl_long_vector(&values);
        assert_eq!(buf.len(), 8 + 8 * values.len());

        let mut deser_buf: &[u8] = &buf;
        assert_eq!(deser_buf.try_get_tl_long_vector().unwrap(), values);
        assert!(deser_buf.is_empty());
    }

    #[rstest]
    #[case::wrong_constructor(vec![1,2,3,4, 0,0,0,0])]
    #[case::negative_count(vec![0x15,0xc4,0xb5,0x1c, 0xff,0xff,0xff,0xff])]
    #[case::count_too_big(vec![0x15,0xc4,0xb5,0x1c, 2,0,0,0, 1,0,0,0,0,0,0,0])]
    fn test_tl_long_vector_malformed(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(buf.try_get_tl_long_vector().is_err());
    }

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_string(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut buf: &[u8] = b"\x02a";
        assert!(try_get_string(&mut buf).is_err());
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut buf: &[u8] = b"\x02\xc0\xaf";
        assert!(try_get_string(&mut buf).is_err());
    }
}
