use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::ship::TransactionId;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum DataType {
    Command = 1,
    Message = 2,
    MessageFragment = 3,
    CommandResponse = 9,
    MessageResponse = 10,
}
impl DataType {
    /// messages need a response from the peer, everything else is fire-and-forget
    pub fn is_message(self) -> bool {
        matches!(self, DataType::Message | DataType::MessageFragment)
    }
}

/// Position of a fragment in its message
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FragmentInfo {
    pub pages: u32,
    pub offset: u32,
}

/// The header of an MTP package (all numbers in network byte order):
///
/// ```ascii
/// 0: 'D' 'I' 'M'
/// 3: header length / 4 (upper nibble) | data type (lower nibble)
/// 4: SN (u64)
/// [12: pages (u32), 16: offset (u32)]  - fragments and responses to fragments only
/// *: body length (u32)
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub data_type: DataType,
    pub sn: TransactionId,
    pub fragment: Option<FragmentInfo>,
    pub body_len: u32,
}

impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.fragment {
            Some(fragment) => write!(f, "MTP{{{:?}{:?}:{}/{}:{}}}", self.data_type, self.sn, fragment.offset, fragment.pages, self.body_len),
            None => write!(f, "MTP{{{:?}{:?}:{}}}", self.data_type, self.sn, self.body_len),
        }
    }
}

impl Header {
    pub const MAGIC: &'static [u8; 3] = b"DIM";
    pub const SHORT_LEN: usize = 16;
    pub const FRAGMENT_LEN: usize = 24;

    pub fn new(data_type: DataType, sn: TransactionId, fragment: Option<FragmentInfo>, body_len: u32) -> Header {
        Header {
            data_type,
            sn,
            fragment,
            body_len,
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self.fragment {
            Some(_) => Self::FRAGMENT_LEN,
            None => Self::SHORT_LEN,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(Self::MAGIC);
        let data_type: u8 = self.data_type.into();
        buf.put_u8((((self.serialized_len() / 4) as u8) << 4) | data_type);
        buf.put_u64(self.sn.to_raw());
        if let Some(fragment) = self.fragment {
            buf.put_u32(fragment.pages);
            buf.put_u32(fragment.offset);
        }
        buf.put_u32(self.body_len);
    }

    /// Looks at the first bytes of a package to determine its header's length. Returns `None` if
    ///  there are not enough bytes to tell, and an error if this is not the start of a package.
    pub fn peek_len(data: &[u8]) -> anyhow::Result<Option<usize>> {
        let prefix_len = data.len().min(Self::MAGIC.len());
        if data[..prefix_len] != Self::MAGIC[..prefix_len] {
            bail!("no MTP magic");
        }
        match data.get(Self::MAGIC.len()) {
            None => Ok(None),
            Some(&b) => match ((b >> 4) as usize) * 4 {
                len @ (Self::SHORT_LEN | Self::FRAGMENT_LEN) => Ok(Some(len)),
                len => Err(anyhow!("invalid MTP header length {}", len)),
            },
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Header> {
        let mut magic = [0u8; 3];
        buf.try_copy_to_slice(&mut magic)?;
        if &magic != Self::MAGIC {
            bail!("no MTP magic");
        }

        let b = buf.try_get_u8()?;
        let header_len = ((b >> 4) as usize) * 4;
        let data_type = DataType::try_from_primitive(b & 0x0f)?;
        let sn = TransactionId::from_raw(buf.try_get_u64()?);

        let fragment = match header_len {
            Self::SHORT_LEN => None,
            Self::FRAGMENT_LEN => {
                let pages = buf.try_get_u32()?;
                let offset = buf.try_get_u32()?;
                Some(FragmentInfo { pages, offset })
            }
            _ => bail!("invalid MTP header length {}", header_len),
        };
        let body_len = buf.try_get_u32()?;

        match (data_type, fragment) {
            (DataType::MessageFragment, None) => bail!("fragment without position"),
            (DataType::MessageFragment, _) | (DataType::MessageResponse, _) => {}
            (_, Some(_)) => bail!("{:?} must not have a fragment position", data_type),
            (_, None) => {}
        }
        if let Some(fragment) = fragment {
            if fragment.offset >= fragment.pages {
                bail!("fragment offset {} out of range for {} pages", fragment.offset, fragment.pages);
            }
        }

        Ok(Header {
            data_type,
            sn,
            fragment,
            body_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::command(Header::new(DataType::Command, TransactionId::from_raw(1), None, 4), 16)]
    #[case::message(Header::new(DataType::Message, TransactionId::from_raw(u64::MAX), None, 0), 16)]
    #[case::fragment(Header::new(DataType::MessageFragment, TransactionId::from_raw(99), Some(FragmentInfo { pages: 3, offset: 2 }), 1000), 24)]
    #[case::fragment_response(Header::new(DataType::MessageResponse, TransactionId::from_raw(99), Some(FragmentInfo { pages: 3, offset: 0 }), 2), 24)]
    #[case::command_response(Header::new(DataType::CommandResponse, TransactionId::from_raw(7), None, 4), 16)]
    fn test_ser_deser(#[case] header: Header, #[case] expected_len: usize) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), expected_len);
        assert_eq!(header.serialized_len(), expected_len);
        assert_eq!(&buf[..3], b"DIM");
        assert_eq!(Header::peek_len(&buf).unwrap(), Some(expected_len));

        let mut b: &[u8] = &buf;
        assert_eq!(Header::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        Header::new(DataType::Message, TransactionId::from_raw(0x0102030405060708), None, 5).ser(&mut buf);
        assert_eq!(&buf[..], &[b'D', b'I', b'M', 0x42, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 5]);
    }

    #[rstest]
    #[case::empty(b"".as_slice(), Some(None))]
    #[case::partial_magic(b"DI".as_slice(), Some(None))]
    #[case::magic_only(b"DIM".as_slice(), Some(None))]
    #[case::short(b"DIM\x42".as_slice(), Some(Some(16)))]
    #[case::long(b"DIM\x63".as_slice(), Some(Some(24)))]
    #[case::bad_len(b"DIM\x52".as_slice(), None)]
    #[case::no_magic(b"DAM\x42".as_slice(), None)]
    #[case::no_magic_prefix(b"X".as_slice(), None)]
    fn test_peek_len(#[case] data: &[u8], #[case] expected: Option<Option<usize>>) {
        assert_eq!(Header::peek_len(data).ok(), expected);
    }

    #[rstest]
    #[case::unknown_type(b"DIM\x47\0\0\0\0\0\0\0\x01\0\0\0\0".as_slice())]
    #[case::fragment_without_position(b"DIM\x43\0\0\0\0\0\0\0\x01\0\0\0\0".as_slice())]
    #[case::message_with_position(b"DIM\x62\0\0\0\0\0\0\0\x01\0\0\0\x02\0\0\0\x01\0\0\0\0".as_slice())]
    #[case::offset_out_of_range(b"DIM\x63\0\0\0\0\0\0\0\x01\0\0\0\x02\0\0\0\x02\0\0\0\0".as_slice())]
    #[case::truncated(b"DIM\x42\0\0\0".as_slice())]
    fn test_deser_invalid(#[case] data: &[u8]) {
        let mut buf = data;
        assert!(Header::deser(&mut buf).is_err());
    }
}
