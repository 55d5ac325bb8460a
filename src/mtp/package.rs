use std::fmt::{Debug, Formatter};
use bytes::{Bytes, BytesMut};
use crate::mtp::header::{DataType, FragmentInfo, Header};
use crate::ship::TransactionId;

/// A header with its body: the unit of transfer in MTP
#[derive(Clone, Eq, PartialEq)]
pub struct Package {
    header: Header,
    body: Bytes,
}

impl Debug for Package {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.header)
    }
}

/// The outcome of trying to read a package from the start of a buffer
#[derive(Debug)]
pub enum Parsed {
    /// a package, and the number of bytes it took up
    Complete(Package, usize),
    /// the buffer holds the start of a package, but more data is needed
    Incomplete,
    /// the buffer does not start with a valid package
    Invalid(anyhow::Error),
}

impl Package {
    /// upper bound for a single package's body, a larger announced length is treated as garbage
    pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

    fn with_header(data_type: DataType, sn: TransactionId, fragment: Option<FragmentInfo>, body: Bytes) -> Package {
        Package {
            header: Header::new(data_type, sn, fragment, body.len() as u32),
            body,
        }
    }

    pub fn new(data_type: DataType, sn: TransactionId, body: Bytes) -> Package {
        Self::with_header(data_type, sn, None, body)
    }

    pub fn command(sn: TransactionId, body: Bytes) -> Package {
        Self::new(DataType::Command, sn, body)
    }

    pub fn message(sn: TransactionId, body: Bytes) -> Package {
        Self::new(DataType::Message, sn, body)
    }

    pub fn fragment(sn: TransactionId, pages: u32, offset: u32, body: Bytes) -> Package {
        Self::with_header(DataType::MessageFragment, sn, Some(FragmentInfo { pages, offset }), body)
    }

    /// The response to a received package, with the same SN - and for fragments, the same
    ///  position - as the request
    pub fn response(request: &Header, body: Bytes) -> Package {
        let data_type = match request.data_type {
            DataType::Command | DataType::CommandResponse => DataType::CommandResponse,
            DataType::Message | DataType::MessageFragment | DataType::MessageResponse => DataType::MessageResponse,
        };
        Self::with_header(data_type, request.sn, request.fragment, body)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn data_type(&self) -> DataType {
        self.header.data_type
    }

    pub fn sn(&self) -> TransactionId {
        self.header.sn
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// number of fragments in this package's message
    pub fn pages(&self) -> u32 {
        self.header.fragment.map(|f| f.pages).unwrap_or(1)
    }

    /// position of this package in its message
    pub fn offset(&self) -> u32 {
        self.header.fragment.map(|f| f.offset).unwrap_or(0)
    }

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.serialized_len() + self.body.len());
        self.header.ser(&mut buf);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Splits a message into fragments with bodies of at most `max_body` bytes. Everything else
    ///  (including messages that fit) is returned as it is.
    pub fn split(self, max_body: usize) -> Vec<Package> {
        if self.header.data_type != DataType::Message || self.body.len() <= max_body || max_body == 0 {
            return vec![self];
        }

        let pages = self.body.len().div_ceil(max_body) as u32;
        (0..pages)
            .map(|offset| {
                let start = offset as usize * max_body;
                let end = (start + max_body).min(self.body.len());
                Package::fragment(self.header.sn, pages, offset, self.body.slice(start..end))
            })
            .collect()
    }

    /// Reads a package from the start of `data`
    pub fn parse(data: &[u8]) -> Parsed {
        let header_len = match Header::peek_len(data) {
            Ok(Some(len)) => len,
            Ok(None) => return Parsed::Incomplete,
            Err(e) => return Parsed::Invalid(e),
        };
        if data.len() < header_len {
            return Parsed::Incomplete;
        }

        let mut header_buf = &data[..header_len];
        let header = match Header::deser(&mut header_buf) {
            Ok(header) => header,
            Err(e) => return Parsed::Invalid(e),
        };
        let body_len = header.body_len as usize;
        if body_len > Self::MAX_BODY_LEN {
            return Parsed::Invalid(anyhow::anyhow!("body length {} exceeds the maximum of {}", body_len, Self::MAX_BODY_LEN));
        }

        let total = header_len + body_len;
        if data.len() < total {
            return Parsed::Incomplete;
        }
        let body = Bytes::copy_from_slice(&data[header_len..total]);
        Parsed::Complete(Package { header, body }, total)
    }

    /// The position in `data` (after its first byte) where a package could start, for skipping
    ///  garbage in a stream. A partial magic at the very end counts.
    pub fn next_candidate(data: &[u8]) -> usize {
        (1..data.len())
            .find(|&i| {
                let candidate = &data[i..];
                let n = candidate.len().min(Header::MAGIC.len());
                candidate[..n] == Header::MAGIC[..n]
            })
            .unwrap_or(data.len())
    }
}
