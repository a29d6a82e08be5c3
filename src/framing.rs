//! Frame reader: turns a byte stream into complete LDAP messages, one per call.
//!
//! A frame is read in full (tag, definite length, content) before anything is returned, so
//! callers never see a partially buffered message. The content is split one level deep: the
//! first record is the message id, the rest is the operation body kept as opaque byte ranges.

use crate::ldap_protocol::{
    classify_length_octet, decode_integer, is_constructed, length_from_octets, parse_tlv_header,
    split_records, tag_continues, BerWriter, LengthOctet, BER_TAG_INTEGER, MAX_LENGTH_OCTETS,
    MAX_TAG_OCTETS,
};
use bytes::{Bytes, BytesMut};
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Upper bound on the declared content length of a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors produced while reading a frame.
///
/// `NoOperationBody` and `UnrecognizedMessageId` describe a complete frame that was consumed from
/// the stream but cannot be trusted; the caller may skip it and keep reading. Everything else
/// leaves the stream at an unknown boundary and ends the session.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid packet: no children found ({len} bytes)")]
    NoOperationBody { len: usize },

    #[error("Unrecognized messageID: first child tag 0x{tag:02X} ({len} bytes)")]
    UnrecognizedMessageId { tag: u8, len: usize },

    #[error("Stream ended while reading frame {0}")]
    Truncated(&'static str),

    #[error("Indefinite length not supported")]
    IndefiniteLength,

    #[error("Length too large: {0} length octets")]
    LengthTooLong(usize),

    #[error("Tag number too large: more than {0} identifier octets")]
    TagTooLong(usize),

    #[error("Frame content of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: u64, max: usize },

    #[error("Malformed frame content: {0}")]
    MalformedContent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Skip-and-continue conditions; the frame was fully consumed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::NoOperationBody { .. } | FrameError::UnrecognizedMessageId { .. }
        )
    }
}

/// One complete LDAP message as received.
#[derive(Debug, Clone)]
pub struct Frame {
    raw: Bytes,
    tag_len: usize,
    header_len: usize,
    message_id: i64,
    message_id_record: Range<usize>,
    body: Vec<Range<usize>>,
}

impl Frame {
    /// Parse a buffer holding exactly one message.
    pub fn from_bytes(raw: Bytes) -> Result<Self, FrameError> {
        let header =
            parse_tlv_header(&raw).map_err(|e| FrameError::MalformedContent(e.to_string()))?;
        if header.total_len() != raw.len() {
            return Err(FrameError::MalformedContent(format!(
                "declared length {} but buffer holds {} bytes",
                header.total_len(),
                raw.len()
            )));
        }
        if !is_constructed(header.tag) {
            return Err(FrameError::NoOperationBody { len: raw.len() });
        }

        let content = &raw[header.header_len..];
        let records =
            split_records(content).map_err(|e| FrameError::MalformedContent(e.to_string()))?;
        let mut records = records
            .into_iter()
            .map(|r| r.start + header.header_len..r.end + header.header_len);

        let id_range = match records.next() {
            Some(r) => r,
            None => return Err(FrameError::NoOperationBody { len: raw.len() }),
        };
        let id_record = &raw[id_range.clone()];
        let id_tag = id_record[0];
        if id_tag != BER_TAG_INTEGER {
            return Err(FrameError::UnrecognizedMessageId { tag: id_tag, len: raw.len() });
        }
        let id_header = parse_tlv_header(id_record)
            .map_err(|e| FrameError::MalformedContent(e.to_string()))?;
        let message_id = decode_integer(&id_record[id_header.header_len..])
            .ok_or(FrameError::UnrecognizedMessageId { tag: id_tag, len: raw.len() })?;

        Ok(Frame {
            tag_len: header.tag_len,
            header_len: header.header_len,
            message_id,
            message_id_record: id_range,
            body: records.collect(),
            raw,
        })
    }

    /// Exact bytes as received, envelope included.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Bytes taken by the envelope tag and length.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn content(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// The message id record (tag, length, value) exactly as received.
    pub fn message_id_record(&self) -> &[u8] {
        &self.raw[self.message_id_record.clone()]
    }

    /// Number of records following the message id.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Records following the message id, in order.
    pub fn operation_body(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.body.iter().map(move |r| &self.raw[r.clone()])
    }

    /// First identifier octet of the first body record, if any.
    pub fn operation_tag(&self) -> Option<u8> {
        self.body.first().map(|r| self.raw[r.start])
    }

    /// Envelope identifier octets.
    pub fn tag_octets(&self) -> &[u8] {
        &self.raw[..self.tag_len]
    }

    /// Serialize a new envelope with the original tag and message id record followed by `body`.
    pub fn rebuild<'a, I>(&self, body: I) -> Vec<u8>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut writer = BerWriter::new();
        let length_pos = writer.start_constructed(self.tag_octets());
        writer.write_raw(self.message_id_record());
        for record in body {
            writer.write_raw(record);
        }
        writer.end_constructed(length_pos);
        writer.into_vec()
    }
}

/// Reads frames from one side of a connection.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_frame_bytes,
        }
    }

    /// Read the next frame. `Ok(None)` on a clean end of stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut header: Vec<u8> = Vec::with_capacity(2 + MAX_LENGTH_OCTETS);

        let mut first = [0u8; 1];
        if self.reader.read(&mut first).await? == 0 {
            return Ok(None);
        }
        header.push(first[0]);
        if tag_continues(first[0]) {
            loop {
                if header.len() >= MAX_TAG_OCTETS {
                    return Err(FrameError::TagTooLong(MAX_TAG_OCTETS));
                }
                let octet = self.read_octet("tag").await?;
                header.push(octet);
                if (octet & 0x80) == 0 {
                    break;
                }
            }
        }

        let length_octet = self.read_octet("length").await?;
        header.push(length_octet);
        let content_len = match classify_length_octet(length_octet) {
            LengthOctet::Short(len) => len as u64,
            LengthOctet::Indefinite => return Err(FrameError::IndefiniteLength),
            LengthOctet::Long(n) => {
                if n > MAX_LENGTH_OCTETS {
                    return Err(FrameError::LengthTooLong(n));
                }
                let mut octets = [0u8; MAX_LENGTH_OCTETS];
                self.read_exact(&mut octets[..n], "length").await?;
                header.extend_from_slice(&octets[..n]);
                length_from_octets(&octets[..n])
            }
        };
        if content_len > self.max_frame_bytes as u64 {
            return Err(FrameError::FrameTooLarge {
                len: content_len,
                max: self.max_frame_bytes,
            });
        }

        let header_len = header.len();
        let mut raw = BytesMut::with_capacity(header_len + content_len as usize);
        raw.extend_from_slice(&header);
        raw.resize(header_len + content_len as usize, 0);
        self.read_exact(&mut raw[header_len..], "content").await?;

        Frame::from_bytes(raw.freeze()).map(Some)
    }

    async fn read_octet(&mut self, what: &'static str) -> Result<u8, FrameError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf, what).await?;
        Ok(buf[0])
    }

    async fn read_exact(&mut self, buf: &mut [u8], what: &'static str) -> Result<(), FrameError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(FrameError::Truncated(what))
            }
            Err(e) => Err(FrameError::Io(e)),
        }
    }
}
