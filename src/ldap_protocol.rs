// LDAP envelope handling with BER encoding/decoding
// Only the outer LDAPMessage SEQUENCE and its top-level records are parsed; operation bodies
// are kept as opaque byte ranges.

use anyhow::{bail, Result};
use std::ops::Range;

pub const BER_TAG_BOOLEAN: u8 = 0x01;
pub const BER_TAG_INTEGER: u8 = 0x02;
pub const BER_TAG_OCTET_STRING: u8 = 0x04;
pub const BER_TAG_ENUMERATED: u8 = 0x0A;
pub const BER_TAG_SEQUENCE: u8 = 0x30;

/// Constructed bit of the identifier octet.
pub const BER_CONSTRUCTED: u8 = 0x20;
/// Low five bits all set: tag number continues in the following octets.
const BER_HIGH_TAG_NUMBER: u8 = 0x1F;

/// Definite lengths are limited to what fits in a u64.
pub const MAX_LENGTH_OCTETS: usize = 8;
/// Identifier octets accepted for high-tag-number form (first octet included).
pub const MAX_TAG_OCTETS: usize = 5;

// LDAP protocolOp tags, used for log output only
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;
/// Context [0] controls following the protocolOp
pub const LDAP_TAG_CONTROLS: u8 = 0xA0;

/// Human-readable name of a top-level record for proxy logs.
pub fn record_name(tag: u8) -> &'static str {
    match tag {
        LDAP_TAG_BIND_REQUEST => "BIND",
        LDAP_TAG_BIND_RESPONSE => "BIND_RESPONSE",
        LDAP_TAG_UNBIND_REQUEST => "UNBIND",
        LDAP_TAG_SEARCH_REQUEST => "SEARCH",
        LDAP_TAG_SEARCH_RESULT_ENTRY => "SEARCH_ENTRY",
        LDAP_TAG_SEARCH_RESULT_DONE => "SEARCH_DONE",
        LDAP_TAG_SEARCH_RESULT_REFERENCE => "SEARCH_REFERENCE",
        LDAP_TAG_MODIFY_REQUEST => "MODIFY",
        LDAP_TAG_MODIFY_RESPONSE => "MODIFY_RESPONSE",
        LDAP_TAG_ADD_REQUEST => "ADD",
        LDAP_TAG_ADD_RESPONSE => "ADD_RESPONSE",
        LDAP_TAG_DEL_REQUEST => "DELETE",
        LDAP_TAG_DEL_RESPONSE => "DELETE_RESPONSE",
        LDAP_TAG_MODIFY_DN_REQUEST => "MODIFYDN",
        LDAP_TAG_MODIFY_DN_RESPONSE => "MODIFYDN_RESPONSE",
        LDAP_TAG_COMPARE_REQUEST => "COMPARE",
        LDAP_TAG_COMPARE_RESPONSE => "COMPARE_RESPONSE",
        LDAP_TAG_ABANDON_REQUEST => "ABANDON",
        LDAP_TAG_EXTENDED_REQUEST => "EXTENDED",
        LDAP_TAG_EXTENDED_RESPONSE => "EXTENDED_RESPONSE",
        LDAP_TAG_INTERMEDIATE_RESPONSE => "INTERMEDIATE",
        LDAP_TAG_CONTROLS => "CONTROLS",
        _ => "OP",
    }
}

/// Whether the identifier octet says another tag octet follows.
pub fn tag_continues(first_octet: u8) -> bool {
    (first_octet & BER_HIGH_TAG_NUMBER) == BER_HIGH_TAG_NUMBER
}

pub fn is_constructed(first_octet: u8) -> bool {
    (first_octet & BER_CONSTRUCTED) != 0
}

/// Interpretation of the first length octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOctet {
    /// Short form: the octet is the length.
    Short(usize),
    /// Long form: this many big-endian length octets follow.
    Long(usize),
    /// 0x80, not allowed in LDAP.
    Indefinite,
}

pub fn classify_length_octet(octet: u8) -> LengthOctet {
    if (octet & 0x80) == 0 {
        LengthOctet::Short(octet as usize)
    } else {
        match (octet & 0x7F) as usize {
            0 => LengthOctet::Indefinite,
            n => LengthOctet::Long(n),
        }
    }
}

/// Big-endian length value. Caller guarantees at most MAX_LENGTH_OCTETS octets.
pub fn length_from_octets(octets: &[u8]) -> u64 {
    octets.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Decode a BER INTEGER value (two's complement, big-endian) into i64.
/// Returns None for an empty value or one wider than 64 bits.
pub fn decode_integer(value: &[u8]) -> Option<i64> {
    if value.is_empty() || value.len() > 8 {
        return None;
    }
    let mut result: i64 = if (value[0] & 0x80) != 0 { -1 } else { 0 };
    for &byte in value {
        result = (result << 8) | byte as i64;
    }
    Some(result)
}

/// Tag and length of one TLV record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvHeader {
    /// First identifier octet (class, constructed bit, low tag number bits).
    pub tag: u8,
    /// Octets used by the identifier (1 unless high-tag-number form).
    pub tag_len: usize,
    /// Octets used by identifier plus length.
    pub header_len: usize,
    pub content_len: usize,
}

impl TlvHeader {
    pub fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read identifier octets; returns (first octet, number of octets).
    fn read_tag(&mut self) -> Result<(u8, usize)> {
        let first = self.read_octet()?;
        if !tag_continues(first) {
            return Ok((first, 1));
        }
        let mut len = 1;
        loop {
            if len >= MAX_TAG_OCTETS {
                bail!("Tag number too large: more than {} identifier octets", MAX_TAG_OCTETS);
            }
            let next = self.read_octet()?;
            len += 1;
            if (next & 0x80) == 0 {
                return Ok((first, len));
            }
        }
    }

    fn read_length(&mut self) -> Result<usize> {
        let first = self.read_octet()?;
        match classify_length_octet(first) {
            LengthOctet::Short(len) => Ok(len),
            LengthOctet::Indefinite => bail!("Indefinite length not supported"),
            LengthOctet::Long(n) => {
                if n > MAX_LENGTH_OCTETS {
                    bail!("Length too large: {} bytes", n);
                }
                if self.remaining() < n {
                    bail!("BER truncated: length encoding needs {} bytes, {} remaining", n, self.remaining());
                }
                let value = length_from_octets(&self.data[self.pos..self.pos + n]);
                self.pos += n;
                usize::try_from(value).map_err(|_| anyhow::anyhow!("Length {} does not fit in memory", value))
            }
        }
    }

    fn read_octet(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => bail!("BER truncated: unexpected end of data at offset {}", self.pos),
        }
    }

    /// Read a TLV header at the current position without consuming its content.
    pub(crate) fn read_header(&mut self) -> Result<TlvHeader> {
        let start = self.pos;
        let (tag, tag_len) = self.read_tag()?;
        let content_len = self.read_length()?;
        Ok(TlvHeader {
            tag,
            tag_len,
            header_len: self.pos - start,
            content_len,
        })
    }

    /// Read one complete record and return its byte range (header included).
    pub(crate) fn read_record(&mut self) -> Result<(TlvHeader, Range<usize>)> {
        let start = self.pos;
        let header = self.read_header()?;
        if self.remaining() < header.content_len {
            bail!(
                "BER truncated: record at offset {} needs {} content bytes, {} remaining",
                start,
                header.content_len,
                self.remaining()
            );
        }
        self.pos += header.content_len;
        Ok((header, start..self.pos))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }
}

/// Parse the TLV header at the start of `data`.
pub fn parse_tlv_header(data: &[u8]) -> Result<TlvHeader> {
    BerReader::new(data).read_header()
}

/// Split `content` into its consecutive top-level records.
pub fn split_records(content: &[u8]) -> Result<Vec<Range<usize>>> {
    let mut reader = BerReader::new(content);
    let mut records = Vec::new();
    while reader.remaining() > 0 {
        let (_, range) = reader.read_record()?;
        records.push(range);
    }
    Ok(records)
}

/// Check that `data` is exactly one complete record, nothing more or less.
pub fn validate_single_record(data: &[u8]) -> Result<TlvHeader> {
    let mut reader = BerReader::new(data);
    let (header, _) = reader.read_record()?;
    if reader.remaining() != 0 {
        bail!("{} trailing bytes after record", reader.remaining());
    }
    Ok(header)
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    /// Append already-encoded bytes (a complete record, or multi-octet tag).
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_length(&mut self, length: usize) {
        let encoded = encode_length(length);
        self.buffer.extend_from_slice(&encoded);
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_tag(BER_TAG_INTEGER);
        let bytes = value.to_be_bytes();
        // Drop leading octets that only repeat the sign
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_length(bytes.len() - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(BER_TAG_OCTET_STRING);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(BER_TAG_ENUMERATED);
        self.write_length(1);
        self.buffer.push(value);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(BER_TAG_BOOLEAN);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    /// Start a constructed record with the given identifier octets.
    /// Returns the position of the length placeholder for `end_constructed`.
    pub fn start_constructed(&mut self, tag: &[u8]) -> usize {
        self.buffer.extend_from_slice(tag);
        let length_pos = self.buffer.len();
        self.buffer.push(0);
        length_pos
    }

    /// Back-patch the length of the record started at `length_pos`. Short and long form.
    pub fn end_constructed(&mut self, length_pos: usize) {
        let content_len = self.buffer.len() - (length_pos + 1);
        let encoded = encode_length(content_len);
        self.buffer.splice(length_pos..length_pos + 1, encoded);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(&[BER_TAG_SEQUENCE])
    }

    pub fn end_sequence(&mut self, length_pos: usize) {
        self.end_constructed(length_pos)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Minimal definite-length encoding.
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        return vec![length as u8];
    }
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.push(0x80 | bytes.len() as u8);
    bytes.reverse();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer_bytes(value: i64) -> Vec<u8> {
        let mut writer = BerWriter::new();
        writer.write_integer(value);
        writer.into_vec()
    }

    #[test]
    fn test_ber_writer_integer() {
        assert_eq!(integer_bytes(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer_bytes(127), vec![0x02, 0x01, 0x7F]);
        assert_eq!(integer_bytes(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer_bytes(256), vec![0x02, 0x02, 0x01, 0x00]);
        assert_eq!(integer_bytes(-1), vec![0x02, 0x01, 0xFF]);
        assert_eq!(integer_bytes(-128), vec![0x02, 0x01, 0x80]);
        assert_eq!(integer_bytes(-129), vec![0x02, 0x02, 0xFF, 0x7F]);
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode_integer(&[0x00]), Some(0));
        assert_eq!(decode_integer(&[0x05]), Some(5));
        assert_eq!(decode_integer(&[0x00, 0x80]), Some(128));
        assert_eq!(decode_integer(&[0xFF]), Some(-1));
        assert_eq!(decode_integer(&[0xFF, 0x7F]), Some(-129));
        assert_eq!(decode_integer(&[0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]), Some(i64::MAX));
        assert_eq!(decode_integer(&[]), None);
        assert_eq!(decode_integer(&[0; 9]), None);
    }

    #[test]
    fn test_encode_length() {
        assert_eq!(encode_length(0), vec![0x00]);
        assert_eq!(encode_length(127), vec![0x7F]);
        assert_eq!(encode_length(128), vec![0x81, 0x80]);
        assert_eq!(encode_length(255), vec![0x81, 0xFF]);
        assert_eq!(encode_length(256), vec![0x82, 0x01, 0x00]);
        assert_eq!(encode_length(70_000), vec![0x83, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_ber_writer_sequence() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        writer.write_integer(42);
        writer.write_string("test");
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        assert_eq!(
            result,
            vec![0x30, 0x09, 0x02, 0x01, 0x2A, 0x04, 0x04, b't', b'e', b's', b't']
        );
    }

    #[test]
    fn test_ber_writer_long_length() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        for _ in 0..200 {
            writer.write_string("test");
        }
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        // 200 * 6 = 1200 content bytes -> 0x82 0x04 0xB0
        assert_eq!(&result[..4], &[0x30, 0x82, 0x04, 0xB0]);
        assert_eq!(result.len(), 4 + 1200);
    }

    #[test]
    fn test_ber_writer_boolean_and_enumerated() {
        let mut writer = BerWriter::new();
        writer.write_boolean(true);
        writer.write_boolean(false);
        writer.write_enumerated(3);
        assert_eq!(
            writer.into_vec(),
            vec![0x01, 0x01, 0xFF, 0x01, 0x01, 0x00, 0x0A, 0x01, 0x03]
        );
    }

    #[test]
    fn test_parse_tlv_header_short() {
        let header = parse_tlv_header(&[0x30, 0x0C, 0x02, 0x01, 0x01]).unwrap();
        assert_eq!(header.tag, 0x30);
        assert_eq!(header.tag_len, 1);
        assert_eq!(header.header_len, 2);
        assert_eq!(header.content_len, 12);
        assert_eq!(header.total_len(), 14);
    }

    #[test]
    fn test_parse_tlv_header_long_form() {
        let header = parse_tlv_header(&[0x30, 0x84, 0x00, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(header.header_len, 6);
        assert_eq!(header.content_len, 256);
    }

    #[test]
    fn test_parse_tlv_header_high_tag_number() {
        let header = parse_tlv_header(&[0x5F, 0x81, 0x01, 0x03]).unwrap();
        assert_eq!(header.tag, 0x5F);
        assert_eq!(header.tag_len, 3);
        assert_eq!(header.header_len, 4);
        assert_eq!(header.content_len, 3);
    }

    #[test]
    fn test_parse_tlv_header_errors() {
        assert!(parse_tlv_header(&[]).is_err());
        assert!(parse_tlv_header(&[0x30]).is_err());
        assert!(parse_tlv_header(&[0x30, 0x80]).is_err());
        assert!(parse_tlv_header(&[0x30, 0x82, 0x01]).is_err());
        assert!(parse_tlv_header(&[0x30, 0x89, 0, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_split_records() {
        let content = [0x02, 0x01, 0x05, 0x42, 0x00, 0x04, 0x02, b'h', b'i'];
        let records = split_records(&content).unwrap();
        assert_eq!(records, vec![0..3, 3..5, 5..9]);
        assert!(split_records(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_split_records_truncated() {
        let content = [0x02, 0x01, 0x05, 0x63, 0x10, 0x04];
        assert!(split_records(&content).is_err());
    }

    #[test]
    fn test_validate_single_record() {
        assert!(validate_single_record(&[0x04, 0x01, 0x41]).is_ok());
        assert!(validate_single_record(&[0x04, 0x01, 0x41, 0x00]).is_err());
        assert!(validate_single_record(&[0x04, 0x02, 0x41]).is_err());
        assert!(validate_single_record(&[]).is_err());
    }

    #[test]
    fn test_record_name() {
        assert_eq!(record_name(LDAP_TAG_SEARCH_REQUEST), "SEARCH");
        assert_eq!(record_name(LDAP_TAG_BIND_REQUEST), "BIND");
        assert_eq!(record_name(0x01), "OP");
    }

    #[test]
    fn test_classify_length_octet() {
        assert_eq!(classify_length_octet(0x05), LengthOctet::Short(5));
        assert_eq!(classify_length_octet(0x80), LengthOctet::Indefinite);
        assert_eq!(classify_length_octet(0x82), LengthOctet::Long(2));
    }
}
