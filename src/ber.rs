// BER encoding/decoding primitives for the subset of ASN.1 used by LDAP v3.
// Readers are scoped: a constructed element yields a child reader over its
// content only, so `remaining()` never runs past the enclosing element.

use crate::error::{CodecError, CodecResult};

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Largest long-form length encoding we accept, in octets.
const MAX_LENGTH_OCTETS: usize = 4;

pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_tag(&mut self) -> CodecResult<u8> {
        let tag = self
            .peek_tag()
            .ok_or_else(|| CodecError::decode("BER truncated: expected tag"))?;
        if tag & 0x1F == 0x1F {
            return Err(CodecError::decode(format!(
                "multi-byte tags not supported: 0x{:02X}",
                tag
            )));
        }
        self.pos += 1;
        Ok(tag)
    }

    pub fn read_length(&mut self) -> CodecResult<usize> {
        let first_byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| CodecError::decode("BER truncated: expected length"))?;
        self.pos += 1;

        if first_byte & 0x80 == 0 {
            return Ok(first_byte as usize);
        }
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(CodecError::decode("indefinite length not supported"));
        }
        if length_bytes > MAX_LENGTH_OCTETS {
            return Err(CodecError::decode(format!(
                "length too large: {} bytes",
                length_bytes
            )));
        }
        let bytes = self.read_bytes(length_bytes)?;
        Ok(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
    }

    pub fn read_bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::decode(format!(
                "BER truncated: need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one complete TLV and return `(tag, content)`.
    pub fn read_element(&mut self) -> CodecResult<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let content = self.read_bytes(length)?;
        Ok((tag, content))
    }

    /// Read one TLV whose tag must equal `expected`.
    pub fn read_expected(&mut self, expected: u8, what: &str) -> CodecResult<&'a [u8]> {
        let (tag, content) = self.read_element()?;
        if tag != expected {
            return Err(CodecError::decode(format!(
                "expected {} tag 0x{:02X}, got 0x{:02X}",
                what, expected, tag
            )));
        }
        Ok(content)
    }

    pub fn read_integer(&mut self) -> CodecResult<i64> {
        decode_integer(self.read_expected(TAG_INTEGER, "INTEGER")?)
    }

    pub fn read_enumerated(&mut self) -> CodecResult<i64> {
        decode_integer(self.read_expected(TAG_ENUMERATED, "ENUMERATED")?)
    }

    pub fn read_boolean(&mut self) -> CodecResult<bool> {
        let content = self.read_expected(TAG_BOOLEAN, "BOOLEAN")?;
        decode_boolean(content)
    }

    pub fn read_octet_string(&mut self) -> CodecResult<&'a [u8]> {
        self.read_expected(TAG_OCTET_STRING, "OCTET STRING")
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        decode_utf8(self.read_octet_string()?)
    }

    /// Read a SEQUENCE and return a reader over its content.
    pub fn read_sequence(&mut self) -> CodecResult<BerReader<'a>> {
        Ok(BerReader::new(self.read_expected(TAG_SEQUENCE, "SEQUENCE")?))
    }
}

pub fn decode_integer(content: &[u8]) -> CodecResult<i64> {
    if content.is_empty() {
        return Err(CodecError::decode("INTEGER with zero length"));
    }
    if content.len() > 8 {
        return Err(CodecError::decode(format!(
            "integer too large: {} bytes",
            content.len()
        )));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i64;
    }
    Ok(value)
}

pub fn decode_boolean(content: &[u8]) -> CodecResult<bool> {
    if content.len() != 1 {
        return Err(CodecError::decode(format!(
            "boolean value must be 1 byte, got: {}",
            content.len()
        )));
    }
    Ok(content[0] != 0)
}

pub fn decode_utf8(content: &[u8]) -> CodecResult<String> {
    String::from_utf8(content.to_vec()).map_err(|_| CodecError::decode("invalid UTF-8 string"))
}

/// Size of the first TLV in `buf` once all of it is buffered.
pub fn complete_element_len(buf: &[u8]) -> CodecResult<Option<usize>> {
    Ok(declared_element_len(buf)?.filter(|&total| buf.len() >= total))
}

pub fn declared_element_len(buf: &[u8]) -> CodecResult<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first_byte = buf[1];
    let (header, content) = if first_byte & 0x80 == 0 {
        // Short form
        (2, first_byte as usize)
    } else {
        // Long form
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > MAX_LENGTH_OCTETS {
            return Err(CodecError::decode("invalid length encoding"));
        }
        if buf.len() < 2 + length_bytes {
            return Ok(None);
        }
        let length = buf[2..2 + length_bytes]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (2 + length_bytes, length)
    };
    Ok(Some(header + content))
}

pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    pub fn write_length(&mut self, length: usize) {
        self.buffer.extend_from_slice(&length_octets(length));
    }

    /// Primitive TLV with an arbitrary tag.
    pub fn write_primitive(&mut self, tag: u8, content: &[u8]) {
        self.write_tag(tag);
        self.write_length(content.len());
        self.buffer.extend_from_slice(content);
    }

    pub fn write_integer(&mut self, value: i64) {
        self.write_primitive(TAG_INTEGER, &integer_content(value));
    }

    pub fn write_enumerated(&mut self, value: i64) {
        self.write_primitive(TAG_ENUMERATED, &integer_content(value));
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_primitive(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_primitive(TAG_OCTET_STRING, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Open a constructed element; returns the position of its length placeholder.
    /// Must be paired with [`BerWriter::end`].
    pub fn start(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start(TAG_SEQUENCE)
    }

    /// Back-patch the length of the element opened at `pos` (short or long form).
    pub fn end(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        let octets = length_octets(content_len);
        self.buffer[pos] = octets[0];
        if octets.len() > 1 {
            self.buffer.splice(pos + 1..pos + 1, octets[1..].iter().copied());
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn length_octets(length: usize) -> Vec<u8> {
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

/// Minimal two's complement big-endian content octets.
fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}
