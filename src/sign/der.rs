//! Minimal DER encode/decode helpers.
//!
//! The Authenticode structures this crate emits (SpcIndirectDataContent,
//! SpcSpOpusInfo, PKCS7 SignedData) predate every mainstream ASN.1 schema
//! library and external verifiers are strict about their exact layout, so
//! the encoders assemble bytes directly. The reader is just enough TLV
//! walking to pick certificates and SignerInfos out of containers we did
//! not produce.

use crate::error::{DeployError, DeployResult};

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_BMP_STRING: u8 = 0x1E;

/// Encode a DER length field (short or long form as required).
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else if length < 0x100 {
        vec![0x81, length as u8]
    } else if length < 0x1_0000 {
        vec![0x82, (length >> 8) as u8, length as u8]
    } else {
        vec![0x83, (length >> 16) as u8, (length >> 8) as u8, length as u8]
    }
}

/// One tag-length-value triple.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + content.len());
    out.push(tag);
    out.extend_from_slice(&encode_length(content.len()));
    out.extend_from_slice(content);
    out
}

pub fn sequence(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, content)
}

pub fn set(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SET, content)
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, content)
}

pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

/// INTEGER from a non-negative value.
pub fn integer(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 && bytes[start] == 0 {
        start += 1;
    }
    let mut content = bytes[start..].to_vec();
    if content[0] & 0x80 != 0 {
        content.insert(0, 0);
    }
    tlv(TAG_INTEGER, &content)
}

/// Context-specific tag. `constructed` picks `[n]` vs `[n] IMPLICIT` of a
/// primitive type.
pub fn context(number: u8, constructed: bool, content: &[u8]) -> Vec<u8> {
    let tag = 0x80 | number | if constructed { 0x20 } else { 0 };
    tlv(tag, content)
}

/// OBJECT IDENTIFIER from its arc values.
pub fn oid(arcs: &[u64]) -> Vec<u8> {
    debug_assert!(arcs.len() >= 2);
    let mut content = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        content.extend_from_slice(&encode_base128(arc));
    }
    tlv(TAG_OID, &content)
}

fn encode_base128(mut value: u64) -> Vec<u8> {
    let mut out = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value != 0 {
        out.insert(0, 0x80 | (value & 0x7F) as u8);
        value >>= 7;
    }
    out
}

/// The raw UTF-16BE bytes of a BMPString value, without tag or length.
/// Callers tag them as `TAG_BMP_STRING` or an IMPLICIT context arm.
pub fn bmp_content(text: &str) -> Vec<u8> {
    let mut content = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        content.extend_from_slice(&unit.to_be_bytes());
    }
    content
}

/// UTF-16BE string, the SpcString `unicode` arm.
pub fn bmp_string(text: &str) -> Vec<u8> {
    tlv(TAG_BMP_STRING, &bmp_content(text))
}

pub fn ia5_string(text: &str) -> Vec<u8> {
    tlv(TAG_IA5_STRING, text.as_bytes())
}

/// One decoded TLV: the tag, the value bytes, and the full encoding
/// including its header (needed when a structure is re-embedded verbatim).
#[derive(Debug, Clone, Copy)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
    pub raw: &'a [u8],
}

/// Sequential TLV reader over a byte slice.
#[derive(Debug)]
pub struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        DerReader { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read the next TLV at the cursor.
    pub fn read(&mut self) -> DeployResult<Tlv<'a>> {
        let start = self.pos;
        let data = self.data;
        if start + 2 > data.len() {
            return Err(DeployError::BadSignature("truncated DER element".into()));
        }
        let tag = data[start];
        let mut cursor = start + 1;
        let first = data[cursor];
        cursor += 1;
        let length = if first < 0x80 {
            usize::from(first)
        } else {
            let count = usize::from(first & 0x7F);
            if count == 0 || count > 4 || cursor + count > data.len() {
                return Err(DeployError::BadSignature("bad DER length".into()));
            }
            let mut length = 0usize;
            for _ in 0..count {
                length = (length << 8) | usize::from(data[cursor]);
                cursor += 1;
            }
            length
        };
        let end = cursor
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| DeployError::BadSignature("DER length exceeds buffer".into()))?;
        self.pos = end;
        Ok(Tlv {
            tag,
            content: &data[cursor..end],
            raw: &data[start..end],
        })
    }

    /// Read the next TLV and require its tag.
    pub fn expect(&mut self, tag: u8) -> DeployResult<Tlv<'a>> {
        let tlv = self.read()?;
        if tlv.tag != tag {
            return Err(DeployError::BadSignature(format!(
                "expected DER tag {tag:#04x}, found {:#04x}",
                tlv.tag
            )));
        }
        Ok(tlv)
    }
}
