//! `VS_VERSIONINFO` resource construction.
//!
//! The resource is a little header/value/children tree of its own, distinct
//! from the resource directory that carries it: each node is a 6-byte
//! header, a NUL-terminated UTF-16 key, and a value and children each
//! aligned to 32 bits. Built bottom-up from the caller's key/value strings
//! and serialized in one pass with back-patched lengths.

use crate::error::DeployResult;
use crate::pe::resource::{install, ResourceData, ResourceNode, DEFAULT_LOCALE, RT_VERSION};

const VS_FFI_SIGNATURE: u32 = 0xFEEF_04BD;
const VS_FFI_STRUCVERSION: u32 = 0x0001_0000;
const VS_FFI_FILEFLAGSMASK: u32 = 0x0000_003F;
const VOS_NT_WINDOWS32: u32 = 0x0004_0004;
const VFT_APP: u32 = 0x0000_0001;

/// US-English, Unicode codepage; matches the StringTable key `040904b0`.
const TRANSLATION: [u8; 4] = [0x09, 0x04, 0xB0, 0x04];

/// Parse `"a.b.c.d"` into four packed 16-bit fields.
///
/// Malformed input yields 0 rather than an error: version metadata is
/// cosmetic and a bad string must not abort a deploy that is otherwise fine.
pub fn parse_version_string(version: &str) -> u64 {
    let mut parts = version.split('.');
    let mut packed: u64 = 0;
    for shift in [48u32, 32, 16, 0] {
        let field = match parts.next().and_then(|p| p.parse::<u16>().ok()) {
            Some(value) => value,
            None => return 0,
        };
        packed |= u64::from(field) << shift;
    }
    if parts.next().is_some() {
        return 0;
    }
    packed
}

enum VersionValue {
    None,
    Binary(Vec<u8>),
    Text(String),
}

struct VersionNode {
    key: String,
    value: VersionValue,
    children: Vec<VersionNode>,
}

impl VersionNode {
    fn serialize(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&[0, 0]); // wLength, patched at the end

        let (value_length, value_type, value_bytes) = match &self.value {
            VersionValue::None => (0u16, 0u16, Vec::new()),
            VersionValue::Binary(bytes) => (bytes.len() as u16, 0, bytes.clone()),
            VersionValue::Text(text) => {
                let mut bytes = Vec::new();
                for unit in text.encode_utf16().chain(std::iter::once(0)) {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                }
                // Text values count wValueLength in 16-bit units.
                ((bytes.len() / 2) as u16, 1, bytes)
            }
        };
        out.extend_from_slice(&value_length.to_le_bytes());
        out.extend_from_slice(&value_type.to_le_bytes());

        for unit in self.key.encode_utf16().chain(std::iter::once(0)) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        pad32(out);
        out.extend_from_slice(&value_bytes);

        for child in &self.children {
            pad32(out);
            child.serialize(out);
        }

        let length = (out.len() - start) as u16;
        out[start..start + 2].copy_from_slice(&length.to_le_bytes());
    }
}

fn pad32(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn fixed_file_info(file_version: u64, product_version: u64) -> Vec<u8> {
    let fields = [
        VS_FFI_SIGNATURE,
        VS_FFI_STRUCVERSION,
        (file_version >> 32) as u32,
        file_version as u32,
        (product_version >> 32) as u32,
        product_version as u32,
        VS_FFI_FILEFLAGSMASK,
        0, // dwFileFlags
        VOS_NT_WINDOWS32,
        VFT_APP,
        0, // dwFileSubtype
        0, // dwFileDateMS
        0, // dwFileDateLS
    ];
    let mut out = Vec::with_capacity(fields.len() * 4);
    for field in fields {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out
}

/// Serialize a complete `VS_VERSIONINFO` resource from the caller's
/// key/value strings. `FileVersion` and `ProductVersion` entries also feed
/// the fixed binary header.
pub fn build_version_info(entries: &[(String, String)]) -> Vec<u8> {
    let lookup = |key: &str| {
        entries
            .iter()
            .find(|(name, _)| name == key)
            .map_or(0, |(_, value)| parse_version_string(value))
    };
    let file_version = lookup("FileVersion");
    let product_version = lookup("ProductVersion");

    let translation = VersionNode {
        key: "Translation".into(),
        value: VersionValue::Binary(TRANSLATION.to_vec()),
        children: Vec::new(),
    };
    let var_file_info = VersionNode {
        key: "VarFileInfo".into(),
        value: VersionValue::None,
        children: vec![translation],
    };

    let strings = entries
        .iter()
        .map(|(key, value)| VersionNode {
            key: key.clone(),
            value: VersionValue::Text(value.clone()),
            children: Vec::new(),
        })
        .collect();
    let string_table = VersionNode {
        key: "040904b0".into(),
        value: VersionValue::None,
        children: strings,
    };
    let string_file_info = VersionNode {
        key: "StringFileInfo".into(),
        value: VersionValue::None,
        children: vec![string_table],
    };

    let root = VersionNode {
        key: "VS_VERSION_INFO".into(),
        value: VersionValue::Binary(fixed_file_info(file_version, product_version)),
        children: vec![var_file_info, string_file_info],
    };

    let mut out = Vec::new();
    root.serialize(&mut out);
    out
}

/// Build and install the version resource at RT_VERSION → 1 → US English.
pub fn add_version_info(
    root: &mut ResourceNode,
    entries: &[(String, String)],
) -> DeployResult<()> {
    install(
        root,
        RT_VERSION,
        1,
        DEFAULT_LOCALE,
        ResourceData::Owned(build_version_info(entries)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_packing() {
        assert_eq!(
            parse_version_string("1.2.3.4"),
            (1u64 << 48) | (2 << 32) | (3 << 16) | 4
        );
        assert_eq!(parse_version_string("0.0.0.0"), 0);
        assert_eq!(parse_version_string("65535.0.0.1"), (65535u64 << 48) | 1);
    }

    #[test]
    fn test_version_string_fails_soft() {
        assert_eq!(parse_version_string("notaversion"), 0);
        assert_eq!(parse_version_string("1.2.3"), 0);
        assert_eq!(parse_version_string("1.2.3.4.5"), 0);
        assert_eq!(parse_version_string("1.2.3.999999"), 0);
        assert_eq!(parse_version_string(""), 0);
    }

    #[test]
    fn test_root_node_shape() {
        let entries = vec![
            ("FileVersion".to_string(), "1.2.3.4".to_string()),
            ("ProductName".to_string(), "Example".to_string()),
        ];
        let bytes = build_version_info(&entries);

        // wLength covers the whole buffer; wValueLength is the 52-byte
        // fixed info; the root key follows the 6-byte header.
        let length = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(length, bytes.len());
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 52);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0);
        assert_eq!(&bytes[6..8], &[b'V', 0]);

        // Fixed info starts with the VS_FIXEDFILEINFO signature at the
        // first 32-bit boundary after the NUL-terminated key.
        let key_end = 6 + ("VS_VERSION_INFO".len() + 1) * 2;
        let value_start = (key_end + 3) & !3;
        assert_eq!(
            u32::from_le_bytes([
                bytes[value_start],
                bytes[value_start + 1],
                bytes[value_start + 2],
                bytes[value_start + 3],
            ]),
            VS_FFI_SIGNATURE
        );
        // dwFileVersionMS/LS carry the packed FileVersion halves.
        assert_eq!(
            u32::from_le_bytes([
                bytes[value_start + 8],
                bytes[value_start + 9],
                bytes[value_start + 10],
                bytes[value_start + 11],
            ]),
            0x0001_0002
        );
    }

    fn utf16(text: &str) -> Vec<u8> {
        text.encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_children_are_32bit_aligned() {
        let entries = vec![("ProductName".to_string(), "odd".to_string())];
        let bytes = build_version_info(&entries);

        for key in ["VarFileInfo", "StringFileInfo", "040904b0", "Translation"] {
            let needle = utf16(key);
            let at = bytes
                .windows(needle.len())
                .position(|window| window == needle)
                .unwrap();
            // The key sits 6 bytes into its node; the node itself starts on
            // a 32-bit boundary.
            assert_eq!((at - 6) % 4, 0, "{key} node is misaligned");
        }
        let translation = bytes
            .windows(TRANSLATION.len())
            .position(|window| window == TRANSLATION);
        assert!(translation.is_some());
    }
}
