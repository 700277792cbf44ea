//! Authenticode SPC structures.
//!
//! These are the Microsoft-defined ASN.1 structures carried inside the
//! PKCS7 envelope: the indirect-data content that binds the image digest,
//! the opus-info attribute with the publisher strings, and the legacy
//! timestamp request. External verifiers check them byte for byte, so the
//! field layouts here must not drift.

use super::der::{
    bmp_content, context, null, octet_string, oid, sequence, tlv, TAG_BIT_STRING,
};

pub const OID_SPC_INDIRECT_DATA: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 4];
pub const OID_SPC_SP_OPUS_INFO: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 12];
pub const OID_SPC_PE_IMAGE_DATA: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 15];
pub const OID_SPC_TIMESTAMP_REQUEST: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 3, 2, 1];

pub const OID_SHA1: &[u64] = &[1, 3, 14, 3, 2, 26];
pub const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
pub const OID_PKCS7_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 1];
pub const OID_PKCS7_SIGNED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 2];
pub const OID_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113549, 1, 9, 3];
pub const OID_MESSAGE_DIGEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 4];
pub const OID_COUNTERSIGNATURE: &[u64] = &[1, 2, 840, 113549, 1, 9, 6];

/// The placeholder file name signtool has emitted since Authenticode v1.
const OBSOLETE_FILE: &str = "<<<Obsolete>>>";

/// `AlgorithmIdentifier { sha1, NULL }`.
pub fn algorithm_sha1() -> Vec<u8> {
    sequence(&[oid(OID_SHA1), null()].concat())
}

/// `AlgorithmIdentifier { rsaEncryption, NULL }`.
pub fn algorithm_rsa() -> Vec<u8> {
    sequence(&[oid(OID_RSA_ENCRYPTION), null()].concat())
}

/// `SpcIndirectDataContent` binding the PE image digest.
///
/// ```text
/// SEQUENCE {
///   data SpcAttributeTypeAndOptionalValue {
///     type  SPC_PE_IMAGE_DATA_OBJID,
///     value SpcPeImageData {
///       flags BIT STRING (empty),
///       file  [0] { SpcLink file [2] { SpcString unicode [0] "<<<Obsolete>>>" } }
///     }
///   },
///   messageDigest DigestInfo { sha1, OCTET STRING digest }
/// }
/// ```
pub fn spc_indirect_data_content(digest: &[u8]) -> Vec<u8> {
    // The BMPString is re-tagged as the [0] IMPLICIT `unicode` choice arm.
    let unicode = context(0, false, &bmp_content(OBSOLETE_FILE));
    let spc_link = context(2, true, &unicode);
    let file = context(0, true, &spc_link);

    let flags = tlv(TAG_BIT_STRING, &[0]);
    let pe_image_data = sequence(&[flags, file].concat());
    let data = sequence(&[oid(OID_SPC_PE_IMAGE_DATA), pe_image_data].concat());

    let digest_info = sequence(&[algorithm_sha1(), octet_string(digest)].concat());
    sequence(&[data, digest_info].concat())
}

/// `SpcSpOpusInfo` with the optional program name and publisher URL.
pub fn spc_sp_opus_info(description: Option<&str>, url: Option<&str>) -> Vec<u8> {
    let mut content = Vec::new();
    if let Some(description) = description {
        let unicode = context(0, false, &bmp_content(description));
        content.extend_from_slice(&context(0, true, &unicode));
    }
    if let Some(url) = url {
        let url_arm = context(0, false, url.as_bytes());
        content.extend_from_slice(&context(1, true, &url_arm));
    }
    sequence(&content)
}

/// `SpcTimeStampRequest` wrapping the raw signature bytes, the body POSTed
/// (base64-encoded) to a legacy Authenticode timestamp authority.
pub fn spc_timestamp_request(signature: &[u8]) -> Vec<u8> {
    let content = sequence(
        &[
            oid(OID_PKCS7_DATA),
            context(0, true, &octet_string(signature)),
        ]
        .concat(),
    );
    sequence(&[oid(OID_SPC_TIMESTAMP_REQUEST), content].concat())
}
