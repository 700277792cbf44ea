//! PKCS7 `SignedData` assembly for Authenticode.
//!
//! The envelope is built byte-up rather than through a PKCS7 API: verifiers
//! of Authenticode signatures are strict about attribute ordering, the
//! certificate order (reversed, leaf last) and the content-detachment
//! convention, all of which predate standard library support.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use sha1::{Digest, Sha1};

use super::der::{
    context, integer, octet_string, oid, sequence, set, DerReader, TAG_INTEGER, TAG_OID,
    TAG_SEQUENCE, TAG_SET,
};
use super::spc::{
    algorithm_rsa, algorithm_sha1, spc_sp_opus_info, OID_CONTENT_TYPE, OID_COUNTERSIGNATURE,
    OID_MESSAGE_DIGEST, OID_PKCS7_SIGNED_DATA, OID_SPC_INDIRECT_DATA, OID_SPC_SP_OPUS_INFO,
};
use crate::error::{DeployError, DeployResult};

/// Everything needed to produce one signature envelope.
pub struct SignRequest<'a> {
    /// `SpcIndirectDataContent` DER, the signed content.
    pub content: &'a [u8],
    /// Certificate chain in container order; embedded reversed.
    pub certificates: &'a [X509],
    pub key: &'a PKey<Private>,
    pub description: Option<&'a str>,
    pub url: Option<&'a str>,
}

/// A countersignature parsed out of a timestamp authority's response.
pub struct Countersignature {
    /// Raw DER certificates to merge into the outer envelope.
    pub certificates: Vec<Vec<u8>>,
    /// The authority's SignerInfo, attached verbatim as an unsigned
    /// attribute.
    pub signer_info: Vec<u8>,
}

/// The signature over the authenticated attributes. This is what a
/// timestamp authority countersigns.
pub fn compute_signature(request: &SignRequest<'_>) -> DeployResult<Vec<u8>> {
    let attrs = authenticated_attributes(request)?;
    let mut signer = Signer::new(MessageDigest::sha1(), request.key)?;
    signer.update(&set(&attrs))?;
    Ok(signer.sign_to_vec()?)
}

/// Assemble the complete `ContentInfo { signedData }` DER.
pub fn build_signed_data(
    request: &SignRequest<'_>,
    signature: &[u8],
    countersignature: Option<&Countersignature>,
) -> DeployResult<Vec<u8>> {
    let leaf = request
        .certificates
        .first()
        .ok_or(DeployError::BadCertificate("empty certificate chain".into()))?;
    let attrs = authenticated_attributes(request)?;

    let mut signer_info = Vec::new();
    signer_info.extend_from_slice(&integer(1));
    signer_info.extend_from_slice(&issuer_and_serial(leaf)?);
    signer_info.extend_from_slice(&algorithm_sha1());
    signer_info.extend_from_slice(&context(0, true, &attrs));
    signer_info.extend_from_slice(&algorithm_rsa());
    signer_info.extend_from_slice(&octet_string(signature));
    if let Some(counter) = countersignature {
        let attribute = sequence(
            &[oid(OID_COUNTERSIGNATURE), set(&counter.signer_info)].concat(),
        );
        signer_info.extend_from_slice(&context(1, true, &attribute));
    }
    let signer_info = sequence(&signer_info);

    // Certificates go in reverse container order (root first, leaf last);
    // the timestamp authority's own chain is appended after ours.
    let mut certificates = Vec::new();
    for cert in request.certificates.iter().rev() {
        certificates.extend_from_slice(&cert.to_der()?);
    }
    if let Some(counter) = countersignature {
        for der in &counter.certificates {
            certificates.extend_from_slice(der);
        }
    }

    let content_info = sequence(
        &[
            oid(OID_SPC_INDIRECT_DATA),
            context(0, true, request.content),
        ]
        .concat(),
    );

    let mut signed_data = Vec::new();
    signed_data.extend_from_slice(&integer(1));
    signed_data.extend_from_slice(&set(&algorithm_sha1()));
    signed_data.extend_from_slice(&content_info);
    signed_data.extend_from_slice(&context(0, true, &certificates));
    signed_data.extend_from_slice(&set(&signer_info));

    Ok(sequence(
        &[
            oid(OID_PKCS7_SIGNED_DATA),
            context(0, true, &sequence(&signed_data)),
        ]
        .concat(),
    ))
}

/// The three authenticated attributes, in the order verifiers expect:
/// contentType, SpcSpOpusInfo, messageDigest. Returned as the concatenated
/// attribute SEQUENCEs (callers wrap them as `[0] IMPLICIT` or `SET OF`).
fn authenticated_attributes(request: &SignRequest<'_>) -> DeployResult<Vec<u8>> {
    let content_type = attribute(OID_CONTENT_TYPE, &oid(OID_SPC_INDIRECT_DATA));
    let opus = attribute(
        OID_SPC_SP_OPUS_INFO,
        &spc_sp_opus_info(request.description, request.url),
    );

    // PKCS7 content detachment: the digest covers the value bytes of the
    // content, not its outer SEQUENCE header.
    let mut reader = DerReader::new(request.content);
    let content = reader.expect(TAG_SEQUENCE)?;
    let digest = Sha1::digest(content.content);
    let message_digest = attribute(OID_MESSAGE_DIGEST, &octet_string(&digest));

    Ok([content_type, opus, message_digest].concat())
}

fn attribute(attr_oid: &[u64], value: &[u8]) -> Vec<u8> {
    sequence(&[oid(attr_oid), set(value)].concat())
}

/// `IssuerAndSerialNumber` lifted straight out of the certificate DER so
/// the encoding matches the issuer's byte for byte.
fn issuer_and_serial(certificate: &X509) -> DeployResult<Vec<u8>> {
    let der = certificate.to_der()?;
    let mut outer = DerReader::new(&der);
    let cert = outer.expect(TAG_SEQUENCE)?;
    let mut fields = DerReader::new(cert.content);
    let tbs = fields.expect(TAG_SEQUENCE)?;

    let mut tbs_fields = DerReader::new(tbs.content);
    let mut element = tbs_fields.read()?;
    if element.tag == 0xA0 {
        // Explicit version field; the serial number follows.
        element = tbs_fields.read()?;
    }
    if element.tag != TAG_INTEGER {
        return Err(DeployError::BadCertificate(
            "certificate has no serial number".into(),
        ));
    }
    let serial = element.raw.to_vec();
    tbs_fields.expect(TAG_SEQUENCE)?; // signature algorithm
    let issuer = tbs_fields.expect(TAG_SEQUENCE)?.raw.to_vec();

    Ok(sequence(&[issuer, serial].concat()))
}

/// Pull the certificates and the first SignerInfo out of a timestamp
/// authority's PKCS7 response.
pub fn parse_timestamp_response(der: &[u8]) -> DeployResult<Countersignature> {
    let bad = |what: &str| DeployError::BadTimestampResponse(what.into());

    let mut outer = DerReader::new(der);
    let content_info = outer
        .expect(TAG_SEQUENCE)
        .map_err(|_| bad("response is not a ContentInfo"))?;
    let mut fields = DerReader::new(content_info.content);
    fields.expect(TAG_OID).map_err(|_| bad("missing content type"))?;
    let wrapped = fields.read().map_err(|_| bad("missing SignedData"))?;

    let mut signed_outer = DerReader::new(wrapped.content);
    let signed_data = signed_outer
        .expect(TAG_SEQUENCE)
        .map_err(|_| bad("malformed SignedData"))?;

    let mut elements = DerReader::new(signed_data.content);
    elements
        .expect(TAG_INTEGER)
        .map_err(|_| bad("missing version"))?;
    elements
        .expect(TAG_SET)
        .map_err(|_| bad("missing digest algorithms"))?;
    elements
        .expect(TAG_SEQUENCE)
        .map_err(|_| bad("missing content info"))?;

    let mut certificates = Vec::new();
    let mut signer_info = None;
    while !elements.is_empty() {
        let element = elements.read().map_err(|_| bad("malformed element"))?;
        match element.tag {
            0xA0 => {
                let mut list = DerReader::new(element.content);
                while !list.is_empty() {
                    let cert = list.read().map_err(|_| bad("malformed certificate"))?;
                    certificates.push(cert.raw.to_vec());
                }
            }
            TAG_SET => {
                let mut infos = DerReader::new(element.content);
                let first = infos.read().map_err(|_| bad("empty SignerInfos"))?;
                signer_info = Some(first.raw.to_vec());
            }
            _ => {}
        }
    }

    Ok(Countersignature {
        certificates,
        signer_info: signer_info.ok_or_else(|| bad("response carries no SignerInfo"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::spc::spc_indirect_data_content;
    use openssl::rsa::Rsa;

    fn test_identity() -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap();
        let mut name = openssl::x509::X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Deploy Test").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        let mut serial = openssl::bn::BigNum::new().unwrap();
        serial.rand(64, openssl::bn::MsbOption::MAYBE_ZERO, false).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder
            .sign(&key, openssl::hash::MessageDigest::sha256())
            .unwrap();
        (builder.build(), key)
    }

    #[test]
    fn test_issuer_and_serial_matches_cert() {
        let (cert, _) = test_identity();
        let encoded = issuer_and_serial(&cert).unwrap();

        let mut outer = DerReader::new(&encoded);
        let pair = outer.expect(TAG_SEQUENCE).unwrap();
        let mut fields = DerReader::new(pair.content);
        let issuer = fields.expect(TAG_SEQUENCE).unwrap();
        let serial = fields.expect(TAG_INTEGER).unwrap();
        assert!(fields.is_empty());

        // Both fields are verbatim slices of the certificate DER.
        let cert_der = cert.to_der().unwrap();
        assert!(cert_der
            .windows(issuer.raw.len())
            .any(|window| window == issuer.raw));
        assert!(cert_der
            .windows(serial.raw.len())
            .any(|window| window == serial.raw));
    }

    #[test]
    fn test_signature_is_deterministic_over_content() {
        let (cert, key) = test_identity();
        let content = spc_indirect_data_content(&[0x11; 20]);
        let certificates = [cert];
        let request = SignRequest {
            content: &content,
            certificates: &certificates,
            key: &key,
            description: Some("Test App"),
            url: None,
        };
        // RSA PKCS#1 v1.5 is deterministic: same attrs, same signature.
        let first = compute_signature(&request).unwrap();
        let second = compute_signature(&request).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_envelope_structure() {
        let (cert, key) = test_identity();
        let content = spc_indirect_data_content(&[0x22; 20]);
        let certificates = [cert];
        let request = SignRequest {
            content: &content,
            certificates: &certificates,
            key: &key,
            description: None,
            url: Some("https://example.com"),
        };
        let signature = compute_signature(&request).unwrap();
        let envelope = build_signed_data(&request, &signature, None).unwrap();

        // The envelope itself must parse as a ContentInfo holding our
        // certificate and exactly one SignerInfo.
        let parsed = parse_timestamp_response(&envelope);
        assert!(parsed.is_ok());
        let parsed = parsed.unwrap();
        assert_eq!(parsed.certificates.len(), 1);
        assert_eq!(
            parsed.certificates[0],
            certificates[0].to_der().unwrap()
        );
        assert!(!parsed.signer_info.is_empty());
    }

    #[test]
    fn test_countersignature_attached() {
        let (cert, key) = test_identity();
        let content = spc_indirect_data_content(&[0x33; 20]);
        let certificates = [cert];
        let request = SignRequest {
            content: &content,
            certificates: &certificates,
            key: &key,
            description: None,
            url: None,
        };
        let signature = compute_signature(&request).unwrap();

        // Fake a countersignature out of our own envelope.
        let plain = build_signed_data(&request, &signature, None).unwrap();
        let counter = parse_timestamp_response(&plain).unwrap();
        let stamped = build_signed_data(&request, &signature, Some(&counter)).unwrap();

        assert!(stamped.len() > plain.len());
        // Two certificate entries now: ours plus the "authority's".
        let reparsed = parse_timestamp_response(&stamped).unwrap();
        assert_eq!(reparsed.certificates.len(), 2);
    }
}
