//! Signing key and certificate loading.
//!
//! Keys arrive either as PKCS12 bundles or in Microsoft's legacy PVK
//! container: a small header, an optional RC4 salt, then a CAPI private-key
//! blob whose RSA components are stored little-endian. Certificates arrive
//! as a PKCS7 SignedData container (DER, or base64/PEM wrapped) that holds
//! no signed content, just the chain.

use std::fs;
use std::path::Path;

use openssl::bn::BigNum;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::symm::{decrypt, Cipher};
use openssl::x509::X509;
use sha1::{Digest, Sha1};

use super::der::{DerReader, TAG_OID, TAG_SEQUENCE};
use crate::error::{DeployError, DeployResult};
use crate::layout;

const PVK_MAGIC: u32 = 0xB0B5_F11E;
const RSA2_MAGIC: &[u8; 4] = b"RSA2";
const BLOB_HEADER_SIZE: usize = 8;

layout! {
    le struct PvkHeader {
        pub magic: u32,
        pub reserved: u32,
        pub key_type: u32,
        pub is_encrypted: u32,
        pub salt_length: u32,
        pub key_length: u32,
    }
}

/// Load a private key from a PVK or PKCS12 file.
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> DeployResult<PKey<Private>> {
    let bytes = fs::read(path)?;
    if bytes.len() >= 4 && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == PVK_MAGIC
    {
        return parse_pvk(&bytes, passphrase);
    }
    let parsed = Pkcs12::from_der(&bytes)
        .map_err(|e| DeployError::BadPrivateKey(format!("not a PVK or PKCS12 file: {e}")))?
        .parse2(passphrase.unwrap_or(""))?;
    parsed
        .pkey
        .ok_or_else(|| DeployError::BadPrivateKey("PKCS12 bundle holds no key".into()))
}

fn parse_pvk(bytes: &[u8], passphrase: Option<&str>) -> DeployResult<PKey<Private>> {
    let header = PvkHeader::read_from(bytes)?;
    if header.magic != PVK_MAGIC {
        return Err(DeployError::BadMagic("PVK"));
    }

    let salt_end = PvkHeader::SIZE + header.salt_length as usize;
    let key_end = salt_end + header.key_length as usize;
    if key_end > bytes.len() {
        return Err(DeployError::Truncated("PVK key material"));
    }
    let salt = &bytes[PvkHeader::SIZE..salt_end];
    let blob = &bytes[salt_end..key_end];
    if blob.len() < BLOB_HEADER_SIZE + 12 {
        return Err(DeployError::Truncated("PVK key blob"));
    }

    // The blob header itself is never encrypted; RC4 covers the RSA2 key
    // material that follows it.
    let material = if header.is_encrypted != 0 {
        let passphrase = passphrase.ok_or_else(|| {
            DeployError::BadPrivateKey("PVK file is encrypted but no passphrase was given".into())
        })?;
        decrypt_key_material(salt, passphrase, &blob[BLOB_HEADER_SIZE..])?
    } else {
        blob[BLOB_HEADER_SIZE..].to_vec()
    };

    parse_rsa2(&material)
}

/// Derive the RC4 key and decrypt, preferring the export-unrestricted
/// "strong" 16-byte key and falling back to the crippled 40-bit variant
/// older tools produced. Whichever decrypts to an `RSA2` tag wins.
fn decrypt_key_material(salt: &[u8], passphrase: &str, data: &[u8]) -> DeployResult<Vec<u8>> {
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(passphrase.as_bytes());
    let derived = hasher.finalize();

    let mut strong_key = [0u8; 16];
    strong_key.copy_from_slice(&derived[..16]);

    let mut weak_key = [0u8; 16];
    weak_key[..5].copy_from_slice(&derived[..5]);

    for key in [strong_key, weak_key] {
        let plain = decrypt(Cipher::rc4(), &key, None, data)?;
        if plain.starts_with(RSA2_MAGIC) {
            return Ok(plain);
        }
    }
    Err(DeployError::BadPrivateKey(
        "PVK decryption failed with both key derivations (wrong passphrase?)".into(),
    ))
}

/// Reassemble an RSA private key from a CAPI `RSA2` blob.
fn parse_rsa2(blob: &[u8]) -> DeployResult<PKey<Private>> {
    if !blob.starts_with(RSA2_MAGIC) {
        return Err(DeployError::BadMagic("RSA2"));
    }
    if blob.len() < 12 {
        return Err(DeployError::Truncated("RSA2 blob"));
    }
    let bit_length = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    let byte_length = bit_length / 8;
    let half_length = bit_length / 16;
    // The public exponent alone is a fixed 32-bit little-endian field.
    let e = BigNum::from_u32(u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]))?;

    let mut cursor = 12;
    let mut component = |length: usize| -> DeployResult<BigNum> {
        let end = cursor + length;
        let bytes = blob
            .get(cursor..end)
            .ok_or(DeployError::Truncated("RSA2 component"))?;
        cursor = end;
        // Stored little-endian; BIGNUMs are built from big-endian bytes.
        let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
        Ok(BigNum::from_slice(&reversed)?)
    };

    let n = component(byte_length)?;
    let p = component(half_length)?;
    let q = component(half_length)?;
    let dmp1 = component(half_length)?;
    let dmq1 = component(half_length)?;
    let iqmp = component(half_length)?;
    let d = component(byte_length)?;

    let rsa = Rsa::from_private_components(n, e, d, p, q, dmp1, dmq1, iqmp)?;
    Ok(PKey::from_rsa(rsa)?)
}

/// Load the certificate chain from an SPC/PKCS7 container, in file order.
pub fn load_certificates(path: &Path) -> DeployResult<Vec<X509>> {
    let bytes = fs::read(path)?;
    let der = if looks_base64(&bytes) {
        decode_base64_container(&bytes)?
    } else {
        bytes
    };
    extract_certificates(&der)
}

fn looks_base64(bytes: &[u8]) -> bool {
    // DER always opens with a SEQUENCE tag; anything printable is treated
    // as base64, optionally with PEM armor lines.
    !bytes.starts_with(&[0x30])
}

fn decode_base64_container(bytes: &[u8]) -> DeployResult<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let text = std::str::from_utf8(bytes)
        .map_err(|_| DeployError::BadCertificate("container is neither DER nor base64".into()))?;
    let stripped: String = text
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .concat()
        .split_whitespace()
        .collect();
    STANDARD
        .decode(stripped.as_bytes())
        .map_err(|e| DeployError::BadCertificate(format!("invalid base64 container: {e}")))
}

/// Walk `ContentInfo → SignedData → certificates [0]` and decode each
/// certificate in order.
fn extract_certificates(der: &[u8]) -> DeployResult<Vec<X509>> {
    let mut outer = DerReader::new(der);
    let content_info = outer
        .expect(TAG_SEQUENCE)
        .map_err(|_| DeployError::BadCertificate("container is not a ContentInfo".into()))?;

    let mut fields = DerReader::new(content_info.content);
    fields
        .expect(TAG_OID)
        .map_err(|_| DeployError::BadCertificate("missing content type".into()))?;
    let wrapped = fields
        .read()
        .map_err(|_| DeployError::BadCertificate("missing SignedData".into()))?;

    let mut signed_data_outer = DerReader::new(wrapped.content);
    let signed_data = signed_data_outer
        .expect(TAG_SEQUENCE)
        .map_err(|_| DeployError::BadCertificate("malformed SignedData".into()))?;

    let mut elements = DerReader::new(signed_data.content);
    while !elements.is_empty() {
        let element = elements
            .read()
            .map_err(|_| DeployError::BadCertificate("malformed SignedData body".into()))?;
        if element.tag == 0xA0 {
            let mut certs = Vec::new();
            let mut list = DerReader::new(element.content);
            while !list.is_empty() {
                let cert = list
                    .read()
                    .map_err(|_| DeployError::BadCertificate("malformed certificate".into()))?;
                certs.push(X509::from_der(cert.raw).map_err(|e| {
                    DeployError::BadCertificate(format!("certificate does not parse: {e}"))
                })?);
            }
            if certs.is_empty() {
                break;
            }
            return Ok(certs);
        }
    }
    Err(DeployError::BadCertificate(
        "container holds no certificates".into(),
    ))
}

/// The leaf certificate's public key must match the signing key.
pub fn verify_key_matches(certificate: &X509, key: &PKey<Private>) -> DeployResult<()> {
    let cert_rsa = certificate
        .public_key()
        .and_then(|k| k.rsa())
        .map_err(|e| DeployError::BadCertificate(format!("certificate key is not RSA: {e}")))?;
    let key_rsa = key
        .rsa()
        .map_err(|e| DeployError::BadPrivateKey(format!("signing key is not RSA: {e}")))?;
    if cert_rsa.n() != key_rsa.n() || cert_rsa.e() != key_rsa.e() {
        return Err(DeployError::CertMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa2_blob(rsa: &Rsa<Private>) -> Vec<u8> {
        let bits = rsa.size() as usize * 8;
        let mut blob = Vec::new();
        blob.extend_from_slice(RSA2_MAGIC);
        blob.extend_from_slice(&(bits as u32).to_le_bytes());
        let e_bytes = rsa.e().to_vec();
        let mut e = 0u32;
        for byte in e_bytes {
            e = (e << 8) | u32::from(byte);
        }
        blob.extend_from_slice(&e.to_le_bytes());

        let mut push = |bn: &openssl::bn::BigNumRef, width: usize| {
            let mut bytes = bn.to_vec();
            bytes.reverse();
            bytes.resize(width, 0);
            blob.extend_from_slice(&bytes);
        };
        let full = bits / 8;
        let half = bits / 16;
        push(rsa.n(), full);
        push(rsa.p().unwrap(), half);
        push(rsa.q().unwrap(), half);
        push(rsa.dmp1().unwrap(), half);
        push(rsa.dmq1().unwrap(), half);
        push(rsa.iqmp().unwrap(), half);
        push(rsa.d(), full);
        blob
    }

    fn pvk_bytes(blob: &[u8], salt: &[u8], encrypted: bool) -> Vec<u8> {
        let mut body = vec![7u8, 2, 0, 0]; // blob header: PRIVATEKEYBLOB v2
        body.extend_from_slice(&0x0000_2400u32.to_le_bytes()); // CALG_RSA_SIGN
        body.extend_from_slice(blob);
        let mut out = PvkHeader {
            magic: PVK_MAGIC,
            reserved: 0,
            key_type: 2,
            is_encrypted: u32::from(encrypted),
            salt_length: salt.len() as u32,
            key_length: body.len() as u32,
        }
        .to_bytes();
        out.extend_from_slice(salt);
        out.extend_from_slice(&body);
        out
    }

    fn rc4_key(salt: &[u8], passphrase: &str, weak: bool) -> [u8; 16] {
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(passphrase.as_bytes());
        let derived = hasher.finalize();
        let mut key = [0u8; 16];
        if weak {
            key[..5].copy_from_slice(&derived[..5]);
        } else {
            key.copy_from_slice(&derived[..16]);
        }
        key
    }

    #[test]
    fn test_unencrypted_pvk_round_trip() {
        let rsa = Rsa::generate(1024).unwrap();
        let bytes = pvk_bytes(&rsa2_blob(&rsa), &[], false);
        let key = parse_pvk(&bytes, None).unwrap();
        assert_eq!(key.rsa().unwrap().n(), rsa.n());
        assert_eq!(key.rsa().unwrap().d(), rsa.d());
    }

    #[test]
    fn test_encrypted_pvk_strong_key() {
        let rsa = Rsa::generate(1024).unwrap();
        let salt = [0x42u8; 16];
        let plain = rsa2_blob(&rsa);
        let cipher = openssl::symm::encrypt(
            Cipher::rc4(),
            &rc4_key(&salt, "secret", false),
            None,
            &plain,
        )
        .unwrap();
        let bytes = pvk_bytes(&cipher, &salt, true);
        let key = parse_pvk(&bytes, Some("secret")).unwrap();
        assert_eq!(key.rsa().unwrap().n(), rsa.n());
    }

    #[test]
    fn test_encrypted_pvk_weak_fallback() {
        // Material only decryptable with the 40-bit export key; the strong
        // attempt must fail over to it.
        let rsa = Rsa::generate(1024).unwrap();
        let salt = [0x17u8; 16];
        let plain = rsa2_blob(&rsa);
        let cipher = openssl::symm::encrypt(
            Cipher::rc4(),
            &rc4_key(&salt, "secret", true),
            None,
            &plain,
        )
        .unwrap();
        let bytes = pvk_bytes(&cipher, &salt, true);
        let key = parse_pvk(&bytes, Some("secret")).unwrap();
        assert_eq!(key.rsa().unwrap().n(), rsa.n());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let rsa = Rsa::generate(1024).unwrap();
        let salt = [0x01u8; 16];
        let cipher = openssl::symm::encrypt(
            Cipher::rc4(),
            &rc4_key(&salt, "right", false),
            None,
            &rsa2_blob(&rsa),
        )
        .unwrap();
        let bytes = pvk_bytes(&cipher, &salt, true);
        assert!(matches!(
            parse_pvk(&bytes, Some("wrong")),
            Err(DeployError::BadPrivateKey(_))
        ));
    }

    #[test]
    fn test_key_cert_mismatch_detected() {
        let rsa_a = Rsa::generate(1024).unwrap();
        let rsa_b = Rsa::generate(1024).unwrap();
        let key_a = PKey::from_rsa(rsa_a).unwrap();
        let key_b = PKey::from_rsa(rsa_b).unwrap();

        let mut builder = X509::builder().unwrap();
        builder.set_pubkey(&key_a).unwrap();
        builder.sign(&key_a, openssl::hash::MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        assert!(verify_key_matches(&cert, &key_a).is_ok());
        assert!(matches!(
            verify_key_matches(&cert, &key_b),
            Err(DeployError::CertMismatch)
        ));
    }
}
