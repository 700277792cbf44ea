//! Authenticode signing of patched Windows executables.
//!
//! The pipeline is strictly ordered: digest the image (excluding the
//! checksum field and the security data-directory entry), wrap the digest
//! in `SpcIndirectDataContent`, sign it into a PKCS7 envelope, optionally
//! have a timestamp authority countersign, then append the certificate
//! table and point the security directory at it. The output file is
//! mutated in place; on error it must be considered invalid and discarded.

pub mod der;
pub mod pkcs7;
pub mod pvk;
pub mod spc;
pub mod timestamp;

use std::fs;

use log::info;
use sha1::{Digest, Sha1};

use crate::error::{DeployError, DeployResult};
use crate::layout;
use crate::params::SignParams;
use crate::pe::types::PeImage;

pub use pkcs7::{build_signed_data, compute_signature, SignRequest};
pub use pvk::{load_certificates, load_private_key, verify_key_matches};

const CERT_REVISION: u16 = 0x0200;
const CERT_TYPE_PKCS7: u16 = 0x0002;

layout! {
    le struct WinCertificateHeader {
        pub length: u32,
        pub revision: u16,
        pub certificate_type: u16,
    }
}

/// Sign the PE file named by `params`, in place.
pub fn sign_windows(params: &SignParams) -> DeployResult<()> {
    params.validate()?;
    info!("signing {}", params.input.display());

    let mut data = fs::read(&params.input)?;
    let image = PeImage::parse(&data)?;
    let checksum_offset = image.checksum_offset();
    let security_offset = image.security_entry_offset();
    if image.optional.data_directories.len() <= 4 || security_offset + 8 > data.len() {
        return Err(DeployError::BadSecuritySection);
    }

    // An existing certificate table must be the file's final bytes; it is
    // dropped and replaced by the new signature.
    let existing_offset = read_u32(&data, security_offset) as usize;
    let existing_size = read_u32(&data, security_offset + 4) as usize;
    if existing_size != 0 {
        if existing_offset + existing_size != data.len() {
            return Err(DeployError::BadSecuritySection);
        }
        data.truncate(existing_offset);
    }

    // The checksum is left zeroed; the digest skips it either way.
    data[checksum_offset..checksum_offset + 4].fill(0);

    // The certificate table must start 8-aligned; pad with zeros that are
    // part of the hashed region.
    while data.len() % 8 != 0 {
        data.push(0);
    }
    let digest = image_digest(&data, checksum_offset, security_offset);

    let certificates = load_certificates(&params.certificate)?;
    let key = load_private_key(&params.private_key, params.passphrase.as_deref())?;
    verify_key_matches(&certificates[0], &key)?;

    let content = spc::spc_indirect_data_content(&digest);
    let request = SignRequest {
        content: &content,
        certificates: &certificates,
        key: &key,
        description: params.description.as_deref(),
        url: params.url.as_deref(),
    };
    let signature = compute_signature(&request)?;

    let countersignature = match &params.timestamper {
        Some(url) => {
            let response = timestamp::request_countersignature(url, &signature)?;
            Some(pkcs7::parse_timestamp_response(&response)?)
        }
        None => None,
    };
    let envelope = build_signed_data(&request, &signature, countersignature.as_ref())?;

    // Append the WIN_CERTIFICATE table and point the security directory at
    // it. The directory size covers header, signature and padding.
    let table_offset = data.len();
    let header_and_signature = WinCertificateHeader::SIZE + envelope.len();
    data.extend_from_slice(
        &WinCertificateHeader {
            length: u32::try_from(header_and_signature)
                .map_err(|_| DeployError::Overflow("certificate table"))?,
            revision: CERT_REVISION,
            certificate_type: CERT_TYPE_PKCS7,
        }
        .to_bytes(),
    );
    data.extend_from_slice(&envelope);
    while data.len() % 8 != 0 {
        data.push(0);
    }
    let table_size = data.len() - table_offset;

    write_u32(&mut data, security_offset, table_offset as u32);
    write_u32(&mut data, security_offset + 4, table_size as u32);

    fs::write(&params.input, &data)?;
    info!(
        "signed {} ({} byte certificate table)",
        params.input.display(),
        table_size
    );
    Ok(())
}

/// SHA-1 over the whole image except the 4-byte checksum field and the
/// 8-byte security data-directory entry.
fn image_digest(data: &[u8], checksum_offset: usize, security_offset: usize) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(&data[..checksum_offset]);
    hasher.update(&data[checksum_offset + 4..security_offset]);
    hasher.update(&data[security_offset + 8..]);
    hasher.finalize().into()
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_skips_checksum_and_security_entry() {
        let mut a = vec![0x5Au8; 256];
        let mut b = a.clone();
        // Different checksum values at offset 88, different security
        // entries at 152: digests must agree.
        a[88..92].copy_from_slice(&[1, 2, 3, 4]);
        b[88..92].copy_from_slice(&[9, 9, 9, 9]);
        a[152..160].fill(0x11);
        b[152..160].fill(0x22);
        assert_eq!(image_digest(&a, 88, 152), image_digest(&b, 88, 152));

        // A change anywhere else must show up.
        b[200] ^= 0xFF;
        assert_ne!(image_digest(&a, 88, 152), image_digest(&b, 88, 152));
    }

    #[test]
    fn test_win_certificate_header_layout() {
        assert_eq!(WinCertificateHeader::SIZE, 8);
        let header = WinCertificateHeader {
            length: 8 + 3,
            revision: CERT_REVISION,
            certificate_type: CERT_TYPE_PKCS7,
        };
        assert_eq!(header.to_bytes(), vec![11, 0, 0, 0, 0x00, 0x02, 0x02, 0x00]);
    }
}
