// Jackson Coxson
// Host identity generation for the lockdownd pairing handshake (component C).
//
// libimobiledevice and its descendants all do the same dance here: generate an RSA-2048 host
// key and a separate RSA-2048 root key, self-sign both as CA certificates, then use the root key
// to sign a certificate over the device's own public key. openssl is used throughout rather than
// pulling in a second RSA/X.509 stack, since pairing_file.rs and the TLS upgrade already depend
// on it.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509Name, X509NameBuilder};

use crate::IdeviceError;

const VALIDITY_DAYS: u32 = 365 * 9;

/// The full set of key material generated for one pairing attempt: a host identity and a device
/// certificate signed by the root key over the device's reported public key.
#[derive(Clone, Debug)]
pub struct CertificateIdentity {
    pub root_private_key: PKey<Private>,
    pub root_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub host_certificate: X509,
    pub device_certificate: X509,
}

fn rsa_keypair() -> Result<PKey<Private>, IdeviceError> {
    let rsa = Rsa::generate(2048)?;
    Ok(PKey::from_rsa(rsa)?)
}

fn name_with_cn(cn: &str) -> Result<X509Name, IdeviceError> {
    let mut builder = X509NameBuilder::new()?;
    builder.append_entry_by_text("CN", cn)?;
    Ok(builder.build())
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer, IdeviceError> {
    let mut bn = BigNum::new()?;
    bn.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Ok(bn.to_asn1_integer()?)
}

/// Builds a self-signed certificate over `key`, valid for roughly nine years (matching the
/// validity window used by the on-device pairing counterpart).
fn self_signed_cert(key: &PKey<Private>, cn: &str) -> Result<X509, IdeviceError> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&random_serial()?)?;

    let name = name_with_cn(cn)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;

    builder.set_pubkey(key)?;
    builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
    builder.set_not_after(&Asn1Time::days_from_now(VALIDITY_DAYS)?)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Signs a certificate over `device_public_key` using `root_key`/`root_cert` as the issuer,
/// matching the "device certificate signed by root over device public key" step of the pairing
/// handshake.
fn sign_device_certificate(
    root_key: &PKey<Private>,
    root_cert: &X509,
    device_public_key: &PKey<Public>,
) -> Result<X509, IdeviceError> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&random_serial()?)?;
    builder.set_subject_name(&name_with_cn("Device")?)?;
    builder.set_issuer_name(root_cert.subject_name())?;
    builder.set_pubkey(device_public_key)?;
    builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
    builder.set_not_after(&Asn1Time::days_from_now(VALIDITY_DAYS)?)?;
    builder.sign(root_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Host identity (root CA + host cert), generated fresh for every pairing attempt.
#[derive(Clone, Debug)]
pub struct HostIdentity {
    pub root_private_key: PKey<Private>,
    pub root_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub host_certificate: X509,
}

pub(crate) fn generate_host_identity() -> Result<HostIdentity, IdeviceError> {
    let root_private_key = rsa_keypair()?;
    let root_certificate = self_signed_cert(&root_private_key, "Root")?;

    let host_private_key = rsa_keypair()?;
    let host_certificate = self_signed_cert(&host_private_key, "Host")?;

    Ok(HostIdentity {
        root_private_key,
        root_certificate,
        host_private_key,
        host_certificate,
    })
}

/// Completes the pairing handshake's certificate generation by additionally signing the
/// device's public key (PEM-encoded, as returned in `DevicePublicKey`).
pub(crate) fn complete_with_device_key(
    identity: HostIdentity,
    device_public_key_pem: &[u8],
) -> Result<CertificateIdentity, IdeviceError> {
    let device_public_key = PKey::public_key_from_pem(device_public_key_pem)
        .or_else(|_| {
            let rsa = openssl::rsa::Rsa::public_key_from_pem_pkcs1(device_public_key_pem)?;
            PKey::from_rsa(rsa)
        })?;
    let device_certificate = sign_device_certificate(
        &identity.root_private_key,
        &identity.root_certificate,
        &device_public_key,
    )?;

    Ok(CertificateIdentity {
        root_private_key: identity.root_private_key,
        root_certificate: identity.root_certificate,
        host_private_key: identity.host_private_key,
        host_certificate: identity.host_certificate,
        device_certificate,
    })
}

/// Generates a complete, internally-consistent identity for tests: a host identity plus a
/// "device" certificate signed over a freshly generated keypair standing in for the device's.
pub fn generate_certificates() -> Result<CertificateIdentity, IdeviceError> {
    let identity = generate_host_identity()?;
    let stand_in_device_key = rsa_keypair()?;
    let device_public_key_pem = stand_in_device_key.public_key_to_pem()?;
    complete_with_device_key(identity, &device_public_key_pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_certificate_is_signed_by_root() {
        let identity = generate_certificates().unwrap();
        assert!(
            identity
                .device_certificate
                .verify(&identity.root_certificate.public_key().unwrap())
                .unwrap()
        );
    }

    #[test]
    fn root_and_host_certificates_are_self_signed() {
        let identity = generate_certificates().unwrap();
        assert!(
            identity
                .root_certificate
                .verify(&identity.root_certificate.public_key().unwrap())
                .unwrap()
        );
        assert!(
            identity
                .host_certificate
                .verify(&identity.host_certificate.public_key().unwrap())
                .unwrap()
        );
    }
}
