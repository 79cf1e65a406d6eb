//! Self-signed certificate generation for HTTPS serving.
//!
//! Produces a throwaway root plus a leaf certificate for the requested
//! hosts, both on fresh RSA-2048 keys, valid for one year. The chain is
//! leaf first, then root, ready for the server's TLS config.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};

use crate::error::{Result, ShroudError};
use crate::proxy::TlsIdentity;

const RSA_BITS: usize = 2048;
const VALIDITY: Duration = Duration::days(365);

/// Generate a fresh RSA key pair in the form rcgen signs with, plus its
/// pkcs8 DER for the TLS stack.
fn rsa_key_pair() -> Result<(KeyPair, Vec<u8>)> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
        .map_err(|e| ShroudError::Certificate(format!("RSA key generation failed: {}", e)))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| ShroudError::Certificate(format!("pkcs8 encoding failed: {}", e)))?;
    let key_pair = KeyPair::try_from(der.as_bytes())
        .map_err(|e| ShroudError::Certificate(format!("unusable key pair: {}", e)))?;
    Ok((key_pair, der.as_bytes().to_vec()))
}

fn validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + VALIDITY;
}

/// Generate a self-signed identity covering the given hosts.
///
/// Hosts may be DNS names or IP addresses; each becomes a subject
/// alternative name on the leaf.
pub fn generate_identity(hosts: &[String]) -> Result<TlsIdentity> {
    let mut root_params = CertificateParams::default();
    root_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    root_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Shroud Root");
    root_params.distinguished_name = dn;
    validity(&mut root_params);

    let (root_key, _) = rsa_key_pair()?;
    let root_cert = root_params
        .self_signed(&root_key)
        .map_err(|e| ShroudError::Certificate(format!("root certificate failed: {}", e)))?;

    let mut leaf_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        hosts.first().map(String::as_str).unwrap_or("localhost"),
    );
    leaf_params.distinguished_name = dn;
    validity(&mut leaf_params);
    for host in hosts {
        let san = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.as_str().try_into().map_err(|e| {
                ShroudError::Certificate(format!("invalid host {}: {}", host, e))
            })?),
        };
        leaf_params.subject_alt_names.push(san);
    }

    let (leaf_key, leaf_der) = rsa_key_pair()?;
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &root_cert, &root_key)
        .map_err(|e| ShroudError::Certificate(format!("leaf certificate failed: {}", e)))?;

    Ok(TlsIdentity {
        cert_chain: vec![leaf_cert.der().clone(), root_cert.der().clone()],
        key: PrivatePkcs8KeyDer::from(leaf_der).into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identity_is_accepted_by_rustls() {
        let identity =
            generate_identity(&["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        assert_eq!(identity.cert_chain.len(), 2);

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain, identity.key);
        assert!(config.is_ok());
    }
}
