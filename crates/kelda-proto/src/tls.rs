//! TLS identity material for the minion channel.
//!
//! The daemon generates a deployment CA once; every machine gets a node
//! certificate signed by it. Both ends of the minion RPC authenticate with
//! these credentials.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::info;

/// A PEM-encoded certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A deployment CA: the PEM material plus the signing state needed to mint
/// node certificates.
pub struct Ca {
    pub pair: CertKeyPair,
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Generate a self-signed CA for one deployment.
pub fn generate_ca() -> anyhow::Result<Ca> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Kelda");
    dn.push(DnType::CommonName, "Kelda Deployment CA");
    params.distinguished_name = dn;

    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;

    info!("generated deployment CA certificate");

    Ok(Ca {
        pair: CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        },
        cert,
        key,
    })
}

impl Ca {
    /// Mint a node certificate for a machine, with its IPs as SANs.
    pub fn node_cert(&self, name: &str, addresses: &[String]) -> anyhow::Result<CertKeyPair> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Kelda");
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;

        for addr in addresses {
            if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
            } else {
                params
                    .subject_alt_names
                    .push(rcgen::SanType::DnsName(addr.clone().try_into()?));
            }
        }

        params.not_after = rcgen::date_time_ymd(2036, 1, 1);

        let node_key = KeyPair::generate()?;
        let node_cert = params.signed_by(&node_key, &self.cert, &self.key)?;

        info!(%name, sans = addresses.len(), "generated node certificate");

        Ok(CertKeyPair {
            cert_pem: node_cert.pem(),
            key_pem: node_key.serialize_pem(),
        })
    }
}

/// Client-side TLS for dialing a minion.
pub fn client_tls(ca_pem: &str, identity: &CertKeyPair) -> ClientTlsConfig {
    ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca_pem))
        .identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem))
}

/// Server-side TLS for the minion listener, requiring client certificates.
pub fn server_tls(ca_pem: &str, identity: &CertKeyPair) -> ServerTlsConfig {
    ServerTlsConfig::new()
        .identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem))
        .client_ca_root(Certificate::from_pem(ca_pem))
}
