/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{net::IpAddr, sync::Arc};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls::{
    crypto::aws_lc_rs::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    sign::CertifiedKey,
    ServerConfig,
};
use time::{Duration, OffsetDateTime};

use crate::utils::{ProxyError, ProxyResult};

const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
// Leaves are backdated so clients with a slightly slow clock accept them.
const LEAF_BACKDATE_DAYS: i64 = 1;

/// A certificate chain (leaf first) plus the leaf's PKCS#8 private key.
#[derive(Clone)]
pub struct IssuedCertificate {
    name: String,
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
    certified: Arc<CertifiedKey>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("name", &self.name)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl IssuedCertificate {
    pub fn new(
        name: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key_der: Vec<u8>,
    ) -> ProxyResult<Self> {
        if chain.is_empty() {
            return Err(ProxyError::Certificate("empty certificate chain".into()));
        }
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.clone()));
        let signing_key = any_supported_type(&key)
            .map_err(|err| ProxyError::Certificate(format!("unusable private key: {err}")))?;
        Ok(Self {
            name: name.into(),
            chain: chain.clone(),
            key_der,
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    /// Host (or store name, for a root) this certificate was issued under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified.clone()
    }

    /// Server-side TLS config presenting this certificate and offering `alpn`.
    pub fn server_config(&self, alpn: Vec<Vec<u8>>) -> ProxyResult<Arc<ServerConfig>> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), key)
            .map_err(|err| ProxyError::TlsHandshake(format!("server config: {err}")))?;
        config.alpn_protocols = alpn;
        Ok(Arc::new(config))
    }
}

/// The root that signs every generated leaf.
pub struct RootCertificate {
    material: IssuedCertificate,
    signer: Certificate,
}

// rcgen::Certificate has no Debug impl.
impl std::fmt::Debug for RootCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCertificate")
            .field("material", &self.material)
            .finish_non_exhaustive()
    }
}

impl RootCertificate {
    pub fn material(&self) -> &IssuedCertificate {
        &self.material
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        self.material.leaf()
    }

    pub fn signer(&self) -> &Certificate {
        &self.signer
    }
}

/// Creates and restores certificates. The cache only ever talks to this trait, so tests
/// can count or fake issuance.
pub trait CertificateProvider: Send + Sync {
    fn create_root_certificate(&self, issuer: &str) -> ProxyResult<RootCertificate>;

    /// Rebuilds a signing root from stored material (certificate plus private key).
    fn restore_root_certificate(
        &self,
        issuer: &str,
        material: IssuedCertificate,
    ) -> ProxyResult<RootCertificate>;

    fn create_server_certificate(
        &self,
        host: &str,
        root: &RootCertificate,
    ) -> ProxyResult<IssuedCertificate>;
}

/// ECDSA P-256 issuance through rcgen.
#[derive(Debug, Default, Clone, Copy)]
pub struct RcgenCertificateProvider;

impl RcgenCertificateProvider {
    fn root_params(issuer: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.distinguished_name = dn_for(issuer);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(ROOT_VALIDITY_DAYS);
        params
    }
}

impl CertificateProvider for RcgenCertificateProvider {
    fn create_root_certificate(&self, issuer: &str) -> ProxyResult<RootCertificate> {
        let mut params = Self::root_params(issuer);
        params.key_pair = Some(KeyPair::generate(&PKCS_ECDSA_P256_SHA256).map_err(cert_err)?);
        let signer = Certificate::from_params(params).map_err(cert_err)?;

        let der = CertificateDer::from(signer.serialize_der().map_err(cert_err)?);
        let material = IssuedCertificate::new(issuer, vec![der], signer.serialize_private_key_der())?;
        Ok(RootCertificate { material, signer })
    }

    fn restore_root_certificate(
        &self,
        issuer: &str,
        material: IssuedCertificate,
    ) -> ProxyResult<RootCertificate> {
        // rcgen cannot sign with a parsed certificate, so the signer is rebuilt from the
        // stored key under the same subject. Leaves still chain to the stored DER.
        let mut params = Self::root_params(issuer);
        params.key_pair = Some(KeyPair::from_der(material.key_der()).map_err(cert_err)?);
        let signer = Certificate::from_params(params).map_err(cert_err)?;
        Ok(RootCertificate { material, signer })
    }

    fn create_server_certificate(
        &self,
        host: &str,
        root: &RootCertificate,
    ) -> ProxyResult<IssuedCertificate> {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.distinguished_name = dn_for(host);
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        }];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let not_before = OffsetDateTime::now_utc() - Duration::days(LEAF_BACKDATE_DAYS);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf = Certificate::from_params(params).map_err(cert_err)?;
        let leaf_der = CertificateDer::from(
            leaf.serialize_der_with_signer(root.signer())
                .map_err(cert_err)?,
        );
        let chain = vec![leaf_der, root.der().clone()];
        IssuedCertificate::new(host, chain, leaf.serialize_private_key_der())
    }
}

fn dn_for(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn cert_err(err: rcgen::Error) -> ProxyError {
    ProxyError::Certificate(err.to_string())
}
