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

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivatePkcs8KeyDer};

use super::authority::IssuedCertificate;
use crate::utils::{ProxyError, ProxyResult};

/// Persistent home for issued certificates, keyed by host (or root name).
pub trait CertificateStore: Send + Sync {
    fn find(&self, name: &str) -> ProxyResult<Option<IssuedCertificate>>;
    fn install(&self, name: &str, certificate: &IssuedCertificate) -> ProxyResult<()>;
    /// Returns whether anything was removed.
    fn uninstall(&self, name: &str) -> ProxyResult<bool>;
}

/// Stores each certificate as `<name>.crt.pem` (chain) and `<name>.key.pem` beside it.
#[derive(Debug, Clone)]
pub struct FileCertificateStore {
    dir: PathBuf,
}

impl FileCertificateStore {
    pub fn open(dir: impl Into<PathBuf>) -> ProxyResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf) {
        let stem = file_stem(name);
        (
            self.dir.join(format!("{stem}.crt.pem")),
            self.dir.join(format!("{stem}.key.pem")),
        )
    }
}

impl CertificateStore for FileCertificateStore {
    fn find(&self, name: &str) -> ProxyResult<Option<IssuedCertificate>> {
        let (cert_path, key_path) = self.paths(name);
        let cert_pem = match fs::read(&cert_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let key_pem = match fs::read(&key_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(name, path = %cert_path.display(), "stored certificate has no key; ignoring");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        certificate_from_pem(name, &cert_pem, &key_pem).map(Some)
    }

    fn install(&self, name: &str, certificate: &IssuedCertificate) -> ProxyResult<()> {
        let (cert_path, key_path) = self.paths(name);
        fs::write(&cert_path, chain_to_pem(certificate.chain()))?;
        fs::write(&key_path, pem_encode("PRIVATE KEY", certificate.key_der()))?;
        tracing::debug!(name, path = %cert_path.display(), "stored certificate");
        Ok(())
    }

    fn uninstall(&self, name: &str) -> ProxyResult<bool> {
        let (cert_path, key_path) = self.paths(name);
        let mut removed = false;
        for path in [cert_path, key_path] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

/// Parses a PEM chain (leaf first) and a PKCS#8 key.
pub fn certificate_from_pem(
    name: &str,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> ProxyResult<IssuedCertificate> {
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ProxyError::Certificate(format!("{name}: bad certificate PEM: {err}")))?;
    let key = PrivatePkcs8KeyDer::from_pem_slice(key_pem)
        .map_err(|err| ProxyError::Certificate(format!("{name}: bad key PEM: {err}")))?;
    IssuedCertificate::new(name, chain, key.secret_pkcs8_der().to_vec())
}

pub fn chain_to_pem(chain: &[CertificateDer<'_>]) -> String {
    chain
        .iter()
        .map(|der| pem_encode("CERTIFICATE", der.as_ref()))
        .collect()
}

pub fn pem_encode(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for line in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

// Hostnames are mostly file-safe already; everything else becomes '_'.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c.to_ascii_lowercase(),
            '*' => '+',
            _ => '_',
        })
        .collect()
}
