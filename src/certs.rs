use crate::error::EnrollmentError;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use x509_parser::prelude::*;

pub const KEY_FILE: &str = "agent.key";
pub const CSR_FILE: &str = "agent.csr";
pub const CERT_FILE: &str = "agent.crt";
pub const CA_FILE: &str = "ca.crt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    /// Usable now and not within `renew_before` of expiring.
    pub fn is_current(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        let margin = chrono::Duration::from_std(renew_before).unwrap_or_else(|_| chrono::Duration::zero());
        now >= self.not_before && now + margin < self.not_after
    }
}

/// Everything enrollment has persisted so far.
#[derive(Debug, Clone, Default)]
pub struct CertificateState {
    pub key_pem: Option<String>,
    pub csr_pem: Option<String>,
    pub cert_pem: Option<String>,
    pub ca_pem: Option<String>,
    pub validity: Option<Validity>,
}

/// Key, CSR, signed certificate, and pinned CA under one directory.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn read_ca(&self) -> Result<String, EnrollmentError> {
        let path = self.path(CA_FILE);
        fs::read_to_string(&path)
            .map_err(|err| EnrollmentError::Storage(format!("pinned CA {}: {err}", path.display())))
    }

    /// Reads whatever is on disk. A certificate that fails to parse or does not
    /// match the key is reported without validity.
    pub fn load(&self) -> Result<CertificateState, EnrollmentError> {
        let mut state = CertificateState {
            key_pem: read_optional(&self.path(KEY_FILE))?,
            csr_pem: read_optional(&self.path(CSR_FILE))?,
            cert_pem: read_optional(&self.path(CERT_FILE))?,
            ca_pem: read_optional(&self.path(CA_FILE))?,
            validity: None,
        };
        if let (Some(cert), Some(key)) = (&state.cert_pem, &state.key_pem) {
            match inspect_certificate(cert, key) {
                Ok(validity) => state.validity = Some(validity),
                Err(err) => tracing::warn!(error = %err, "persisted certificate unusable"),
            }
        }
        Ok(state)
    }

    /// Generates a fresh key pair and a CSR for `common_name`, replacing any
    /// previous identity.
    pub fn generate_identity(&self, common_name: &str) -> Result<String, EnrollmentError> {
        fs::create_dir_all(&self.dir)?;
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let csr_pem = params.serialize_request(&key_pair)?.pem()?;

        remove_if_exists(&self.path(CERT_FILE))?;
        write_private(&self.path(KEY_FILE), key_pair.serialize_pem().as_bytes())?;
        write_private(&self.path(CSR_FILE), csr_pem.as_bytes())?;
        Ok(csr_pem)
    }

    /// Verifies a signed certificate against the local key and persists it.
    pub fn install_certificate(&self, cert_pem: &str) -> Result<Validity, EnrollmentError> {
        let key_pem = read_optional(&self.path(KEY_FILE))?
            .ok_or_else(|| EnrollmentError::Storage("private key missing".to_string()))?;
        let validity = inspect_certificate(cert_pem, &key_pem)?;
        write_private(&self.path(CERT_FILE), cert_pem.as_bytes())?;
        Ok(validity)
    }

    pub fn clear_identity(&self) -> Result<(), EnrollmentError> {
        for file in [CERT_FILE, CSR_FILE, KEY_FILE] {
            remove_if_exists(&self.path(file))?;
        }
        Ok(())
    }

    /// Certificate followed by key, the form reqwest expects for a client identity.
    pub fn identity_pem(&self) -> Result<Vec<u8>, EnrollmentError> {
        let cert = fs::read(self.path(CERT_FILE))?;
        let key = fs::read(self.path(KEY_FILE))?;
        let mut pem = cert;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&key);
        Ok(pem)
    }
}

/// Parses `cert_pem`, checks it carries the public half of `key_pem`, and
/// returns its validity window.
pub fn inspect_certificate(cert_pem: &str, key_pem: &str) -> Result<Validity, EnrollmentError> {
    let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .ok_or_else(|| EnrollmentError::Crypto("no certificate in PEM".to_string()))?
        .map_err(|err| EnrollmentError::Crypto(err.to_string()))?;
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|err| EnrollmentError::Crypto(format!("parse certificate: {err}")))?;

    let key_pair = KeyPair::from_pem(key_pem)?;
    if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
        return Err(EnrollmentError::KeyMismatch);
    }

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| EnrollmentError::Crypto("not_before out of range".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| EnrollmentError::Crypto("not_after out of range".to_string()))?;
    Ok(Validity {
        not_before,
        not_after,
    })
}

/// Short identifier operators can match against the server's pending list.
pub fn csr_fingerprint(csr_pem: &str) -> String {
    let digest = hex::encode(Sha256::digest(csr_pem.as_bytes()));
    digest[digest.len() - 5..].to_string()
}

fn read_optional(path: &Path) -> Result<Option<String>, EnrollmentError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(EnrollmentError::Storage(format!("{}: {err}", path.display()))),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), EnrollmentError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), EnrollmentError> {
    let tmp = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_ca {
    use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};

    /// Minimal signing authority for enrollment tests.
    pub struct TestCa {
        pub cert: Certificate,
        pub key: KeyPair,
    }

    impl TestCa {
        pub fn new() -> Self {
            let mut params = CertificateParams::default();
            params.distinguished_name.push(DnType::CommonName, "agent test CA");
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        pub fn ca_pem(&self) -> String {
            self.cert.pem()
        }

        /// Issues a certificate for the key stored in `key_pem`.
        pub fn sign(&self, key_pem: &str, years_valid: i32) -> String {
            let subject_key = KeyPair::from_pem(key_pem).unwrap();
            let mut params = CertificateParams::default();
            params.distinguished_name.push(DnType::CommonName, "agent");
            params.not_before = rcgen::date_time_ymd(2020, 1, 1);
            params.not_after = rcgen::date_time_ymd(2020 + years_valid, 1, 1);
            params
                .signed_by(&subject_key, &self.cert, &self.key)
                .unwrap()
                .pem()
        }
    }
}
