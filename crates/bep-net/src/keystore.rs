//! Local TLS identity.
//!
//! A keystore is a self-signed certificate (`CN=syncthing`) plus its PKCS#8
//! private key, stored together as PEM text. The device id is the SHA-256
//! of the certificate DER.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bep_core::DeviceId;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::TransportError;

/// Common name of generated certificates.
pub const CERTIFICATE_CN: &str = "syncthing";

/// Certificate, private key and the derived device id.
pub struct Keystore {
    device_id: DeviceId,
    certificate: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
}

impl Keystore {
    /// Parses a keystore from PEM text holding a certificate and a private key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, TransportError> {
        let certificate = CertificateDer::pem_slice_iter(pem)
            .next()
            .ok_or_else(|| TransportError::Keystore("no certificate in keystore".into()))?
            .map_err(|e| TransportError::Keystore(format!("bad certificate: {e:?}")))?;
        let private_key = PrivateKeyDer::from_pem_slice(pem)
            .map_err(|e| TransportError::Keystore(format!("bad private key: {e:?}")))?;
        let device_id = DeviceId::from_certificate(certificate.as_ref());

        Ok(Self {
            device_id,
            certificate,
            private_key,
        })
    }

    /// Device id derived from the certificate.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Certificate in DER form.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Generates and loads keystores, caching them by the hash of their PEM
/// bytes so identical data yields the same identity without re-parsing.
#[derive(Default)]
pub struct KeystoreLoader {
    cache: Mutex<HashMap<String, Arc<Keystore>>>,
}

impl KeystoreLoader {
    /// Creates a loader with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide loader.
    pub fn shared() -> &'static KeystoreLoader {
        static LOADER: OnceLock<KeystoreLoader> = OnceLock::new();
        LOADER.get_or_init(KeystoreLoader::new)
    }

    /// Generates a new self-signed identity. Returns the keystore and its
    /// PEM text for persistence.
    pub fn generate(&self) -> Result<(Arc<Keystore>, String), TransportError> {
        debug!("generating key");
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| TransportError::Keystore(e.to_string()))?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, CERTIFICATE_CN);
        params.distinguished_name = name;

        let key_pair = KeyPair::generate().map_err(|e| TransportError::Keystore(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TransportError::Keystore(e.to_string()))?;
        let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());

        let keystore = self.load(pem.as_bytes())?;
        info!(device_id = %keystore.device_id(), "generated keystore");
        Ok((keystore, pem))
    }

    /// Loads a keystore from PEM bytes, returning the cached one when the
    /// same bytes were loaded before.
    pub fn load(&self, pem: &[u8]) -> Result<Arc<Keystore>, TransportError> {
        let key = hex::encode(Sha256::digest(pem));
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(cached.clone());
        }

        let keystore = Arc::new(Keystore::from_pem(pem)?);
        debug!(device_id = %keystore.device_id(), "keystore loaded");
        self.cache.lock().entry(key).or_insert(keystore.clone());
        Ok(keystore)
    }

    /// Number of cached keystores.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_reload() {
        let loader = KeystoreLoader::new();
        let (keystore, pem) = loader.generate().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(pem.contains("PRIVATE KEY"));

        let fresh = Keystore::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(fresh.device_id(), keystore.device_id());
        assert_eq!(
            keystore.device_id(),
            DeviceId::from_certificate(keystore.certificate().as_ref())
        );
    }

    #[test]
    fn test_load_is_cached() {
        let loader = KeystoreLoader::new();
        let (first, pem) = loader.generate().unwrap();
        let again = loader.load(pem.as_bytes()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(loader.cached(), 1);

        let (other, _) = loader.generate().unwrap();
        assert_ne!(other.device_id(), first.device_id());
        assert_eq!(loader.cached(), 2);
    }

    #[test]
    fn test_invalid_pem() {
        assert!(matches!(
            Keystore::from_pem(b"not a keystore"),
            Err(TransportError::Keystore(_))
        ));
    }
}
