use p12_keystore::error::Error as KeyStoreError;
use p12_keystore::{KeyStore, KeyStoreEntry};
use tracing::debug;

use crate::error::{Error, Result};

/// DER material extracted from a PKCS#12 archive
#[derive(Debug, Clone)]
pub struct Pkcs12Contents {
    pub certificate: Vec<u8>,
    pub private_key: Option<Vec<u8>>,
}

/// Decode an archive. Both legacy (SHA-1 MAC, 3DES/RC2) and current
/// (SHA-256 MAC, PBES2 with AES) archives are accepted. A MAC mismatch or
/// undecryptable content is reported as a wrong password rather than as
/// corrupt data.
pub fn decode(bytes: &[u8], password: &str) -> Result<Pkcs12Contents> {
    let keystore = KeyStore::from_pkcs12(bytes, password).map_err(keystore_error)?;

    let (certificate, private_key) = match keystore.private_key_chain() {
        Some((_, chain)) => {
            let leaf = chain.chain().first().ok_or_else(|| {
                Error::MalformedCertificate("private key has no certificate".to_string())
            })?;
            (leaf.as_der().to_vec(), Some(chain.key().to_vec()))
        }
        None => {
            let certificate = keystore
                .entries()
                .find_map(|(_, entry)| match entry {
                    KeyStoreEntry::Certificate(cert) => Some(cert.as_der().to_vec()),
                    KeyStoreEntry::PrivateKeyChain(_) => None,
                })
                .ok_or_else(|| Error::MalformedCertificate("archive holds no certificate".to_string()))?;
            (certificate, None)
        }
    };

    debug!(
        cert_len = certificate.len(),
        has_key = private_key.is_some(),
        "Decoded PKCS#12 archive"
    );
    Ok(Pkcs12Contents {
        certificate,
        private_key,
    })
}

fn keystore_error(err: KeyStoreError) -> Error {
    match err {
        KeyStoreError::MacError(_) | KeyStoreError::UnpadError | KeyStoreError::Pkcs5Error(_) => {
            Error::InvalidPassword
        }
        other => Error::MalformedCertificate(format!("not a readable PKCS#12 archive: {other}")),
    }
}
