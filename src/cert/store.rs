use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::record::{CertificateRecord, Thumbprint};

/// Persistent certificate storage, partitioned into named stores
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn list(&self, store: &str) -> Result<Vec<CertificateRecord>>;

    async fn get(&self, store: &str, thumbprint: &Thumbprint) -> Result<Option<CertificateRecord>>;

    /// Add or replace a certificate; the record's store name selects the store
    async fn put(
        &self,
        record: &CertificateRecord,
        certificate: &[u8],
        private_key: Option<&[u8]>,
    ) -> Result<()>;

    /// Returns false if the certificate was not present
    async fn delete(&self, store: &str, thumbprint: &Thumbprint) -> Result<bool>;
}

/// Store names become directory names, so keep them to one plain segment
fn check_store_name(store: &str) -> Result<()> {
    let valid = !store.is_empty()
        && store != "."
        && store != ".."
        && !store.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("'{store}' is not a valid store name")))
    }
}

/// Filesystem layout: `<base>/stores/<store>/<THUMBPRINT>/{cert.der,key.der,meta.json}`
pub struct FileCertificateStore {
    base_dir: PathBuf,
}

impl FileCertificateStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.stores_dir()).await?;
        Ok(())
    }

    fn stores_dir(&self) -> PathBuf {
        self.base_dir.join("stores")
    }

    fn store_dir(&self, store: &str) -> PathBuf {
        self.stores_dir().join(store)
    }

    fn cert_dir(&self, store: &str, thumbprint: &Thumbprint) -> PathBuf {
        self.store_dir(store).join(thumbprint.to_string())
    }

    async fn read_meta(&self, dir: PathBuf) -> Result<Option<CertificateRecord>> {
        let meta_path = dir.join("meta.json");
        if !meta_path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&meta_path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn list(&self, store: &str) -> Result<Vec<CertificateRecord>> {
        check_store_name(store)?;
        let dir = self.store_dir(store);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.read_meta(entry.path()).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unreadable certificate"),
            }
        }
        records.sort_by(|a, b| a.friendly_name.cmp(&b.friendly_name));
        Ok(records)
    }

    async fn get(&self, store: &str, thumbprint: &Thumbprint) -> Result<Option<CertificateRecord>> {
        check_store_name(store)?;
        self.read_meta(self.cert_dir(store, thumbprint)).await
    }

    async fn put(
        &self,
        record: &CertificateRecord,
        certificate: &[u8],
        private_key: Option<&[u8]>,
    ) -> Result<()> {
        check_store_name(&record.store_name)?;
        let cert_dir = self.cert_dir(&record.store_name, &record.thumbprint);
        tokio::fs::create_dir_all(&cert_dir).await?;

        tokio::fs::write(cert_dir.join("cert.der"), certificate).await?;

        // Private key with restricted permissions
        if let Some(key) = private_key {
            let key_path = cert_dir.join("key.der");
            tokio::fs::write(&key_path, key).await?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                tokio::fs::set_permissions(&key_path, perms).await?;
            }
        }

        // Metadata last: its presence marks the certificate as installed
        let meta = CertificateRecord {
            has_private_key: private_key.is_some(),
            ..record.clone()
        };
        let meta_content = serde_json::to_string_pretty(&meta)?;
        tokio::fs::write(cert_dir.join("meta.json"), meta_content).await?;

        debug!(
            store = %record.store_name,
            thumbprint = %record.thumbprint,
            "Stored certificate"
        );
        Ok(())
    }

    async fn delete(&self, store: &str, thumbprint: &Thumbprint) -> Result<bool> {
        check_store_name(store)?;
        let cert_dir = self.cert_dir(store, thumbprint);
        if !cert_dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&cert_dir).await?;
        Ok(true)
    }
}

/// Volatile store for tests and dry runs
#[derive(Default)]
pub struct MemoryCertificateStore {
    certificates: RwLock<BTreeMap<(String, Thumbprint), CertificateRecord>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn list(&self, store: &str) -> Result<Vec<CertificateRecord>> {
        check_store_name(store)?;
        let mut records: Vec<CertificateRecord> = self
            .certificates
            .read()
            .await
            .iter()
            .filter(|((s, _), _)| s == store)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| a.friendly_name.cmp(&b.friendly_name));
        Ok(records)
    }

    async fn get(&self, store: &str, thumbprint: &Thumbprint) -> Result<Option<CertificateRecord>> {
        check_store_name(store)?;
        Ok(self
            .certificates
            .read()
            .await
            .get(&(store.to_string(), *thumbprint))
            .cloned())
    }

    async fn put(
        &self,
        record: &CertificateRecord,
        _certificate: &[u8],
        private_key: Option<&[u8]>,
    ) -> Result<()> {
        check_store_name(&record.store_name)?;
        let record = CertificateRecord {
            has_private_key: private_key.is_some(),
            ..record.clone()
        };
        self.certificates
            .write()
            .await
            .insert((record.store_name.clone(), record.thumbprint), record);
        Ok(())
    }

    async fn delete(&self, store: &str, thumbprint: &Thumbprint) -> Result<bool> {
        check_store_name(store)?;
        Ok(self
            .certificates
            .write()
            .await
            .remove(&(store.to_string(), *thumbprint))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(store: &str) -> (CertificateRecord, Vec<u8>, Vec<u8>) {
        let generated = rcgen::generate_simple_self_signed(vec!["api.example.com".to_string()]).unwrap();
        let der = generated.cert.der().to_vec();
        let key = generated.key_pair.serialize_der();
        let record = CertificateRecord::from_der(&der, Some("API"), store).unwrap();
        (record, der, key)
    }

    #[tokio::test]
    async fn test_file_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path().to_path_buf());
        store.init().await.unwrap();

        let (record, der, key) = record("My");
        store.put(&record, &der, Some(key.as_slice())).await.unwrap();

        let cert_dir = dir
            .path()
            .join("stores/My")
            .join(record.thumbprint.to_string());
        assert_eq!(std::fs::read(cert_dir.join("cert.der")).unwrap(), der);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(cert_dir.join("key.der")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = store.get("My", &record.thumbprint).await.unwrap().unwrap();
        assert!(loaded.has_private_key);
        assert_eq!(store.list("My").await.unwrap().len(), 1);
        assert!(store.list("WebHosting").await.unwrap().is_empty());

        assert!(store.delete("My", &record.thumbprint).await.unwrap());
        assert!(!store.delete("My", &record.thumbprint).await.unwrap());
        assert!(store.get("My", &record.thumbprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_name_is_one_segment() {
        let store = MemoryCertificateStore::new();
        assert!(matches!(
            store.list("../etc").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_is_partitioned() {
        let store = MemoryCertificateStore::new();
        let (record, der, _) = record("My");
        store.put(&record, &der, None).await.unwrap();
        assert!(store.get("My", &record.thumbprint).await.unwrap().is_some());
        assert!(store.get("Root", &record.thumbprint).await.unwrap().is_none());
    }
}
