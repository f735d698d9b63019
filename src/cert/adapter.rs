use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::locks::KeyedLocks;

use super::pkcs12;
use super::record::{CertificateRecord, Thumbprint};
use super::store::CertificateStore;

/// Imports, looks up and removes certificates in named stores.
///
/// Every mutating call holds the advisory lock for its thumbprint for the
/// duration of the single call.
pub struct CertificateAdapter {
    store: Arc<dyn CertificateStore>,
    locks: KeyedLocks<Thumbprint>,
}

impl CertificateAdapter {
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn list(&self, store_name: &str) -> Result<Vec<CertificateRecord>> {
        self.store.list(store_name).await
    }

    /// Decode a PKCS#12 archive and add its certificate to `store_name`.
    /// Nothing is written unless the archive decodes with `password`.
    pub async fn import(
        &self,
        archive: &[u8],
        password: &str,
        friendly_name: Option<&str>,
        store_name: &str,
    ) -> Result<CertificateRecord> {
        let contents = pkcs12::decode(archive, password)?;
        let mut record = CertificateRecord::from_der(&contents.certificate, friendly_name, store_name)?;
        record.has_private_key = contents.private_key.is_some();

        let _guard = self.locks.lock(&record.thumbprint).await;
        self.store
            .put(&record, &contents.certificate, contents.private_key.as_deref())
            .await?;

        info!(
            thumbprint = %record.thumbprint,
            store = %record.store_name,
            friendly_name = %record.friendly_name,
            not_after = %record.not_after,
            "Imported certificate"
        );
        Ok(record)
    }

    pub async fn find(&self, store_name: &str, thumbprint: &Thumbprint) -> Result<CertificateRecord> {
        self.store
            .get(store_name, thumbprint)
            .await?
            .ok_or_else(|| Error::CertificateNotFound {
                thumbprint: thumbprint.to_string(),
                store: store_name.to_string(),
            })
    }

    pub async fn exists(&self, store_name: &str, thumbprint: &Thumbprint) -> Result<bool> {
        Ok(self.store.get(store_name, thumbprint).await?.is_some())
    }

    /// Delete without looking at bindings. Public callers go through
    /// `CertificateService::remove_certificate`, which reports the bindings
    /// left dangling.
    pub(crate) async fn remove(&self, store_name: &str, thumbprint: &Thumbprint) -> Result<()> {
        let _guard = self.locks.lock(thumbprint).await;
        if !self.store.delete(store_name, thumbprint).await? {
            return Err(Error::CertificateNotFound {
                thumbprint: thumbprint.to_string(),
                store: store_name.to_string(),
            });
        }
        debug!(thumbprint = %thumbprint, store = %store_name, "Removed certificate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::pkcs12_archive as archive;
    use crate::cert::store::MemoryCertificateStore;

    fn adapter() -> CertificateAdapter {
        CertificateAdapter::new(Arc::new(MemoryCertificateStore::new()))
    }

    #[tokio::test]
    async fn test_import_and_find() {
        let adapter = adapter();
        let (bytes, cert) = archive("pw");

        let record = adapter.import(&bytes, "pw", Some("Shop"), "My").await.unwrap();
        assert_eq!(record.thumbprint, Thumbprint::of(&cert));
        assert_eq!(record.friendly_name, "Shop");
        assert!(record.has_private_key);

        let found = adapter.find("My", &record.thumbprint).await.unwrap();
        assert_eq!(found, record);
        assert!(matches!(
            adapter.find("WebHosting", &record.thumbprint).await,
            Err(Error::CertificateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_password_creates_no_record() {
        let adapter = adapter();
        let (bytes, _) = archive("right");

        let result = adapter.import(&bytes, "wrong", None, "My").await;
        assert!(matches!(result, Err(Error::InvalidPassword)));
        assert!(adapter.list("My").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_certificate() {
        let adapter = adapter();
        let (bytes, cert) = archive("pw");
        let thumbprint = Thumbprint::of(&cert);
        assert!(matches!(
            adapter.remove("My", &thumbprint).await,
            Err(Error::CertificateNotFound { .. })
        ));

        adapter.import(&bytes, "pw", None, "My").await.unwrap();
        adapter.remove("My", &thumbprint).await.unwrap();
        assert!(!adapter.exists("My", &thumbprint).await.unwrap());
    }
}
