//! Certificate and binding facade used by the CLIs.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::binding::{
    BindOutcome, BindingManager, BindingQuery, BindingResolution, BindingTable, EndpointKey,
    FileBindingTable, MemoryBindingTable, SslBinding,
};
use crate::cert::{
    CertificateAdapter, CertificateRecord, CertificateStore, FileCertificateStore,
    MemoryCertificateStore, Thumbprint,
};
use crate::error::Result;

pub const BINDINGS_FILE: &str = "bindings.json";

pub struct CertificateService {
    certificates: Arc<CertificateAdapter>,
    bindings: BindingManager,
}

impl CertificateService {
    pub fn new(store: Arc<dyn CertificateStore>, table: Arc<dyn BindingTable>) -> Self {
        let certificates = Arc::new(CertificateAdapter::new(store));
        let bindings = BindingManager::new(table, certificates.clone());
        Self {
            certificates,
            bindings,
        }
    }

    /// File-backed stores under `storage_dir`
    pub async fn open(storage_dir: &Path) -> Result<Self> {
        let store = FileCertificateStore::new(storage_dir.to_path_buf());
        store.init().await?;
        let table = FileBindingTable::new(storage_dir.join(BINDINGS_FILE));
        info!(storage_dir = %storage_dir.display(), "Opened certificate storage");
        Ok(Self::new(Arc::new(store), Arc::new(table)))
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryCertificateStore::new()),
            Arc::new(MemoryBindingTable::new()),
        )
    }

    pub async fn list_certificates(&self, store: &str) -> Result<Vec<CertificateRecord>> {
        self.certificates.list(store).await
    }

    pub async fn find_certificate(&self, store: &str, thumbprint: &Thumbprint) -> Result<CertificateRecord> {
        self.certificates.find(store, thumbprint).await
    }

    pub async fn import_certificate(
        &self,
        archive: &[u8],
        password: &str,
        friendly_name: Option<&str>,
        store: &str,
    ) -> Result<CertificateRecord> {
        self.certificates
            .import(archive, password, friendly_name, store)
            .await
    }

    /// Delete a certificate even if bindings still refer to it. Those
    /// bindings are returned and logged; they now resolve as dangling.
    pub async fn remove_certificate(&self, store: &str, thumbprint: &Thumbprint) -> Result<Vec<SslBinding>> {
        self.certificates.remove(store, thumbprint).await?;

        let dangling: Vec<SslBinding> = self
            .bindings
            .query(&BindingQuery::Certificate(*thumbprint))
            .await?
            .into_iter()
            .filter(|b| b.store == store)
            .collect();
        for binding in &dangling {
            warn!(
                endpoint = %binding.endpoint,
                thumbprint = %thumbprint,
                owner = %binding.owner,
                "Certificate removed while still bound"
            );
        }
        Ok(dangling)
    }

    /// Unbind every IP endpoint using the certificate, then delete it.
    /// SNI bindings are left alone and returned as dangling.
    pub async fn remove_certificate_and_bindings(
        &self,
        store: &str,
        thumbprint: &Thumbprint,
    ) -> Result<Vec<SslBinding>> {
        self.certificates.find(store, thumbprint).await?;
        for binding in self.bindings_using(store, thumbprint, false).await? {
            self.bindings.unbind(&binding.endpoint).await?;
        }
        self.remove_certificate(store, thumbprint).await
    }

    /// Unbind every SNI endpoint using the certificate; the certificate stays
    pub async fn unbind_certificate(&self, store: &str, thumbprint: &Thumbprint) -> Result<Vec<EndpointKey>> {
        let mut removed = Vec::new();
        for binding in self.bindings_using(store, thumbprint, true).await? {
            if self.bindings.unbind(&binding.endpoint).await? {
                removed.push(binding.endpoint);
            }
        }
        Ok(removed)
    }

    async fn bindings_using(&self, store: &str, thumbprint: &Thumbprint, sni: bool) -> Result<Vec<SslBinding>> {
        Ok(self
            .bindings
            .query(&BindingQuery::Certificate(*thumbprint))
            .await?
            .into_iter()
            .filter(|b| b.store == store && b.endpoint.is_sni() == sni)
            .collect())
    }

    pub async fn bind_endpoint(
        &self,
        endpoint: EndpointKey,
        thumbprint: Thumbprint,
        store: &str,
        owner: Uuid,
    ) -> Result<BindOutcome> {
        self.bindings.bind(endpoint, thumbprint, store, owner).await
    }

    pub async fn unbind_endpoint(&self, endpoint: &EndpointKey) -> Result<bool> {
        self.bindings.unbind(endpoint).await
    }

    pub async fn query_bindings(&self, query: &BindingQuery) -> Result<Vec<SslBinding>> {
        self.bindings.query(query).await
    }

    pub async fn resolve_binding(&self, endpoint: &EndpointKey) -> Result<BindingResolution> {
        self.bindings.resolve(endpoint).await
    }

    pub async fn dangling_bindings(&self) -> Result<Vec<SslBinding>> {
        self.bindings.dangling().await
    }
}
