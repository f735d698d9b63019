use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::cert::{CertificateAdapter, Thumbprint};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;

use super::{BindingQuery, BindingResolution, BindingTable, EndpointKey, SslBinding};

/// What `bind` did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Created,
    /// Same owner, different certificate
    Replaced,
    Unchanged,
}

/// Binds certificates to endpoints.
///
/// Calls for one endpoint are serialized through an advisory lock held for
/// that call only. Failures of the table are returned as they happen.
pub struct BindingManager {
    table: Arc<dyn BindingTable>,
    certificates: Arc<CertificateAdapter>,
    locks: KeyedLocks<EndpointKey>,
}

impl BindingManager {
    pub fn new(table: Arc<dyn BindingTable>, certificates: Arc<CertificateAdapter>) -> Self {
        Self {
            table,
            certificates,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn bind(
        &self,
        endpoint: EndpointKey,
        thumbprint: Thumbprint,
        store: &str,
        owner: Uuid,
    ) -> Result<BindOutcome> {
        let _guard = self.locks.lock(&endpoint).await;

        if !self.certificates.exists(store, &thumbprint).await? {
            return Err(Error::CertificateNotFound {
                thumbprint: thumbprint.to_string(),
                store: store.to_string(),
            });
        }

        let outcome = match self.table.lookup(&endpoint).await? {
            Some(existing) if existing.owner != owner => {
                return Err(Error::DuplicateBinding(format!(
                    "{endpoint} is already bound for application {}",
                    existing.owner
                )));
            }
            Some(existing) if existing.thumbprint == thumbprint && existing.store == store => {
                debug!(endpoint = %endpoint, "Binding already present");
                return Ok(BindOutcome::Unchanged);
            }
            Some(_) => BindOutcome::Replaced,
            None => BindOutcome::Created,
        };

        self.table
            .insert(SslBinding {
                endpoint: endpoint.clone(),
                thumbprint,
                store: store.to_string(),
                owner,
            })
            .await?;

        info!(
            endpoint = %endpoint,
            thumbprint = %thumbprint,
            store = %store,
            owner = %owner,
            outcome = ?outcome,
            "Bound certificate"
        );
        Ok(outcome)
    }

    /// Returns whether a binding was removed; an absent endpoint is not an error
    pub async fn unbind(&self, endpoint: &EndpointKey) -> Result<bool> {
        let _guard = self.locks.lock(endpoint).await;
        let removed = self.table.delete(endpoint).await?;
        if removed {
            info!(endpoint = %endpoint, "Removed binding");
        } else {
            debug!(endpoint = %endpoint, "No binding to remove");
        }
        Ok(removed)
    }

    pub async fn query(&self, query: &BindingQuery) -> Result<Vec<SslBinding>> {
        Ok(self
            .table
            .list()
            .await?
            .into_iter()
            .filter(|b| query.matches(b))
            .collect())
    }

    pub async fn resolve(&self, endpoint: &EndpointKey) -> Result<BindingResolution> {
        let Some(binding) = self.table.lookup(endpoint).await? else {
            return Ok(BindingResolution::Unbound);
        };
        match self.certificates.find(&binding.store, &binding.thumbprint).await {
            Ok(record) => Ok(BindingResolution::Bound(binding, record)),
            Err(Error::CertificateNotFound { .. }) => Ok(BindingResolution::Dangling(binding)),
            Err(e) => Err(e),
        }
    }

    /// Bindings whose certificate is no longer in its store
    pub async fn dangling(&self) -> Result<Vec<SslBinding>> {
        let mut dangling = Vec::new();
        for binding in self.table.list().await? {
            if !self.certificates.exists(&binding.store, &binding.thumbprint).await? {
                dangling.push(binding);
            }
        }
        Ok(dangling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::MemoryBindingTable;
    use crate::cert::MemoryCertificateStore;

    async fn manager_with_certificate() -> (BindingManager, Thumbprint) {
        let certificates = Arc::new(CertificateAdapter::new(Arc::new(MemoryCertificateStore::new())));
        let (archive, cert) = crate::cert::pkcs12_archive("pw");
        certificates.import(&archive, "pw", None, "My").await.unwrap();
        let manager = BindingManager::new(Arc::new(MemoryBindingTable::new()), certificates);
        (manager, Thumbprint::of(&cert))
    }

    fn ip(s: &str) -> EndpointKey {
        EndpointKey::Ip(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_bind_is_non_duplicating() {
        let (manager, thumbprint) = manager_with_certificate().await;
        let owner = Uuid::new_v4();
        let endpoint = ip("10.0.0.1:443");

        assert_eq!(
            manager.bind(endpoint.clone(), thumbprint, "My", owner).await.unwrap(),
            BindOutcome::Created
        );
        assert_eq!(
            manager.bind(endpoint.clone(), thumbprint, "My", owner).await.unwrap(),
            BindOutcome::Unchanged
        );
        assert!(matches!(
            manager.bind(endpoint, thumbprint, "My", Uuid::new_v4()).await,
            Err(Error::DuplicateBinding(_))
        ));
        assert_eq!(manager.query(&BindingQuery::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_requires_certificate_in_store() {
        let (manager, thumbprint) = manager_with_certificate().await;
        let result = manager
            .bind(ip("10.0.0.1:443"), thumbprint, "WebHosting", Uuid::new_v4())
            .await;
        assert!(matches!(result, Err(Error::CertificateNotFound { .. })));
        assert!(manager.query(&BindingQuery::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unbind_is_idempotent() {
        let (manager, thumbprint) = manager_with_certificate().await;
        let endpoint = EndpointKey::sni("shop.example.com", 443);
        manager
            .bind(endpoint.clone(), thumbprint, "My", Uuid::new_v4())
            .await
            .unwrap();

        assert!(manager.unbind(&endpoint).await.unwrap());
        assert!(!manager.unbind(&endpoint).await.unwrap());
        assert_eq!(manager.resolve(&endpoint).await.unwrap(), BindingResolution::Unbound);
    }

    #[tokio::test]
    async fn test_query_scopes() {
        let (manager, thumbprint) = manager_with_certificate().await;
        let app = Uuid::new_v4();
        let other = Uuid::new_v4();
        manager.bind(ip("10.0.0.1:443"), thumbprint, "My", app).await.unwrap();
        manager
            .bind(EndpointKey::sni("a.example.com", 443), thumbprint, "My", other)
            .await
            .unwrap();

        assert_eq!(manager.query(&BindingQuery::Ip).await.unwrap().len(), 1);
        let sni = manager.query(&BindingQuery::Sni).await.unwrap();
        assert_eq!(sni[0].owner, other);
        assert_eq!(manager.query(&BindingQuery::Owner(app)).await.unwrap().len(), 1);
        assert_eq!(
            manager
                .query(&BindingQuery::Certificate(thumbprint))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_removed_certificate_leaves_dangling_binding() {
        let (manager, thumbprint) = manager_with_certificate().await;
        let endpoint = ip("10.0.0.1:443");
        manager
            .bind(endpoint.clone(), thumbprint, "My", Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(
            manager.resolve(&endpoint).await.unwrap(),
            BindingResolution::Bound(_, _)
        ));

        manager.certificates.remove("My", &thumbprint).await.unwrap();

        assert_eq!(manager.query(&BindingQuery::All).await.unwrap().len(), 1);
        let BindingResolution::Dangling(binding) = manager.resolve(&endpoint).await.unwrap() else {
            panic!("expected a dangling reference");
        };
        assert_eq!(binding.thumbprint, thumbprint);
        assert_eq!(manager.dangling().await.unwrap(), vec![binding]);
    }
}
