use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::cert::Thumbprint;
use crate::error::{Error, Result};

use super::{EndpointKey, SslBinding};

/// The transport layer's binding tables.
///
/// Implementations may be shared with other processes; callers serialize
/// their own writes per endpoint but must not assume the table is unchanged
/// between calls.
#[async_trait]
pub trait BindingTable: Send + Sync {
    async fn lookup(&self, endpoint: &EndpointKey) -> Result<Option<SslBinding>>;

    /// Create or overwrite the binding for `binding.endpoint`
    async fn insert(&self, binding: SslBinding) -> Result<()>;

    /// Returns false if nothing was bound
    async fn delete(&self, endpoint: &EndpointKey) -> Result<bool>;

    /// IP bindings first, then SNI bindings, each ordered by endpoint
    async fn list(&self) -> Result<Vec<SslBinding>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableFile {
    #[serde(default)]
    ip: Vec<IpEntry>,
    #[serde(default)]
    sni: Vec<SniEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IpEntry {
    address: SocketAddr,
    thumbprint: Thumbprint,
    store: String,
    owner: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct SniEntry {
    host: String,
    port: u16,
    thumbprint: Thumbprint,
    store: String,
    owner: Uuid,
}

impl TableFile {
    fn into_map(self) -> BTreeMap<EndpointKey, SslBinding> {
        let ip = self.ip.into_iter().map(|e| SslBinding {
            endpoint: EndpointKey::Ip(e.address),
            thumbprint: e.thumbprint,
            store: e.store,
            owner: e.owner,
        });
        let sni = self.sni.into_iter().map(|e| SslBinding {
            endpoint: EndpointKey::sni(&e.host, e.port),
            thumbprint: e.thumbprint,
            store: e.store,
            owner: e.owner,
        });
        ip.chain(sni).map(|b| (b.endpoint.clone(), b)).collect()
    }

    fn from_map(map: &BTreeMap<EndpointKey, SslBinding>) -> Self {
        let mut file = TableFile::default();
        for binding in map.values() {
            match &binding.endpoint {
                EndpointKey::Ip(address) => file.ip.push(IpEntry {
                    address: *address,
                    thumbprint: binding.thumbprint,
                    store: binding.store.clone(),
                    owner: binding.owner,
                }),
                EndpointKey::Sni { host, port } => file.sni.push(SniEntry {
                    host: host.clone(),
                    port: *port,
                    thumbprint: binding.thumbprint,
                    store: binding.store.clone(),
                    owner: binding.owner,
                }),
            }
        }
        file
    }
}

/// Binding tables persisted as one JSON document.
///
/// The file is re-read on every call so changes made by other processes are
/// seen, and rewritten through a temp file and rename.
pub struct FileBindingTable {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileBindingTable {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn transport_err(&self, e: impl std::fmt::Display) -> Error {
        Error::Transport(format!("{}: {e}", self.path.display()))
    }

    async fn load(&self) -> Result<BTreeMap<EndpointKey, SslBinding>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.transport_err(e)),
        };
        let file: TableFile = serde_json::from_str(&content).map_err(|e| self.transport_err(e))?;
        Ok(file.into_map())
    }

    async fn store(&self, map: &BTreeMap<EndpointKey, SslBinding>) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(&TableFile::from_map(map)).map_err(|e| self.transport_err(e))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &content))
            .await
            .map_err(|e| self.transport_err(e))?
            .map_err(|e| self.transport_err(e))?;
        debug!(path = %self.path.display(), bindings = map.len(), "Wrote binding table");
        Ok(())
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".bindings-")
        .tempfile_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl BindingTable for FileBindingTable {
    async fn lookup(&self, endpoint: &EndpointKey) -> Result<Option<SslBinding>> {
        Ok(self.load().await?.remove(endpoint))
    }

    async fn insert(&self, binding: SslBinding) -> Result<()> {
        let _write = self.write.lock().await;
        let mut map = self.load().await?;
        map.insert(binding.endpoint.clone(), binding);
        self.store(&map).await
    }

    async fn delete(&self, endpoint: &EndpointKey) -> Result<bool> {
        let _write = self.write.lock().await;
        let mut map = self.load().await?;
        if map.remove(endpoint).is_none() {
            return Ok(false);
        }
        self.store(&map).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<SslBinding>> {
        Ok(self.load().await?.into_values().collect())
    }
}

#[derive(Default)]
pub struct MemoryBindingTable {
    bindings: RwLock<BTreeMap<EndpointKey, SslBinding>>,
}

impl MemoryBindingTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingTable for MemoryBindingTable {
    async fn lookup(&self, endpoint: &EndpointKey) -> Result<Option<SslBinding>> {
        Ok(self.bindings.read().await.get(endpoint).cloned())
    }

    async fn insert(&self, binding: SslBinding) -> Result<()> {
        self.bindings
            .write()
            .await
            .insert(binding.endpoint.clone(), binding);
        Ok(())
    }

    async fn delete(&self, endpoint: &EndpointKey) -> Result<bool> {
        Ok(self.bindings.write().await.remove(endpoint).is_some())
    }

    async fn list(&self) -> Result<Vec<SslBinding>> {
        Ok(self.bindings.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(endpoint: EndpointKey) -> SslBinding {
        SslBinding {
            endpoint,
            thumbprint: Thumbprint::of(b"certificate"),
            store: "My".to_string(),
            owner: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_file_table_keeps_separate_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");
        let table = FileBindingTable::new(path.clone());
        assert!(table.list().await.unwrap().is_empty());

        let ip = binding(EndpointKey::Ip("10.0.0.1:443".parse().unwrap()));
        let sni = binding(EndpointKey::sni("shop.example.com", 443));
        table.insert(sni.clone()).await.unwrap();
        table.insert(ip.clone()).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["ip"][0]["address"], "10.0.0.1:443");
        assert_eq!(json["sni"][0]["host"], "shop.example.com");
        assert_eq!(json["sni"][0]["thumbprint"], ip.thumbprint.to_string());

        // A second handle on the same file sees the same state
        let other = FileBindingTable::new(path);
        assert_eq!(other.list().await.unwrap(), vec![ip.clone(), sni.clone()]);
        assert_eq!(other.lookup(&sni.endpoint).await.unwrap(), Some(sni.clone()));

        assert!(other.delete(&ip.endpoint).await.unwrap());
        assert!(!table.delete(&ip.endpoint).await.unwrap());
        assert_eq!(table.list().await.unwrap(), vec![sni]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let table = FileBindingTable::new(path);
        assert!(matches!(table.list().await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_memory_table_overwrites() {
        let table = MemoryBindingTable::new();
        let endpoint = EndpointKey::Ip("0.0.0.0:443".parse().unwrap());
        table.insert(binding(endpoint.clone())).await.unwrap();
        let replacement = binding(endpoint.clone());
        table.insert(replacement.clone()).await.unwrap();
        assert_eq!(table.list().await.unwrap(), vec![replacement]);
    }
}
