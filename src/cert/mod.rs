mod adapter;
mod pkcs12;
mod record;
mod store;

pub use adapter::CertificateAdapter;
pub use pkcs12::{Pkcs12Contents, decode as decode_pkcs12};
pub use record::{CertificateRecord, Thumbprint};
pub use store::{CertificateStore, FileCertificateStore, MemoryCertificateStore};

/// Store used when the caller does not name one
pub const DEFAULT_STORE: &str = "My";

#[cfg(test)]
pub(crate) use pkcs12::tests::archive as pkcs12_archive;
