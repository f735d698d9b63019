//! Administration core for a hierarchical web-server configuration store.
//!
//! [`server::ServerContext`] opens the configuration documents, resolves
//! effective sections and hands out [`edit::EditableSection`]s;
//! [`service::CertificateService`] manages certificates and the SSL
//! bindings that refer to them.

pub mod binding;
pub mod cert;
pub mod config;
pub mod document;
pub mod edit;
pub mod error;
pub mod locks;
pub mod resolve;
pub mod schema;
pub mod server;
pub mod service;
pub mod sites;

pub use error::{Error, ErrorKind, Result};
pub use server::ServerContext;
pub use service::CertificateService;
