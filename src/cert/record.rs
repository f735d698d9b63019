use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// SHA-1 of a certificate's DER encoding, the key certificates are found by
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Thumbprint([u8; 20]);

impl Thumbprint {
    pub fn of(der: &[u8]) -> Self {
        Self(Sha1::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thumbprint({self})")
    }
}

/// Accepts either case and ignores the spaces and colons that certificate
/// viewers put between byte pairs.
impl FromStr for Thumbprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits: Vec<u8> = s
            .bytes()
            .filter(|b| !matches!(b, b' ' | b':'))
            .collect();
        let invalid = || Error::InvalidInput(format!("'{s}' is not a 40-digit certificate hash"));
        if digits.len() != 40 {
            return Err(invalid());
        }

        let mut out = [0u8; 20];
        for (byte, pair) in out.iter_mut().zip(digits.chunks(2)) {
            let text = std::str::from_utf8(pair).map_err(|_| invalid())?;
            *byte = u8::from_str_radix(text, 16).map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl Serialize for Thumbprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Thumbprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A certificate held in a named store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub thumbprint: Thumbprint,
    pub friendly_name: String,
    pub store_name: String,
    pub subject: String,
    pub issuer: String,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub has_private_key: bool,
}

impl CertificateRecord {
    /// Describe a DER certificate. Without a friendly name the subject is used.
    pub fn from_der(der: &[u8], friendly_name: Option<&str>, store_name: &str) -> Result<Self> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::MalformedCertificate(format!("Failed to parse certificate: {e:?}")))?;

        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::X509("Invalid timestamp".to_string()))?;
        let subject = cert.subject().to_string();

        Ok(Self {
            thumbprint: Thumbprint::of(der),
            friendly_name: friendly_name
                .map(str::to_string)
                .unwrap_or_else(|| subject.clone()),
            store_name: store_name.to_string(),
            subject,
            issuer: cert.issuer().to_string(),
            not_after,
            has_private_key: false,
        })
    }
}
