use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::ReconcileError;

/// Prefix of every packaged bundle; also the first bytes hashed.
pub const BUNDLE_MAGIC: &[u8] = b"UPTIME-BUNDLE/1\0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleDigest(String);

impl BundleDigest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare hex part, used in object keys.
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }
}

impl fmt::Display for BundleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A packaged unit of code.
///
/// Entries are keyed by path in a `BTreeMap`, so the packaged byte stream and
/// the digest depend only on the set of (path, content) pairs and never on the
/// order they were added in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBundle {
    entries: BTreeMap<String, Vec<u8>>,
    digest: BundleDigest,
}

impl ArtifactBundle {
    pub fn single(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Result<Self, ReconcileError> {
        Self::from_entries([(name.into(), content.into())])
    }

    pub fn from_entries<I>(entries: I) -> Result<Self, ReconcileError>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let mut sorted = BTreeMap::new();
        for (path, content) in entries {
            if path.trim().is_empty() {
                return Err(ReconcileError::EmptyPath);
            }
            if sorted.insert(path.clone(), content).is_some() {
                return Err(ReconcileError::DuplicatePath { path });
            }
        }
        if sorted.is_empty() {
            return Err(ReconcileError::EmptyBundle);
        }

        let digest = BundleDigest::of_bytes(&encode(&sorted));
        Ok(Self {
            entries: sorted,
            digest,
        })
    }

    pub fn digest(&self) -> &BundleDigest {
        &self.digest
    }

    /// Name of the first entry; the only entry for single-file bundles.
    pub fn logical_name(&self) -> &str {
        self.entries.keys().next().map(String::as_str).unwrap_or_default()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The canonical byte stream uploaded for the unit. Hashing it yields
    /// [`ArtifactBundle::digest`].
    pub fn package(&self) -> Vec<u8> {
        encode(&self.entries)
    }
}

fn encode(entries: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let size: usize = entries.iter().map(|(p, c)| p.len() + c.len() + 16).sum();
    let mut out = Vec::with_capacity(BUNDLE_MAGIC.len() + size);
    out.extend_from_slice(BUNDLE_MAGIC);
    for (path, content) in entries {
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        out.extend_from_slice(&(path.len() as u64).to_be_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(&(content.len() as u64).to_be_bytes());
        out.extend_from_slice(content);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_format() {
        let bundle = ArtifactBundle::single("app.py", b"print('hi')".to_vec()).unwrap();
        let digest = bundle.digest();
        assert!(digest.as_str().starts_with("sha256:"));
        assert_eq!(digest.hex().len(), 64);
    }

    #[test]
    fn test_package_hashes_to_digest() {
        let bundle = ArtifactBundle::single("app.py", b"handler".to_vec()).unwrap();
        assert_eq!(&BundleDigest::of_bytes(&bundle.package()), bundle.digest());
        assert!(bundle.package().starts_with(BUNDLE_MAGIC));
    }

    #[test]
    fn test_length_prefix_separates_boundaries() {
        let a = ArtifactBundle::single("ab", b"c".to_vec()).unwrap();
        let b = ArtifactBundle::single("a", b"bc".to_vec()).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_logical_name() {
        let bundle = ArtifactBundle::single("app.py", Vec::new()).unwrap();
        assert_eq!(bundle.logical_name(), "app.py");
        assert_eq!(bundle.len(), 1);
        assert!(!bundle.is_empty());
    }

    #[test]
    fn test_invalid_entries() {
        assert!(matches!(
            ArtifactBundle::from_entries(Vec::new()),
            Err(ReconcileError::EmptyBundle)
        ));
        assert!(matches!(
            ArtifactBundle::single(" ", b"x".to_vec()),
            Err(ReconcileError::EmptyPath)
        ));
        let dup = vec![
            ("app.py".to_string(), b"1".to_vec()),
            ("app.py".to_string(), b"2".to_vec()),
        ];
        assert!(matches!(
            ArtifactBundle::from_entries(dup),
            Err(ReconcileError::DuplicatePath { .. })
        ));
    }
}
