use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::endpoint::Endpoint;

/// Identity of a call for caching and debouncing.
///
/// Two keys are equal when the hashes of their metadata are equal.
#[derive(Debug, Clone, Eq)]
pub struct EndpointKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for EndpointKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for EndpointKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl EndpointKey {
    /// Creates a builder that accepts the stable metadata forming the key.
    pub fn builder() -> EndpointKeyBuilder {
        EndpointKeyBuilder {
            metadata: String::new(),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`EndpointKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    /// Picks one of `shards` buckets for this key.
    pub fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.hash[..8]);
        (u64::from_le_bytes(prefix) % shards.max(1) as u64) as usize
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        EndpointKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`EndpointKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input is then hashed to form the [`EndpointKey`], and is also persisted alongside
/// cached responses to help debugging.
pub struct EndpointKeyBuilder {
    metadata: String,
}

impl EndpointKeyBuilder {
    /// Writes the identity of an [`Endpoint`] into the key.
    pub fn write_endpoint(&mut self, endpoint: &Endpoint) -> fmt::Result {
        write!(
            self.metadata,
            "name: {}\nmethod: {}\nurl: {}\n",
            endpoint.name, endpoint.method, endpoint.url
        )
    }

    /// Finalize the [`EndpointKey`].
    pub fn build(self) -> EndpointKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        EndpointKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for EndpointKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

/// Derives the [`EndpointKey`] of a call.
///
/// Implementations must be pure: the same endpoint always yields the same key.
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, endpoint: &Endpoint) -> EndpointKey;
}

/// Keys calls by endpoint name, method and full URL including the query.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestKeyDeriver;

impl KeyDeriver for RequestKeyDeriver {
    fn derive(&self, endpoint: &Endpoint) -> EndpointKey {
        let mut builder = EndpointKey::builder();
        // writing into a `String` cannot fail
        let _ = builder.write_endpoint(endpoint);
        builder.build()
    }
}
