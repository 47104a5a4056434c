//! Large-file offloading
//!
//! Files tracked by Git LFS are stored in the commit graph as small text
//! pointers. When a client asks for such a file, the payload is fetched
//! through an [`ObjectProxy`] instead of being served from the pointer.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// First line of every pointer file
pub const POINTER_VERSION: &str = "version https://git-lfs.github.com/spec/v1";

/// Pointers are tiny; anything larger is ordinary content.
const MAX_POINTER_SIZE: usize = 1024;

/// Errors raised while fetching a large object
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Object {oid} has size {actual}, pointer says {expected}")]
    SizeMismatch { oid: String, expected: u64, actual: u64 },

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// A parsed LFS pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    /// `sha256:<hex>`
    pub oid: String,
    pub size: u64,
}

impl Pointer {
    /// Parse pointer file content; `None` when `content` is not a pointer
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() > MAX_POINTER_SIZE {
            return None;
        }
        let text = std::str::from_utf8(content).ok()?;
        let mut lines = text.lines();
        if lines.next()? != POINTER_VERSION {
            return None;
        }

        let mut oid = None;
        let mut size = None;
        for line in lines {
            let (key, value) = line.split_once(' ')?;
            match key {
                "oid" => {
                    let hash = value.strip_prefix("sha256:")?;
                    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return None;
                    }
                    oid = Some(value.to_ascii_lowercase());
                }
                "size" => size = Some(value.parse().ok()?),
                _ => {}
            }
        }
        Some(Self { oid: oid?, size: size? })
    }

    /// Pointer file content for this object
    pub fn render(&self) -> String {
        format!("{}\noid {}\nsize {}\n", POINTER_VERSION, self.oid, self.size)
    }
}

/// Pass-through access to an external large-object store
#[async_trait]
pub trait ObjectProxy: Send + Sync {
    /// Fetch the payload of `pointer`
    async fn fetch(&self, pointer: &Pointer) -> Result<Bytes, ObjectError>;
}

/// Object store kept in memory
#[derive(Debug, Default)]
pub struct MemoryObjectProxy {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryObjectProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload under `oid`, returning the matching pointer
    pub async fn insert(&self, oid: impl Into<String>, payload: Bytes) -> Pointer {
        let pointer = Pointer {
            oid: oid.into(),
            size: payload.len() as u64,
        };
        self.objects.write().await.insert(pointer.oid.clone(), payload);
        pointer
    }
}

#[async_trait]
impl ObjectProxy for MemoryObjectProxy {
    async fn fetch(&self, pointer: &Pointer) -> Result<Bytes, ObjectError> {
        let payload = self
            .objects
            .read()
            .await
            .get(&pointer.oid)
            .cloned()
            .ok_or_else(|| ObjectError::NotFound(pointer.oid.clone()))?;
        if payload.len() as u64 != pointer.size {
            return Err(ObjectError::SizeMismatch {
                oid: pointer.oid.clone(),
                expected: pointer.size,
                actual: payload.len() as u64,
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "sha256:4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393";

    #[test]
    fn test_parse_pointer() {
        let content = format!("{}\noid {}\nsize 12345\n", POINTER_VERSION, OID);
        let pointer = Pointer::parse(content.as_bytes()).unwrap();
        assert_eq!(pointer.oid, OID);
        assert_eq!(pointer.size, 12345);
        assert_eq!(pointer.render(), content);
    }

    #[test]
    fn test_not_a_pointer() {
        assert!(Pointer::parse(b"plain text\n").is_none());
        assert!(Pointer::parse(format!("{}\noid md5:abc\nsize 1\n", POINTER_VERSION).as_bytes()).is_none());
        assert!(Pointer::parse(format!("{}\noid {}\n", POINTER_VERSION, OID).as_bytes()).is_none());
        assert!(Pointer::parse(&[b'x'; 2048]).is_none());
    }

    #[tokio::test]
    async fn test_memory_proxy() {
        let proxy = MemoryObjectProxy::new();
        let pointer = proxy.insert(OID, Bytes::from_static(b"big payload")).await;
        assert_eq!(&proxy.fetch(&pointer).await.unwrap()[..], b"big payload");

        let wrong = Pointer { oid: OID.to_string(), size: 3 };
        assert!(matches!(proxy.fetch(&wrong).await, Err(ObjectError::SizeMismatch { .. })));

        let missing = Pointer { oid: "sha256:00".to_string(), size: 1 };
        assert!(matches!(proxy.fetch(&missing).await, Err(ObjectError::NotFound(_))));
    }
}
