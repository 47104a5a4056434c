//! Repository facade
//!
//! The protocol engine never talks to the commit-graph store directly; it
//! resolves paths and revisions through the [`Repository`] trait. An
//! in-memory implementation backs tests and standalone servers.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::path;

/// Revision number of a branch
pub type Revision = u64;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors raised by a repository backend
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Path '{path}' not found in revision {revision}")]
    NotFound { path: String, revision: Revision },

    #[error("No such revision {0}")]
    NoSuchRevision(Revision),

    #[error("Path '{0}' is not a directory")]
    NotDirectory(String),

    #[error("Path '{0}' is not a file")]
    NotFile(String),

    #[error("Unknown branch '{0}'")]
    UnknownBranch(String),

    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepositoryError {
    /// Whether the backing store itself is unreachable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Node kind as seen through the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Dir,
}

/// Metadata of a path at a revision
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub path: String,
    pub kind: NodeKind,
    pub size: u64,
    /// Revision in which the node last changed
    pub created_rev: Revision,
    pub created_date: DateTime<Utc>,
    pub last_author: Option<String>,
    pub properties: BTreeMap<String, String>,
}

/// Entry of a directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeInfo,
}

/// Maps a repository-relative root onto a named ref of the backing store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub repository: String,
    pub root: String,
    pub ref_name: String,
}

impl BranchRef {
    pub fn new(repository: impl Into<String>, ref_name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            root: "/".to_string(),
            ref_name: ref_name.into(),
        }
    }
}

/// Path and revision queries against the backing store
#[async_trait]
pub trait Repository: Send + Sync {
    /// Repository UUID reported to clients
    fn uuid(&self) -> &str;

    /// Newest revision of a branch
    async fn latest_revision(&self, branch: &BranchRef) -> Result<Revision>;

    /// Newest revision created at or before `date`
    async fn dated_revision(&self, branch: &BranchRef, date: DateTime<Utc>) -> Result<Revision>;

    /// Resolve a path at a revision; `Ok(None)` when the path does not exist
    async fn resolve_path(&self, branch: &BranchRef, path: &str, revision: Revision) -> Result<Option<NodeInfo>>;

    /// Entries of a directory, sorted by name
    async fn list_dir(&self, branch: &BranchRef, path: &str, revision: Revision) -> Result<Vec<DirEntry>>;

    /// Content of a file
    async fn read_file(&self, branch: &BranchRef, path: &str, revision: Revision) -> Result<Bytes>;
}

/// A change applied by [`MemoryRepository::commit`]
#[derive(Debug, Clone)]
pub enum Edit {
    /// Add or replace a file, creating missing parent directories
    PutFile { path: String, content: Bytes },
    /// Create a directory and its missing parents
    MakeDir(String),
    /// Delete a node and everything below it
    Delete(String),
    /// Set a node property
    SetProperty { path: String, name: String, value: String },
}

#[derive(Debug, Clone)]
struct StoredNode {
    kind: NodeKind,
    content: Bytes,
    properties: BTreeMap<String, String>,
    changed_rev: Revision,
}

#[derive(Debug, Clone)]
struct RevisionState {
    author: Option<String>,
    date: DateTime<Utc>,
    nodes: Arc<BTreeMap<String, StoredNode>>,
}

/// In-memory repository
///
/// Each branch is an append-only list of full tree snapshots; revision N
/// of a branch is index N.
pub struct MemoryRepository {
    branches: RwLock<HashMap<String, Vec<RevisionState>>>,
    uuid: String,
}

impl MemoryRepository {
    /// Create a repository whose branches start with an empty revision 0
    pub fn new<I, S>(branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = StoredNode {
            kind: NodeKind::Dir,
            content: Bytes::new(),
            properties: BTreeMap::new(),
            changed_rev: 0,
        };
        let initial = RevisionState {
            author: None,
            date: Utc::now(),
            nodes: Arc::new(BTreeMap::from([("/".to_string(), root)])),
        };
        Self {
            branches: RwLock::new(branches.into_iter().map(|b| (b.into(), vec![initial.clone()])).collect()),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Append a revision to `branch`
    pub async fn commit(&self, branch: &str, author: &str, edits: Vec<Edit>) -> Result<Revision> {
        let mut branches = self.branches.write().await;
        let history = branches
            .get_mut(branch)
            .ok_or_else(|| RepositoryError::UnknownBranch(branch.to_string()))?;
        let rev = history.len() as Revision;
        let mut nodes = history
            .last()
            .map(|state| (*state.nodes).clone())
            .unwrap_or_default();

        for edit in edits {
            match edit {
                Edit::PutFile { path, content } => {
                    let path = Self::normalized(&path)?;
                    if path == "/" {
                        return Err(RepositoryError::NotFile(path));
                    }
                    Self::make_parents(&mut nodes, &path, rev)?;
                    let properties = nodes.get(&path).map(|n| n.properties.clone()).unwrap_or_default();
                    nodes.insert(
                        path.clone(),
                        StoredNode {
                            kind: NodeKind::File,
                            content,
                            properties,
                            changed_rev: rev,
                        },
                    );
                    Self::touch_ancestors(&mut nodes, &path, rev);
                }
                Edit::MakeDir(path) => {
                    let path = Self::normalized(&path)?;
                    Self::make_parents(&mut nodes, &path, rev)?;
                    nodes.entry(path.clone()).or_insert(StoredNode {
                        kind: NodeKind::Dir,
                        content: Bytes::new(),
                        properties: BTreeMap::new(),
                        changed_rev: rev,
                    });
                    Self::touch_ancestors(&mut nodes, &path, rev);
                }
                Edit::Delete(path) => {
                    let path = Self::normalized(&path)?;
                    if path == "/" {
                        return Err(RepositoryError::NotDirectory(path));
                    }
                    if nodes.remove(&path).is_none() {
                        return Err(RepositoryError::NotFound { path, revision: rev - 1 });
                    }
                    nodes.retain(|p, _| path::relative_to(&path, p).is_none());
                    Self::touch_ancestors(&mut nodes, &path, rev);
                }
                Edit::SetProperty { path, name, value } => {
                    let path = Self::normalized(&path)?;
                    let node = nodes.get_mut(&path).ok_or_else(|| RepositoryError::NotFound {
                        path: path.clone(),
                        revision: rev,
                    })?;
                    node.properties.insert(name, value);
                    node.changed_rev = rev;
                    Self::touch_ancestors(&mut nodes, &path, rev);
                }
            }
        }

        history.push(RevisionState {
            author: Some(author.to_string()),
            date: Utc::now(),
            nodes: Arc::new(nodes),
        });
        tracing::debug!("Committed r{} on branch {}", rev, branch);
        Ok(rev)
    }

    fn normalized(p: &str) -> Result<String> {
        path::normalize(p).map_err(|e| RepositoryError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
    }

    fn make_parents(nodes: &mut BTreeMap<String, StoredNode>, p: &str, rev: Revision) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = path::parent(p);
        loop {
            match nodes.get(current) {
                Some(node) if node.kind == NodeKind::Dir => break,
                Some(_) => return Err(RepositoryError::NotDirectory(current.to_string())),
                None => missing.push(current.to_string()),
            }
            current = path::parent(current);
        }
        for dir in missing {
            nodes.insert(
                dir,
                StoredNode {
                    kind: NodeKind::Dir,
                    content: Bytes::new(),
                    properties: BTreeMap::new(),
                    changed_rev: rev,
                },
            );
        }
        Ok(())
    }

    fn touch_ancestors(nodes: &mut BTreeMap<String, StoredNode>, p: &str, rev: Revision) {
        let mut current = p;
        while current != "/" {
            current = path::parent(current);
            if let Some(node) = nodes.get_mut(current) {
                node.changed_rev = rev;
            }
        }
    }

    /// Run `f` against a revision of `branch` under the read guard
    async fn with_revision<T>(
        &self,
        branch: &BranchRef,
        revision: Revision,
        f: impl FnOnce(&[RevisionState], &RevisionState) -> Result<T>,
    ) -> Result<T> {
        let branches = self.branches.read().await;
        let history = branches
            .get(&branch.ref_name)
            .ok_or_else(|| RepositoryError::UnknownBranch(branch.ref_name.clone()))?;
        let state = history
            .get(revision as usize)
            .ok_or(RepositoryError::NoSuchRevision(revision))?;
        f(history, state)
    }

    fn node_info(path: &str, node: &StoredNode, history: &[RevisionState]) -> NodeInfo {
        let changed = history.get(node.changed_rev as usize);
        NodeInfo {
            path: path.to_string(),
            kind: node.kind,
            size: node.content.len() as u64,
            created_rev: node.changed_rev,
            created_date: changed.map(|s| s.date).unwrap_or_else(Utc::now),
            last_author: changed.and_then(|s| s.author.clone()),
            properties: node.properties.clone(),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn latest_revision(&self, branch: &BranchRef) -> Result<Revision> {
        let branches = self.branches.read().await;
        let history = branches
            .get(&branch.ref_name)
            .ok_or_else(|| RepositoryError::UnknownBranch(branch.ref_name.clone()))?;
        Ok(history.len() as Revision - 1)
    }

    async fn dated_revision(&self, branch: &BranchRef, date: DateTime<Utc>) -> Result<Revision> {
        let branches = self.branches.read().await;
        let history = branches
            .get(&branch.ref_name)
            .ok_or_else(|| RepositoryError::UnknownBranch(branch.ref_name.clone()))?;
        Ok(history
            .iter()
            .rposition(|state| state.date <= date)
            .unwrap_or(0) as Revision)
    }

    async fn resolve_path(&self, branch: &BranchRef, p: &str, revision: Revision) -> Result<Option<NodeInfo>> {
        self.with_revision(branch, revision, |history, state| {
            Ok(state.nodes.get(p).map(|node| Self::node_info(p, node, history)))
        })
        .await
    }

    async fn list_dir(&self, branch: &BranchRef, p: &str, revision: Revision) -> Result<Vec<DirEntry>> {
        self.with_revision(branch, revision, |history, state| {
            match state.nodes.get(p) {
                None => {
                    return Err(RepositoryError::NotFound {
                        path: p.to_string(),
                        revision,
                    });
                }
                Some(node) if node.kind != NodeKind::Dir => {
                    return Err(RepositoryError::NotDirectory(p.to_string()));
                }
                Some(_) => {}
            }
            Ok(state
                .nodes
                .iter()
                .filter(|(child, _)| child.as_str() != p && path::parent(child) == p)
                .map(|(child, node)| DirEntry {
                    name: path::basename(child).to_string(),
                    node: Self::node_info(child, node, history),
                })
                .collect())
        })
        .await
    }

    async fn read_file(&self, branch: &BranchRef, p: &str, revision: Revision) -> Result<Bytes> {
        self.with_revision(branch, revision, |_, state| match state.nodes.get(p) {
            Some(node) if node.kind == NodeKind::File => Ok(node.content.clone()),
            Some(_) => Err(RepositoryError::NotFile(p.to_string())),
            None => Err(RepositoryError::NotFound {
                path: p.to_string(),
                revision,
            }),
        })
        .await
    }
}
