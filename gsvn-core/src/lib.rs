//! GSvn Core Library
//!
//! Domain layer of the svn:// bridge:
//! - Repository paths and recursion depth
//! - Users, credentials and authentication providers
//! - Path-based authorization (authz files)
//! - Per-repository lock coordination
//! - Repository facade plus an in-memory commit-graph store
//! - Large-file pointers and the object proxy

pub mod auth;
pub mod authz;
pub mod lfs;
pub mod lock;
pub mod path;
pub mod repository;

pub use auth::{AuthResult, Authenticator, AuthenticatorChain, Credentials, HtpasswdAuthenticator, LocalUser, LocalUserDb, Mechanism, User};
pub use authz::{AccessDenied, AccessLevel, AllowAll, PermissionGate, RepositoryAuthz, SvnAuthz};
pub use lfs::{MemoryObjectProxy, ObjectError, ObjectProxy, Pointer};
pub use lock::{ExpiredLockPolicy, Lock, LockCoordinator, LockError, LockIter, LockRequest};
pub use path::{Depth, PathError};
pub use repository::{BranchRef, DirEntry, Edit, MemoryRepository, NodeInfo, NodeKind, Repository, RepositoryError, Revision};
