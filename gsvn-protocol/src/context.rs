//! Per-repository shared state
//!
//! Everything sessions of the same repository share lives in one
//! [`RepositoryContext`]: the facade, the lock coordinator and the
//! permission gate. Contexts are registered once at startup.

use gsvn_core::{
    AllowAll, BranchRef, ExpiredLockPolicy, LockCoordinator, ObjectProxy, PermissionGate, Repository,
};
use std::collections::HashMap;
use std::sync::Arc;

pub struct RepositoryContext {
    pub name: String,
    pub branch: BranchRef,
    pub repository: Arc<dyn Repository>,
    pub locks: LockCoordinator,
    pub gate: Arc<dyn PermissionGate>,
    /// Large-file store; `None` serves pointer files verbatim
    pub objects: Option<Arc<dyn ObjectProxy>>,
    /// Lifetime of new locks; `None` means they never expire
    pub lock_ttl: Option<chrono::Duration>,
}

impl RepositoryContext {
    pub fn new(name: impl Into<String>, branch: impl Into<String>, repository: Arc<dyn Repository>) -> Self {
        let name = name.into();
        Self {
            branch: BranchRef::new(name.clone(), branch),
            name,
            repository,
            locks: LockCoordinator::default(),
            gate: Arc::new(AllowAll),
            objects: None,
            lock_ttl: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_object_proxy(mut self, objects: Arc<dyn ObjectProxy>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn with_lock_policy(mut self, policy: ExpiredLockPolicy, ttl: Option<chrono::Duration>) -> Self {
        self.locks = LockCoordinator::new(policy);
        self.lock_ttl = ttl;
        self
    }
}

/// Repositories served by this process, by name
#[derive(Default, Clone)]
pub struct RepositoryRegistry {
    repositories: HashMap<String, Arc<RepositoryContext>>,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository
    pub fn register(&mut self, context: RepositoryContext) -> Result<(), String> {
        if self.repositories.contains_key(&context.name) {
            return Err(format!("Repository '{}' already registered", context.name));
        }
        tracing::info!("Serving repository '{}' from branch '{}'", context.name, context.branch.ref_name);
        self.repositories.insert(context.name.clone(), Arc::new(context));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RepositoryContext>> {
        self.repositories.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.repositories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
