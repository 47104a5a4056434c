//! Per-connection session state
//!
//! A [`Session`] is created when a connection is accepted and dropped when
//! it closes. Only the handshake moves it through its states; afterwards
//! commands may re-point the session root (`reparent`) but never change the
//! identity or the repository.

use crate::context::RepositoryContext;
use crate::error::{ErrorCode, SvnServerError};
use gsvn_core::{AccessLevel, User, path};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    RepositorySelected,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::RepositorySelected => "repository-selected",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

/// Illegal session state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot move session from {from} to {to}")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
}

/// An `svn://host/repository/path` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvnUrl {
    pub host: String,
    pub repository: String,
    /// Normalized path inside the repository
    pub path: String,
}

impl SvnUrl {
    pub fn parse(url: &str) -> Result<Self, SvnServerError> {
        let illegal = |why: &str| SvnServerError::new(ErrorCode::IllegalUrl, format!("Illegal svn repository URL '{}': {}", url, why));

        let rest = url
            .get(..6)
            .filter(|scheme| scheme.eq_ignore_ascii_case("svn://"))
            .map(|_| &url[6..])
            .ok_or_else(|| illegal("scheme must be svn://"))?;
        let (host, raw_path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return Err(illegal("missing host"));
        }

        let decoded = percent_decode(raw_path).ok_or_else(|| illegal("bad percent-encoding"))?;
        let full = path::normalize(&decoded).map_err(|_| illegal("path escapes the root"))?;
        let mut parts = full.trim_start_matches('/').splitn(2, '/');
        let repository = parts.next().unwrap_or_default().to_string();
        if repository.is_empty() {
            return Err(illegal("no repository name"));
        }
        let path = format!("/{}", parts.next().unwrap_or_default());

        Ok(Self {
            host: host.to_string(),
            repository,
            path,
        })
    }

    /// URL of the repository root
    pub fn root_url(&self) -> String {
        format!("svn://{}/{}", self.host, self.repository)
    }
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let pair = bytes.get(i + 1..i + 3)?;
            out.extend(hex::decode(pair).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// State of one client connection
pub struct Session {
    id: uuid::Uuid,
    peer: Option<SocketAddr>,
    state: SessionState,
    user: User,
    protocol_version: u64,
    capabilities: BTreeSet<String>,
    client: Option<String>,
    repository: Option<Arc<RepositoryContext>>,
    root_url: String,
    root: String,
}

impl Session {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            peer,
            state: SessionState::Unauthenticated,
            user: User::anonymous(),
            protocol_version: 0,
            capabilities: BTreeSet::new(),
            client: None,
            repository: None,
            root_url: String::new(),
            root: "/".to_string(),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn protocol_version(&self) -> u64 {
        self.protocol_version
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    fn transition(&mut self, from: SessionState, to: SessionState) -> Result<(), StateError> {
        if self.state != from {
            return Err(StateError { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Record the client's greeting response
    pub fn negotiate(&mut self, version: u64, capabilities: impl IntoIterator<Item = String>, client: Option<String>) {
        self.protocol_version = version;
        self.capabilities = capabilities.into_iter().collect();
        self.client = client;
    }

    pub fn authenticate(&mut self, user: User) -> Result<(), StateError> {
        self.transition(SessionState::Unauthenticated, SessionState::Authenticated)?;
        self.user = user;
        Ok(())
    }

    pub fn select_repository(&mut self, repository: Arc<RepositoryContext>, url: &SvnUrl) -> Result<(), StateError> {
        self.transition(SessionState::Authenticated, SessionState::RepositorySelected)?;
        self.repository = Some(repository);
        self.root_url = url.root_url();
        self.root = url.path.clone();
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), StateError> {
        self.transition(SessionState::RepositorySelected, SessionState::Active)
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// The selected repository
    pub fn repository(&self) -> Result<&Arc<RepositoryContext>, SvnServerError> {
        self.repository
            .as_ref()
            .ok_or_else(|| SvnServerError::new(ErrorCode::RepositoryNotFound, "No repository selected"))
    }

    /// URL of the repository root
    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    /// Session root inside the repository
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Repository path of a client path relative to the session root
    pub fn resolve(&self, relative: &str) -> Result<String, SvnServerError> {
        Ok(path::join(&self.root, relative)?)
    }

    /// Session root that `url` designates, which must stay in this repository
    pub fn root_for_url(&self, url: &str) -> Result<String, SvnServerError> {
        let parsed = SvnUrl::parse(url)?;
        let current = self.repository()?;
        if parsed.repository != current.name {
            return Err(SvnServerError::new(
                ErrorCode::IllegalUrl,
                format!("'{}' is not in repository '{}'", url, current.name),
            ));
        }
        Ok(parsed.path)
    }

    pub fn reparent(&mut self, url: &str) -> Result<(), SvnServerError> {
        self.root = self.root_for_url(url)?;
        Ok(())
    }

    /// Ask the permission gate about a repository path
    pub fn check(&self, path: &str, required: AccessLevel) -> Result<(), SvnServerError> {
        self.repository()?.gate.check(&self.user, path, required)?;
        Ok(())
    }

    /// The session's user, which must not be anonymous
    pub fn require_user(&self) -> Result<&User, SvnServerError> {
        if self.user.is_anonymous() {
            return Err(SvnServerError::new(ErrorCode::NoUser, "Anonymous users cannot perform this operation"));
        }
        Ok(&self.user)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} ({})", self.id, peer),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsvn_core::MemoryRepository;

    fn context(name: &str) -> Arc<RepositoryContext> {
        Arc::new(RepositoryContext::new(name, "master", Arc::new(MemoryRepository::new(["master"]))))
    }

    #[test]
    fn test_parse_url() {
        let url = SvnUrl::parse("svn://localhost:3690/repo/trunk/my%20dir/").unwrap();
        assert_eq!(url.host, "localhost:3690");
        assert_eq!(url.repository, "repo");
        assert_eq!(url.path, "/trunk/my dir");
        assert_eq!(url.root_url(), "svn://localhost:3690/repo");

        assert_eq!(SvnUrl::parse("SVN://h/repo").unwrap().path, "/");
        for bad in ["http://h/repo", "svn:///repo", "svn://h/", "svn://h/repo/%zz", "svn://h/repo/../.."] {
            let err = SvnUrl::parse(bad).unwrap_err();
            assert_eq!(err.code, ErrorCode::IllegalUrl, "{}", bad);
        }
    }

    #[test]
    fn test_state_machine() {
        let mut session = Session::new(None);
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.activate().is_err());

        session.authenticate(User::named("alice", Vec::<String>::new())).unwrap();
        assert!(session.authenticate(User::anonymous()).is_err());

        let url = SvnUrl::parse("svn://h/repo/trunk").unwrap();
        session.select_repository(context("repo"), &url).unwrap();
        session.activate().unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.root(), "/trunk");
        assert_eq!(session.resolve("a/b.txt").unwrap(), "/trunk/a/b.txt");
        assert_eq!(session.resolve("").unwrap(), "/trunk");

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_reparent_stays_in_repository() {
        let mut session = Session::new(None);
        session.authenticate(User::anonymous()).unwrap();
        session
            .select_repository(context("repo"), &SvnUrl::parse("svn://h/repo").unwrap())
            .unwrap();
        session.activate().unwrap();

        session.reparent("svn://h/repo/branches/x").unwrap();
        assert_eq!(session.root(), "/branches/x");
        let err = session.reparent("svn://h/other/trunk").unwrap_err();
        assert_eq!(err.code, ErrorCode::IllegalUrl);
        assert_eq!(session.root(), "/branches/x");
        assert_eq!(session.require_user().unwrap_err().code, ErrorCode::NoUser);
    }
}
