//! Connection handling
//!
//! [`ServerContext`] holds everything shared by all connections. Each
//! accepted socket runs [`serve_connection`]: handshake, then one command at
//! a time until the client hangs up or a fatal error ends the session.

use crate::codec::{Item, SvnStream};
use crate::commands::default_registry;
use crate::config::Config;
use crate::context::{RepositoryContext, RepositoryRegistry};
use crate::dispatch::{Dispatcher, StoreFailurePolicy};
use crate::error::ProtocolError;
use crate::handshake::handshake;
use crate::session::Session;
use anyhow::Context;
use gsvn_core::{
    Authenticator, AuthenticatorChain, HtpasswdAuthenticator, LocalUser, LocalUserDb, Mechanism,
    MemoryRepository, SvnAuthz,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Default bound on string items
pub const DEFAULT_MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection
pub struct ServerContext {
    pub realm: String,
    pub allow_anonymous: bool,
    pub authenticator: Arc<dyn Authenticator>,
    pub repositories: RepositoryRegistry,
    pub dispatcher: Dispatcher,
    pub max_string_len: usize,
}

impl ServerContext {
    pub fn new(repositories: RepositoryRegistry, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            realm: "gsvn".to_string(),
            allow_anonymous: true,
            authenticator,
            repositories,
            dispatcher: Dispatcher::new(default_registry(), StoreFailurePolicy::default()),
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    /// Build repositories, authentication and authorization from a config
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let authz = match &config.authz_file {
            Some(path) => Some(Arc::new(SvnAuthz::from_file(path).map_err(anyhow::Error::msg).with_context(
                || format!("Failed to load authz file {}", path.display()),
            )?)),
            None => None,
        };

        let mut chain = AuthenticatorChain::new();
        if !config.users.is_empty() {
            let users = config.users.iter().map(|u| LocalUser {
                name: u.name.clone(),
                password: u.password.clone(),
                groups: u.groups.clone(),
            });
            chain = chain.with(Arc::new(LocalUserDb::new(users)));
        }
        if let Some(path) = &config.htpasswd_file {
            let htpasswd = HtpasswdAuthenticator::from_file(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to load htpasswd file {}", path.display()))?;
            chain = chain.with(Arc::new(htpasswd));
        }

        let mut repositories = RepositoryRegistry::new();
        for repo in &config.repositories {
            let backend = Arc::new(MemoryRepository::new([repo.branch.clone()]));
            let mut context = RepositoryContext::new(&repo.name, &repo.branch, backend)
                .with_lock_policy(config.lock.expired, config.lock.ttl());
            if let Some(authz) = &authz {
                context = context.with_gate(Arc::new(authz.gate(&repo.name)));
            }
            repositories.register(context).map_err(anyhow::Error::msg)?;
        }

        Ok(Self {
            realm: config.realm.clone(),
            allow_anonymous: config.allow_anonymous,
            authenticator: Arc::new(chain),
            repositories,
            dispatcher: Dispatcher::new(default_registry(), config.store_failure),
            max_string_len: config.max_string_len,
        })
    }

    /// Mechanisms offered in the authentication request
    pub fn mechanisms(&self) -> Vec<Mechanism> {
        let mut mechanisms = Vec::new();
        if self.allow_anonymous {
            mechanisms.push(Mechanism::Anonymous);
        }
        for mechanism in [Mechanism::Plain, Mechanism::CramMd5] {
            if self.authenticator.supports(mechanism) {
                mechanisms.push(mechanism);
            }
        }
        mechanisms
    }
}

/// Serve one connection until it closes
///
/// A clean hangup between commands returns `Ok`. Fatal protocol errors are
/// logged and returned after the socket is shut down.
pub async fn serve_connection<R, W>(
    server: &ServerContext,
    reader: R,
    writer: W,
    peer: Option<SocketAddr>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new(peer);
    let mut stream = SvnStream::new(reader, writer, server.max_string_len);
    info!("Session {} connected", session);

    let result = run(server, &mut stream, &mut session).await;
    session.close();
    match &result {
        Ok(()) => info!("Session {} closed", session),
        Err(ProtocolError::Closed) => info!("Session {} hung up during setup", session),
        Err(e) => error!("Session {} terminated: {}", session, e),
    }
    if let Err(e) = stream.shutdown().await {
        debug!("Session {} shutdown: {}", session, e);
    }
    result
}

async fn run<R, W>(server: &ServerContext, stream: &mut SvnStream<R, W>, session: &mut Session) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    handshake(stream, server, session).await?;

    loop {
        let frame = match stream.read_item().await {
            Ok(frame) => frame,
            Err(ProtocolError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let dispatched = server.dispatcher.dispatch(session, &frame).await?;
        stream.send_bytes(&dispatched.response).await?;
        if dispatched.terminate {
            return Err(ProtocolError::StoreUnavailable {
                command: command_name(&frame).to_string(),
            });
        }
    }
}

fn command_name(frame: &Item) -> &str {
    frame
        .as_list()
        .and_then(|items| items.first())
        .and_then(Item::as_word)
        .unwrap_or("")
}

/// Accept connections forever, one task per client
pub async fn serve(listener: TcpListener, server: Arc<ServerContext>) -> std::io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Typically EMFILE or a connection reset before accept
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let (reader, writer) = socket.into_split();
            // Errors are logged by serve_connection
            let _ = serve_connection(&server, reader, writer, Some(peer)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanisms() {
        let mut server = ServerContext::new(RepositoryRegistry::new(), Arc::new(AuthenticatorChain::new()));
        assert_eq!(server.mechanisms(), vec![Mechanism::Anonymous]);

        server.allow_anonymous = false;
        server.authenticator = Arc::new(AuthenticatorChain::new().with(Arc::new(LocalUserDb::new([LocalUser {
            name: "alice".into(),
            password: "secret".into(),
            groups: vec![],
        }]))));
        assert_eq!(server.mechanisms(), vec![Mechanism::Plain, Mechanism::CramMd5]);
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("authz"), "[/]\n* = r\n").unwrap();
        std::fs::write(
            dir.path().join("gsvn.toml"),
            r#"
            authz_file = "authz"
            store_failure = "surface"

            [[user]]
            name = "alice"
            password = "secret"

            [[repository]]
            name = "repo"

            [[repository]]
            name = "docs"
            branch = "main"
            "#,
        )
        .unwrap();

        let config = Config::load(dir.path().join("gsvn.toml")).unwrap();
        let server = ServerContext::from_config(&config).unwrap();
        assert_eq!(server.repositories.list(), vec!["docs", "repo"]);
        assert!(server.authenticator.supports(Mechanism::CramMd5));
        assert_eq!(server.repositories.get("docs").unwrap().branch.ref_name, "main");
    }

    #[test]
    fn test_from_config_missing_authz() {
        let config = Config {
            authz_file: Some("/nonexistent/authz".into()),
            ..Config::default()
        };
        assert!(ServerContext::from_config(&config).is_err());
    }
}
