//! Command registry and dispatcher
//!
//! Every command runs through the same pipeline: decode typed arguments,
//! consult the permission gate, execute, then encode exactly one response
//! envelope. Handlers write into a [`Reply`] that stays in memory until the
//! handler has returned, so a failing handler never leaves partial output
//! on the wire.

use crate::codec::{Item, Params, SvnWriter};
use crate::error::{ErrorCode, ProtocolError, SvnServerError};
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// What a store outage during a command does to the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFailurePolicy {
    /// Report the failure and keep serving
    Surface,
    /// Report the failure and close the connection
    Terminate,
    /// Close only after mutating commands
    #[default]
    ByCommand,
}

impl StoreFailurePolicy {
    fn terminates(&self, mutating: bool) -> bool {
        match self {
            Self::Surface => false,
            Self::Terminate => true,
            Self::ByCommand => mutating,
        }
    }
}

impl fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Surface => "surface",
            Self::Terminate => "terminate",
            Self::ByCommand => "by-command",
        })
    }
}

/// Output of a command handler
///
/// `body` holds the items inside `( success ( ... ) )`. `pre` is sent
/// ahead of the envelope and `post` after it, for commands whose response
/// spans several items.
#[derive(Debug, Default)]
pub struct Reply {
    pre: SvnWriter,
    body: SvnWriter,
    post: SvnWriter,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre(&mut self) -> &mut SvnWriter {
        &mut self.pre
    }

    pub fn body(&mut self) -> &mut SvnWriter {
        &mut self.body
    }

    pub fn post(&mut self) -> &mut SvnWriter {
        &mut self.post
    }
}

/// A protocol command
///
/// Implementations are stateless; per-connection state lives in the
/// [`Session`] passed to each call.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    /// Wire name
    const NAME: &'static str;
    /// Whether the command changes shared state
    const MUTATING: bool = false;

    type Args: Send + Sync;

    /// Decode the parameter list; any mismatch is fatal
    fn decode(params: &mut Params<'_>) -> Result<Self::Args, ProtocolError>;

    /// Check every path the command touches
    fn permission_check(&self, session: &Session, args: &Self::Args) -> Result<(), SvnServerError>;

    async fn execute(&self, session: &mut Session, args: Self::Args, reply: &mut Reply) -> Result<(), SvnServerError>;
}

/// Type-erased [`Command`]
#[async_trait]
trait DynCommand: Send + Sync {
    fn is_mutating(&self) -> bool;

    /// `Err` for fatal decode failures, `Ok(Err(..))` for reportable ones
    async fn run(&self, session: &mut Session, params: &[Item]) -> Result<Result<Reply, SvnServerError>, ProtocolError>;
}

#[async_trait]
impl<C: Command> DynCommand for C {
    fn is_mutating(&self) -> bool {
        C::MUTATING
    }

    async fn run(&self, session: &mut Session, params: &[Item]) -> Result<Result<Reply, SvnServerError>, ProtocolError> {
        let args = C::decode(&mut Params::new(C::NAME, params))?;
        if let Err(denied) = self.permission_check(session, &args) {
            return Ok(Err(denied));
        }
        let mut reply = Reply::new();
        Ok(self.execute(session, args, &mut reply).await.map(|()| reply))
    }
}

/// Command table, built once at startup
#[derive(Default)]
pub struct Registry {
    commands: HashMap<&'static str, Box<dyn DynCommand>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command, replacing any command of the same name
    pub fn register<C: Command>(&mut self, command: C) -> &mut Self {
        self.commands.insert(C::NAME, Box::new(command));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.commands.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Bytes to send for one command, and whether to hang up afterwards
#[derive(Debug)]
pub struct Dispatched {
    pub response: Bytes,
    pub terminate: bool,
}

/// Runs command frames against a [`Registry`]
pub struct Dispatcher {
    registry: Registry,
    store_failure: StoreFailurePolicy,
}

impl Dispatcher {
    pub fn new(registry: Registry, store_failure: StoreFailurePolicy) -> Self {
        Self { registry, store_failure }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle one `( command-name ( args ... ) )` frame.
    ///
    /// Returns the complete response. `Err` means the connection must be
    /// closed without a response.
    pub async fn dispatch(&self, session: &mut Session, frame: &Item) -> Result<Dispatched, ProtocolError> {
        let (name, params) = match frame.as_list() {
            Some([Item::Word(name), Item::List(params), ..]) => (name.as_str(), params.as_slice()),
            _ => return Err(ProtocolError::malformed(format!("expected a command frame, got {}", frame.kind()))),
        };

        let Some(command) = self.registry.commands.get(name) else {
            tracing::warn!("Session {}: unknown command '{}'", session, name);
            let mut out = SvnWriter::new();
            out.failure(&SvnServerError::new(
                ErrorCode::UnknownCommand,
                format!("Unknown command '{}'", name),
            ));
            return Ok(Dispatched {
                response: out.finish()?,
                terminate: false,
            });
        };

        tracing::debug!("Session {}: {} as {}", session, name, session.user().name());
        let result = command.run(session, params).await?;

        // Empty auth request: no further authentication needed
        let mut out = SvnWriter::new();
        out.open().word("success").open().open().close().string("").close().close();

        let terminate = match result {
            Ok(reply) => {
                out.append(reply.pre)?;
                out.success(reply.body)?;
                out.append(reply.post)?;
                false
            }
            Err(error) => {
                let terminate = error.is_store_failure() && self.store_failure.terminates(command.is_mutating());
                if error.is_store_failure() {
                    tracing::error!("Session {}: {} failed: {}", session, name, error);
                } else {
                    tracing::warn!("Session {}: {} failed: {}", session, name, error);
                }
                out.failure(&error);
                terminate
            }
        };

        Ok(Dispatched {
            response: out.finish()?,
            terminate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RepositoryContext;
    use crate::session::SvnUrl;
    use gsvn_core::{AccessDenied, AccessLevel, MemoryRepository, PermissionGate, User};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DenyWrites;

    impl PermissionGate for DenyWrites {
        fn check(&self, user: &User, path: &str, required: AccessLevel) -> Result<(), AccessDenied> {
            if required == AccessLevel::Write {
                return Err(AccessDenied {
                    user: user.name().to_string(),
                    path: path.to_string(),
                    required,
                });
            }
            Ok(())
        }
    }

    /// Writes to its path and counts how often it actually ran
    struct Touch {
        runs: Arc<AtomicUsize>,
        outcome: Option<SvnServerError>,
    }

    #[async_trait]
    impl Command for Touch {
        const NAME: &'static str = "touch";
        const MUTATING: bool = true;
        type Args = String;

        fn decode(params: &mut Params<'_>) -> Result<String, ProtocolError> {
            params.string()
        }

        fn permission_check(&self, session: &Session, path: &String) -> Result<(), SvnServerError> {
            session.check(&session.resolve(path)?, AccessLevel::Write)
        }

        async fn execute(&self, _session: &mut Session, path: String, reply: &mut Reply) -> Result<(), SvnServerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            reply.pre().string("partial");
            if let Some(error) = &self.outcome {
                return Err(error.clone());
            }
            reply.body().string(path);
            Ok(())
        }
    }

    fn session(gate: Arc<dyn PermissionGate>) -> Session {
        let context = RepositoryContext::new("repo", "master", Arc::new(MemoryRepository::new(["master"]))).with_gate(gate);
        let mut session = Session::new(None);
        session.authenticate(User::named("alice", Vec::<String>::new())).unwrap();
        session
            .select_repository(Arc::new(context), &SvnUrl::parse("svn://h/repo").unwrap())
            .unwrap();
        session.activate().unwrap();
        session
    }

    fn dispatcher(runs: &Arc<AtomicUsize>, outcome: Option<SvnServerError>, policy: StoreFailurePolicy) -> Dispatcher {
        let mut registry = Registry::new();
        registry.register(Touch {
            runs: Arc::clone(runs),
            outcome,
        });
        Dispatcher::new(registry, policy)
    }

    fn frame(name: &str, params: Vec<Item>) -> Item {
        Item::List(vec![Item::word(name), Item::List(params)])
    }

    const PRELUDE: &str = "( success ( ( ) 0: ) ) ";

    #[tokio::test]
    async fn test_unknown_command() {
        let runs = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(&runs, None, StoreFailurePolicy::default());
        let mut s = session(Arc::new(gsvn_core::AllowAll));
        let out = d.dispatch(&mut s, &frame("commit", vec![])).await.unwrap();
        let text = String::from_utf8(out.response.to_vec()).unwrap();
        assert!(text.starts_with("( failure ( ( 210001 "), "{}", text);
        assert!(!out.terminate);
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let runs = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(&runs, None, StoreFailurePolicy::default());
        let mut s = session(Arc::new(gsvn_core::AllowAll));
        let out = d.dispatch(&mut s, &frame("touch", vec![Item::string("a")])).await.unwrap();
        assert_eq!(
            String::from_utf8(out.response.to_vec()).unwrap(),
            format!("{}7:partial ( success ( 1:a ) ) ", PRELUDE)
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denial_never_executes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(&runs, None, StoreFailurePolicy::default());
        let mut s = session(Arc::new(DenyWrites));
        let out = d.dispatch(&mut s, &frame("touch", vec![Item::string("trunk/a")])).await.unwrap();
        let text = String::from_utf8(out.response.to_vec()).unwrap();
        assert!(text.starts_with(&format!("{}( failure ( ( 170001 ", PRELUDE)), "{}", text);
        assert!(text.contains("/trunk/a"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_discards_partial_output() {
        let runs = Arc::new(AtomicUsize::new(0));
        let error = SvnServerError::new(ErrorCode::NotFound, "gone");
        let d = dispatcher(&runs, Some(error), StoreFailurePolicy::default());
        let mut s = session(Arc::new(gsvn_core::AllowAll));
        let out = d.dispatch(&mut s, &frame("touch", vec![Item::string("a")])).await.unwrap();
        let text = String::from_utf8(out.response.to_vec()).unwrap();
        assert_eq!(text, format!("{}( failure ( ( 160013 4:gone 0: 0 ) ) ) ", PRELUDE));
        assert!(!out.terminate);
    }

    #[tokio::test]
    async fn test_store_failure_policy() {
        let store = SvnServerError::wrap(
            ErrorCode::Io,
            "Repository operation failed",
            SvnServerError::new(ErrorCode::CommandError, "down"),
        );
        for (policy, terminate) in [
            (StoreFailurePolicy::ByCommand, true),
            (StoreFailurePolicy::Terminate, true),
            (StoreFailurePolicy::Surface, false),
        ] {
            let runs = Arc::new(AtomicUsize::new(0));
            let d = dispatcher(&runs, Some(store.clone()), policy);
            let mut s = session(Arc::new(gsvn_core::AllowAll));
            let out = d.dispatch(&mut s, &frame("touch", vec![Item::string("a")])).await.unwrap();
            assert_eq!(out.terminate, terminate, "{}", policy);
        }
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_fatal() {
        let runs = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(&runs, None, StoreFailurePolicy::default());
        let mut s = session(Arc::new(gsvn_core::AllowAll));
        let err = d.dispatch(&mut s, &frame("touch", vec![Item::Number(3)])).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadArguments { .. }));
        assert!(d.dispatch(&mut s, &Item::word("touch")).await.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
