//! GSvn Protocol Engine
//!
//! Speaks the `svn://` wire protocol on top of the `gsvn-core` collaborators:
//! item codec, connection setup, command dispatch and the lock and
//! repository query commands.

pub mod codec;
pub mod commands;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod server;
pub mod session;

pub use codec::{Item, Params, SvnReader, SvnStream, SvnWriter};
pub use config::Config;
pub use context::{RepositoryContext, RepositoryRegistry};
pub use dispatch::{Command, Dispatched, Dispatcher, Registry, Reply, StoreFailurePolicy};
pub use error::{ErrorCode, ProtocolError, SvnServerError};
pub use server::{ServerContext, serve, serve_connection};
pub use session::{Session, SessionState, SvnUrl};
