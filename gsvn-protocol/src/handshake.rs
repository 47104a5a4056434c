//! Connection setup
//!
//! Greeting, capability negotiation, authentication and repository
//! selection. On success the session is `Active` and the command loop can
//! start.

use crate::codec::{Item, Params, SvnStream, SvnWriter};
use crate::error::{ErrorCode, ProtocolError, SvnServerError};
use crate::server::ServerContext;
use crate::session::{Session, SvnUrl};
use gsvn_core::{AuthResult, Credentials, Mechanism, User};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Only protocol version spoken
pub const PROTOCOL_VERSION: u64 = 2;

/// Capabilities announced in the greeting
pub const SERVER_CAPABILITIES: &[&str] = &[
    "edit-pipeline",
    "svndiff1",
    "absent-entries",
    "depth",
    "inherited-props",
    "log-revprops",
];

/// Failed authentication attempts tolerated before hanging up
const MAX_AUTH_ATTEMPTS: usize = 3;

/// Client response to the greeting
#[derive(Debug)]
struct ClientGreeting {
    version: u64,
    capabilities: Vec<String>,
    url: String,
    client: Option<String>,
}

impl ClientGreeting {
    fn decode(item: &Item) -> Result<Self, ProtocolError> {
        let items = item
            .as_list()
            .ok_or_else(|| ProtocolError::malformed("client greeting is not a list"))?;
        let mut params = Params::new("greeting", items);
        let version = params.number()?;
        let capabilities = params
            .list()?
            .iter()
            .map(|cap| {
                cap.as_word()
                    .map(str::to_string)
                    .ok_or_else(|| ProtocolError::malformed("capability is not a word"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let url = params.string()?;
        let ra_client = params.opt_string()?;
        let client = params.opt_string()?;
        Ok(Self {
            version,
            capabilities,
            url,
            client: client.or(ra_client),
        })
    }
}

async fn refuse<R, W>(stream: &mut SvnStream<R, W>, error: SvnServerError) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    warn!("Handshake refused: {}", error);
    let mut out = SvnWriter::new();
    out.failure(&error);
    stream.send(out).await?;
    Err(ProtocolError::Handshake(error.message))
}

/// Run connection setup up to the first command
pub async fn handshake<R, W>(stream: &mut SvnStream<R, W>, server: &ServerContext, session: &mut Session) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut greeting = SvnWriter::new();
    greeting.number(PROTOCOL_VERSION).number(PROTOCOL_VERSION).open().close().open();
    for capability in SERVER_CAPABILITIES {
        greeting.word(capability);
    }
    greeting.close();
    let mut out = SvnWriter::new();
    out.success(greeting)?;
    stream.send(out).await?;

    let reply = ClientGreeting::decode(&stream.read_item().await?)?;
    if reply.version != PROTOCOL_VERSION {
        return refuse(
            stream,
            SvnServerError::new(ErrorCode::CommandError, format!("Unsupported protocol version {}", reply.version)),
        )
        .await;
    }
    session.negotiate(reply.version, reply.capabilities, reply.client);
    if !session.has_capability("edit-pipeline") {
        return refuse(stream, SvnServerError::new(ErrorCode::CommandError, "Client must support edit-pipeline")).await;
    }

    let user = authenticate(stream, server).await?;
    info!("Session {} authenticated as {}", session, user.name());
    session
        .authenticate(user)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let url = match SvnUrl::parse(&reply.url) {
        Ok(url) => url,
        Err(e) => return refuse(stream, e).await,
    };
    let Some(repository) = server.repositories.get(&url.repository) else {
        let error = SvnServerError::new(
            ErrorCode::RepositoryNotFound,
            format!("No repository found in '{}'", reply.url),
        );
        return refuse(stream, error).await;
    };
    session
        .select_repository(repository, &url)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let repo = session.repository().map_err(|e| ProtocolError::Handshake(e.message))?;
    let mut info = SvnWriter::new();
    info.string(repo.repository.uuid()).string(session.root_url()).open().close();
    let mut out = SvnWriter::new();
    out.success(info)?;
    stream.send(out).await?;

    session.activate().map_err(|e| ProtocolError::Handshake(e.to_string()))?;
    info!("Session {} opened {} at {}", session, url.repository, session.root());
    Ok(())
}

/// Offer mechanisms and run exchanges until one succeeds
async fn authenticate<R, W>(stream: &mut SvnStream<R, W>, server: &ServerContext) -> Result<User, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mechanisms = server.mechanisms();
    let mut offer = SvnWriter::new();
    offer.open();
    for mechanism in &mechanisms {
        offer.word(mechanism.as_word());
    }
    offer.close().string(&server.realm);
    let mut out = SvnWriter::new();
    out.success(offer)?;
    stream.send(out).await?;

    for _ in 0..MAX_AUTH_ATTEMPTS {
        let item = stream.read_item().await?;
        let items = item
            .as_list()
            .ok_or_else(|| ProtocolError::malformed("auth response is not a list"))?;
        let mut params = Params::new("auth-response", items);
        let word = params.word()?;
        let token = params.opt_string()?;

        let outcome = match Mechanism::parse(word).filter(|m| mechanisms.contains(m)) {
            None => AuthResult::Failed(format!("Unsupported authentication mechanism '{}'", word)),
            Some(Mechanism::Anonymous) => AuthResult::Success(User::anonymous()),
            Some(Mechanism::Plain) => match token.and_then(|t| Credentials::from_plain_token(t.as_bytes())) {
                Some(credentials) => server.authenticator.authenticate(&credentials).await,
                None => AuthResult::Failed("Malformed PLAIN token".into()),
            },
            Some(Mechanism::CramMd5) => {
                let challenge = format!(
                    "<{}.{}@{}>",
                    uuid::Uuid::new_v4().simple(),
                    chrono::Utc::now().timestamp(),
                    server.realm
                );
                let mut step = SvnWriter::new();
                step.open().word("step").open().string(&challenge).close().close();
                stream.send(step).await?;

                let response = stream.read_item().await?;
                let bytes = response
                    .as_bytes()
                    .ok_or_else(|| ProtocolError::malformed("CRAM-MD5 response is not a string"))?;
                match Credentials::from_cram_md5_response(&challenge, bytes) {
                    Some(credentials) => server.authenticator.authenticate(&credentials).await,
                    None => AuthResult::Failed("Malformed CRAM-MD5 response".into()),
                }
            }
        };

        match outcome {
            AuthResult::Success(user) => {
                let mut out = SvnWriter::new();
                out.success(SvnWriter::new())?;
                stream.send(out).await?;
                return Ok(user);
            }
            AuthResult::Failed(message) | AuthResult::Error(message) => {
                warn!("Authentication with {} failed: {}", word, message);
                let mut out = SvnWriter::new();
                out.open().word("failure").open().string(&message).close().close();
                stream.send(out).await?;
            }
        }
    }
    Err(ProtocolError::Handshake("Too many failed authentication attempts".into()))
}
