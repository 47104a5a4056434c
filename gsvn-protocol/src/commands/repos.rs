//! Read-only repository commands

use super::{kind_word, write_dirent_fields, write_proplist};
use crate::codec::Params;
use crate::dispatch::{Command, Reply};
use crate::error::{ErrorCode, ProtocolError, SvnServerError};
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gsvn_core::{AccessLevel, NodeInfo, NodeKind, Pointer, Revision};

/// Content is sent as a series of strings of at most this size
const CHUNK_SIZE: usize = 16 * 1024;

/// Requested revision, or HEAD
async fn revision(session: &Session, requested: Option<Revision>) -> Result<Revision, SvnServerError> {
    let repo = session.repository()?;
    let head = repo.repository.latest_revision(&repo.branch).await?;
    match requested {
        Some(rev) if rev > head => Err(SvnServerError::new(
            ErrorCode::NoSuchRevision,
            format!("No such revision {}", rev),
        )),
        Some(rev) => Ok(rev),
        None => Ok(head),
    }
}

async fn lookup(session: &Session, path: &str, rev: Revision) -> Result<Option<NodeInfo>, SvnServerError> {
    let repo = session.repository()?;
    Ok(repo.repository.resolve_path(&repo.branch, path, rev).await?)
}

fn check_read(session: &Session, relative: &str) -> Result<(), SvnServerError> {
    session.check(&session.resolve(relative)?, AccessLevel::Read)
}

/// `reparent ( url )`
pub struct Reparent;

#[async_trait]
impl Command for Reparent {
    const NAME: &'static str = "reparent";
    type Args = String;

    fn decode(params: &mut Params<'_>) -> Result<String, ProtocolError> {
        params.string()
    }

    fn permission_check(&self, session: &Session, url: &String) -> Result<(), SvnServerError> {
        session.check(&session.root_for_url(url)?, AccessLevel::Read)
    }

    async fn execute(&self, session: &mut Session, url: String, _reply: &mut Reply) -> Result<(), SvnServerError> {
        session.reparent(&url)?;
        tracing::debug!("Session {} reparented to {}", session, session.root());
        Ok(())
    }
}

/// `get-latest-rev ( )`
pub struct GetLatestRev;

#[async_trait]
impl Command for GetLatestRev {
    const NAME: &'static str = "get-latest-rev";
    type Args = ();

    fn decode(_params: &mut Params<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn permission_check(&self, session: &Session, _args: &()) -> Result<(), SvnServerError> {
        session.check(session.root(), AccessLevel::Read)
    }

    async fn execute(&self, session: &mut Session, _args: (), reply: &mut Reply) -> Result<(), SvnServerError> {
        let rev = revision(session, None).await?;
        reply.body().number(rev);
        Ok(())
    }
}

/// `get-dated-rev ( date )`
pub struct GetDatedRev;

#[async_trait]
impl Command for GetDatedRev {
    const NAME: &'static str = "get-dated-rev";
    type Args = String;

    fn decode(params: &mut Params<'_>) -> Result<String, ProtocolError> {
        params.string()
    }

    fn permission_check(&self, session: &Session, _date: &String) -> Result<(), SvnServerError> {
        session.check(session.root(), AccessLevel::Read)
    }

    async fn execute(&self, session: &mut Session, date: String, reply: &mut Reply) -> Result<(), SvnServerError> {
        let date = DateTime::parse_from_rfc3339(&date)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SvnServerError::new(ErrorCode::BadDate, format!("Bad date '{}': {}", date, e)))?;
        let repo = session.repository()?;
        let rev = repo.repository.dated_revision(&repo.branch, date).await?;
        reply.body().number(rev);
        Ok(())
    }
}

/// `( path [ rev ] )`
pub struct PathArgs {
    pub path: String,
    pub rev: Option<Revision>,
}

impl PathArgs {
    fn decode(params: &mut Params<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            path: params.string()?,
            rev: params.opt_number()?,
        })
    }
}

/// `check-path ( path [ rev ] )`
pub struct CheckPath;

#[async_trait]
impl Command for CheckPath {
    const NAME: &'static str = "check-path";
    type Args = PathArgs;

    fn decode(params: &mut Params<'_>) -> Result<PathArgs, ProtocolError> {
        PathArgs::decode(params)
    }

    fn permission_check(&self, session: &Session, args: &PathArgs) -> Result<(), SvnServerError> {
        check_read(session, &args.path)
    }

    async fn execute(&self, session: &mut Session, args: PathArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let rev = revision(session, args.rev).await?;
        let node = lookup(session, &session.resolve(&args.path)?, rev).await?;
        reply.body().word(kind_word(node.map(|n| n.kind)));
        Ok(())
    }
}

/// `stat ( path [ rev ] )`
pub struct Stat;

#[async_trait]
impl Command for Stat {
    const NAME: &'static str = "stat";
    type Args = PathArgs;

    fn decode(params: &mut Params<'_>) -> Result<PathArgs, ProtocolError> {
        PathArgs::decode(params)
    }

    fn permission_check(&self, session: &Session, args: &PathArgs) -> Result<(), SvnServerError> {
        check_read(session, &args.path)
    }

    async fn execute(&self, session: &mut Session, args: PathArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let rev = revision(session, args.rev).await?;
        let node = lookup(session, &session.resolve(&args.path)?, rev).await?;
        let body = reply.body();
        body.open();
        if let Some(node) = node {
            body.open();
            write_dirent_fields(body, &node);
            body.close();
        }
        body.close();
        Ok(())
    }
}

pub struct GetDirArgs {
    pub path: String,
    pub rev: Option<Revision>,
    pub want_props: bool,
    pub want_contents: bool,
    pub want_iprops: bool,
}

/// `get-dir ( path [ rev ] want-props want-contents ? ( field ... ) [ want-iprops ] )`
///
/// The dirent field list is accepted but every entry carries all fields.
pub struct GetDir;

#[async_trait]
impl Command for GetDir {
    const NAME: &'static str = "get-dir";
    type Args = GetDirArgs;

    fn decode(params: &mut Params<'_>) -> Result<GetDirArgs, ProtocolError> {
        let path = params.string()?;
        let rev = params.opt_number()?;
        let want_props = params.bool()?;
        let want_contents = params.bool()?;
        params.opt_list()?;
        Ok(GetDirArgs {
            path,
            rev,
            want_props,
            want_contents,
            want_iprops: params.opt_bool()?.unwrap_or(false),
        })
    }

    fn permission_check(&self, session: &Session, args: &GetDirArgs) -> Result<(), SvnServerError> {
        check_read(session, &args.path)
    }

    async fn execute(&self, session: &mut Session, args: GetDirArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let rev = revision(session, args.rev).await?;
        let full = session.resolve(&args.path)?;
        let repo = session.repository()?;
        let node = lookup(session, &full, rev).await?.ok_or_else(|| {
            SvnServerError::new(ErrorCode::NotFound, format!("Path '{}' not found in revision {}", full, rev))
        })?;
        if node.kind != NodeKind::Dir {
            return Err(SvnServerError::new(ErrorCode::NotDirectory, format!("Path '{}' is not a directory", full)));
        }
        let entries = if args.want_contents {
            repo.repository.list_dir(&repo.branch, &full, rev).await?
        } else {
            Vec::new()
        };

        let body = reply.body();
        body.number(rev);
        if args.want_props {
            write_proplist(body, &node, repo.repository.as_ref());
        } else {
            body.open().close();
        }
        body.open();
        for entry in entries {
            // Unreadable children are left out of the listing
            if session.check(&entry.node.path, AccessLevel::Read).is_err() {
                continue;
            }
            body.open().string(&entry.name);
            write_dirent_fields(body, &entry.node);
            body.close();
        }
        body.close();
        if args.want_iprops {
            body.open().close();
        }
        Ok(())
    }
}

pub struct GetFileArgs {
    pub path: String,
    pub rev: Option<Revision>,
    pub want_props: bool,
    pub want_contents: bool,
    pub want_iprops: bool,
}

/// `get-file ( path [ rev ] want-props want-contents ? [ want-iprops ] )`
///
/// Large-file pointers are replaced by the payload fetched through the
/// repository's object proxy, when it has one.
pub struct GetFile;

#[async_trait]
impl Command for GetFile {
    const NAME: &'static str = "get-file";
    type Args = GetFileArgs;

    fn decode(params: &mut Params<'_>) -> Result<GetFileArgs, ProtocolError> {
        Ok(GetFileArgs {
            path: params.string()?,
            rev: params.opt_number()?,
            want_props: params.bool()?,
            want_contents: params.bool()?,
            want_iprops: params.opt_bool()?.unwrap_or(false),
        })
    }

    fn permission_check(&self, session: &Session, args: &GetFileArgs) -> Result<(), SvnServerError> {
        check_read(session, &args.path)
    }

    async fn execute(&self, session: &mut Session, args: GetFileArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let rev = revision(session, args.rev).await?;
        let full = session.resolve(&args.path)?;
        let repo = session.repository()?;
        let node = lookup(session, &full, rev).await?.ok_or_else(|| {
            SvnServerError::new(ErrorCode::NotFound, format!("Path '{}' not found in revision {}", full, rev))
        })?;
        if node.kind != NodeKind::File {
            return Err(SvnServerError::new(ErrorCode::NotFile, format!("Path '{}' is not a file", full)));
        }

        let mut content = repo.repository.read_file(&repo.branch, &full, rev).await?;
        if let Some(objects) = &repo.objects {
            if let Some(pointer) = Pointer::parse(&content) {
                tracing::debug!("Fetching large object {} for {}", pointer.oid, full);
                content = objects.fetch(&pointer).await?;
            }
        }
        let checksum = format!("{:x}", md5::compute(&content));

        let body = reply.body();
        body.opt_string(Some(checksum)).number(rev);
        if args.want_props {
            write_proplist(body, &node, repo.repository.as_ref());
        } else {
            body.open().close();
        }
        if args.want_iprops {
            body.open().close();
        }

        if args.want_contents {
            let post = reply.post();
            for chunk in content.chunks(CHUNK_SIZE) {
                post.string(chunk);
            }
            post.string("").open().word("success").open().close().close();
        }
        Ok(())
    }
}
