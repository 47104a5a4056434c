//! Lock commands
//!
//! All mutations go through the repository's [`LockCoordinator`]; these
//! handlers only validate the target against HEAD and translate results.
//!
//! [`LockCoordinator`]: gsvn_core::LockCoordinator

use super::{tuples, write_lockdesc};
use crate::codec::Params;
use crate::context::RepositoryContext;
use crate::dispatch::{Command, Reply};
use crate::error::{ErrorCode, ProtocolError, SvnServerError};
use crate::session::Session;
use async_trait::async_trait;
use chrono::Utc;
use gsvn_core::{AccessLevel, Depth, Lock, LockRequest, NodeKind, Revision};
use std::sync::Arc;

fn check(session: &Session, relative: &str, required: AccessLevel) -> Result<(), SvnServerError> {
    session.check(&session.resolve(relative)?, required)
}

/// Lock one file, which must exist at HEAD and not be newer than `current_rev`
async fn acquire(
    repo: &RepositoryContext,
    path: &str,
    owner: &str,
    comment: Option<String>,
    steal: bool,
    current_rev: Option<Revision>,
) -> Result<Lock, SvnServerError> {
    let head = repo.repository.latest_revision(&repo.branch).await?;
    let node = repo
        .repository
        .resolve_path(&repo.branch, path, head)
        .await?
        .ok_or_else(|| SvnServerError::new(ErrorCode::NotFound, format!("Path '{}' doesn't exist in HEAD revision", path)))?;
    if node.kind != NodeKind::File {
        return Err(SvnServerError::new(ErrorCode::NotFile, format!("Lock request failed: '{}' is not a file", path)));
    }
    if let Some(rev) = current_rev {
        if rev > head {
            return Err(SvnServerError::new(ErrorCode::NoSuchRevision, format!("No such revision {}", rev)));
        }
        if rev < node.created_rev {
            return Err(SvnServerError::new(
                ErrorCode::OutOfDate,
                format!("Lock failed: newer version of '{}' exists", path),
            ));
        }
    }

    let lock = repo
        .locks
        .create_lock(LockRequest {
            path: path.to_string(),
            owner: owner.to_string(),
            comment,
            // A lifetime past the representable range never expires
            expires: repo.lock_ttl.and_then(|ttl| Utc::now().checked_add_signed(ttl)),
            force: steal,
        })
        .await?;
    tracing::info!("{} locked {} in '{}'", owner, lock.path, repo.name);
    Ok(lock)
}

async fn release(repo: &RepositoryContext, path: &str, token: Option<&str>, user: &str, force: bool) -> Result<(), SvnServerError> {
    let lock = repo.locks.remove_lock(path, token, user, force).await?;
    tracing::info!("{} unlocked {} in '{}' (owner {})", user, lock.path, repo.name, lock.owner);
    Ok(())
}

/// `get-lock ( path )`
pub struct GetLock;

#[async_trait]
impl Command for GetLock {
    const NAME: &'static str = "get-lock";
    type Args = String;

    fn decode(params: &mut Params<'_>) -> Result<String, ProtocolError> {
        params.string()
    }

    fn permission_check(&self, session: &Session, path: &String) -> Result<(), SvnServerError> {
        check(session, path, AccessLevel::Read)
    }

    async fn execute(&self, session: &mut Session, path: String, reply: &mut Reply) -> Result<(), SvnServerError> {
        let lock = session.repository()?.locks.get_lock(&session.resolve(&path)?).await?;
        let body = reply.body();
        body.open();
        if let Some(lock) = &lock {
            write_lockdesc(body, lock);
        }
        body.close();
        Ok(())
    }
}

pub struct GetLocksArgs {
    pub path: String,
    pub depth: Depth,
}

/// `get-locks ( path ? [ depth ] )`
///
/// Depth defaults to infinity. Locks on paths the user cannot read are
/// left out.
pub struct GetLocks;

#[async_trait]
impl Command for GetLocks {
    const NAME: &'static str = "get-locks";
    type Args = GetLocksArgs;

    fn decode(params: &mut Params<'_>) -> Result<GetLocksArgs, ProtocolError> {
        let path = params.string()?;
        let depth = match params.opt_word()? {
            None => Depth::Infinity,
            Some(word) => Depth::parse(word).ok_or_else(|| ProtocolError::BadArguments {
                command: Self::NAME.to_string(),
                message: format!("unknown depth '{}'", word),
            })?,
        };
        Ok(GetLocksArgs { path, depth })
    }

    fn permission_check(&self, session: &Session, args: &GetLocksArgs) -> Result<(), SvnServerError> {
        check(session, &args.path, AccessLevel::Read)
    }

    async fn execute(&self, session: &mut Session, args: GetLocksArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let locks = session
            .repository()?
            .locks
            .list_locks(&session.resolve(&args.path)?, args.depth)
            .await?;
        let body = reply.body();
        body.open();
        for lock in locks.filter(|lock| session.check(&lock.path, AccessLevel::Read).is_ok()) {
            write_lockdesc(body, &lock);
        }
        body.close();
        Ok(())
    }
}

pub struct LockArgs {
    pub path: String,
    pub comment: Option<String>,
    pub steal: bool,
    pub current_rev: Option<Revision>,
}

/// `lock ( path [ comment ] steal-lock [ current-rev ] )`
pub struct LockPath;

#[async_trait]
impl Command for LockPath {
    const NAME: &'static str = "lock";
    const MUTATING: bool = true;
    type Args = LockArgs;

    fn decode(params: &mut Params<'_>) -> Result<LockArgs, ProtocolError> {
        Ok(LockArgs {
            path: params.string()?,
            comment: params.opt_string()?,
            steal: params.bool()?,
            current_rev: params.opt_number()?,
        })
    }

    fn permission_check(&self, session: &Session, args: &LockArgs) -> Result<(), SvnServerError> {
        check(session, &args.path, AccessLevel::Write)
    }

    async fn execute(&self, session: &mut Session, args: LockArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let owner = session.require_user()?.name().to_string();
        let repo = Arc::clone(session.repository()?);
        let path = session.resolve(&args.path)?;
        let lock = acquire(&repo, &path, &owner, args.comment, args.steal, args.current_rev).await?;
        write_lockdesc(reply.body(), &lock);
        Ok(())
    }
}

pub struct LockManyArgs {
    pub comment: Option<String>,
    pub steal: bool,
    pub targets: Vec<(String, Option<Revision>)>,
}

/// `lock-many ( [ comment ] steal-lock ( ( path [ current-rev ] ) ... ) )`
///
/// Each target gets its own success or failure item ahead of the final
/// envelope, followed by `done`. Only a store outage fails the command as
/// a whole.
pub struct LockMany;

#[async_trait]
impl Command for LockMany {
    const NAME: &'static str = "lock-many";
    const MUTATING: bool = true;
    type Args = LockManyArgs;

    fn decode(params: &mut Params<'_>) -> Result<LockManyArgs, ProtocolError> {
        let comment = params.opt_string()?;
        let steal = params.bool()?;
        let targets: Vec<(String, Option<Revision>)> = tuples(Self::NAME, params.list()?)?
            .into_iter()
            .map(|mut target| Ok((target.string()?, target.opt_number()?)))
            .collect::<Result<_, ProtocolError>>()?;
        Ok(LockManyArgs { comment, steal, targets })
    }

    fn permission_check(&self, session: &Session, args: &LockManyArgs) -> Result<(), SvnServerError> {
        args.targets
            .iter()
            .try_for_each(|(path, _)| check(session, path, AccessLevel::Write))
    }

    async fn execute(&self, session: &mut Session, args: LockManyArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let owner = session.require_user()?.name().to_string();
        let repo = Arc::clone(session.repository()?);
        let pre = reply.pre();
        for (path, current_rev) in &args.targets {
            let result = match session.resolve(path) {
                Ok(path) => acquire(&repo, &path, &owner, args.comment.clone(), args.steal, *current_rev).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(lock) => {
                    pre.open().word("success").open();
                    write_lockdesc(pre, &lock);
                    pre.close().close();
                }
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    tracing::debug!("lock-many: {} failed: {}", path, e);
                    pre.failure(&e);
                }
            }
        }
        pre.word("done");
        Ok(())
    }
}

pub struct UnlockArgs {
    pub path: String,
    pub token: Option<String>,
    pub break_lock: bool,
}

/// `unlock ( path [ token ] break-lock )`
pub struct Unlock;

#[async_trait]
impl Command for Unlock {
    const NAME: &'static str = "unlock";
    const MUTATING: bool = true;
    type Args = UnlockArgs;

    fn decode(params: &mut Params<'_>) -> Result<UnlockArgs, ProtocolError> {
        Ok(UnlockArgs {
            path: params.string()?,
            token: params.opt_string()?,
            break_lock: params.bool()?,
        })
    }

    fn permission_check(&self, session: &Session, args: &UnlockArgs) -> Result<(), SvnServerError> {
        check(session, &args.path, AccessLevel::Write)
    }

    async fn execute(&self, session: &mut Session, args: UnlockArgs, _reply: &mut Reply) -> Result<(), SvnServerError> {
        let user = session.require_user()?.name().to_string();
        let repo = Arc::clone(session.repository()?);
        let path = session.resolve(&args.path)?;
        release(&repo, &path, args.token.as_deref(), &user, args.break_lock).await
    }
}

pub struct UnlockManyArgs {
    pub break_lock: bool,
    pub targets: Vec<(String, Option<String>)>,
}

/// `unlock-many ( break-lock ( ( path [ token ] ) ... ) )`
pub struct UnlockMany;

#[async_trait]
impl Command for UnlockMany {
    const NAME: &'static str = "unlock-many";
    const MUTATING: bool = true;
    type Args = UnlockManyArgs;

    fn decode(params: &mut Params<'_>) -> Result<UnlockManyArgs, ProtocolError> {
        let break_lock = params.bool()?;
        let targets: Vec<(String, Option<String>)> = tuples(Self::NAME, params.list()?)?
            .into_iter()
            .map(|mut target| Ok((target.string()?, target.opt_string()?)))
            .collect::<Result<_, ProtocolError>>()?;
        Ok(UnlockManyArgs { break_lock, targets })
    }

    fn permission_check(&self, session: &Session, args: &UnlockManyArgs) -> Result<(), SvnServerError> {
        args.targets
            .iter()
            .try_for_each(|(path, _)| check(session, path, AccessLevel::Write))
    }

    async fn execute(&self, session: &mut Session, args: UnlockManyArgs, reply: &mut Reply) -> Result<(), SvnServerError> {
        let user = session.require_user()?.name().to_string();
        let repo = Arc::clone(session.repository()?);
        let pre = reply.pre();
        for (path, token) in &args.targets {
            let result = match session.resolve(path) {
                Ok(full) => release(&repo, &full, token.as_deref(), &user, args.break_lock).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    pre.open().word("success").open().string(path).close().close();
                }
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    tracing::debug!("unlock-many: {} failed: {}", path, e);
                    pre.failure(&e);
                }
            }
        }
        pre.word("done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Item;
    use crate::commands::default_registry;
    use crate::commands::testing::{call, failure_code, frame, opt, repository, session, success};
    use crate::dispatch::{Dispatcher, StoreFailurePolicy};
    use gsvn_core::{AccessDenied, Edit, ExpiredLockPolicy, MemoryRepository, PermissionGate, User};

    fn alice() -> User {
        User::named("alice", Vec::<String>::new())
    }

    async fn setup(user: User) -> (Dispatcher, Session, Arc<MemoryRepository>) {
        let repo = repository().await;
        let context = RepositoryContext::new("repo", "master", repo.clone());
        let d = Dispatcher::new(default_registry(), StoreFailurePolicy::default());
        (d, session(context, user), repo)
    }

    fn lock_frame(path: &str, steal: bool, rev: Option<u64>) -> Item {
        frame(
            "lock",
            vec![
                Item::string(path),
                opt(Some(Item::string("editing"))),
                Item::word(if steal { "true" } else { "false" }),
                opt(rev.map(Item::Number)),
            ],
        )
    }

    fn lockdesc(item: &Item) -> &[Item] {
        item.as_list().unwrap()
    }

    #[tokio::test]
    async fn test_lock_and_get_lock() {
        let (d, mut s, _) = setup(alice()).await;
        let items = call(&d, &mut s, lock_frame("trunk/a.txt", false, Some(1))).await;
        let desc = lockdesc(&success(&items[1])[0]);
        assert_eq!(desc[0], Item::string("/trunk/a.txt"));
        assert!(desc[1].as_bytes().unwrap().starts_with(b"opaquelocktoken:"));
        assert_eq!(desc[2], Item::string("alice"));
        assert_eq!(desc[3], Item::List(vec![Item::string("editing")]));
        assert_eq!(desc[5], Item::List(vec![]));

        let items = call(&d, &mut s, frame("get-lock", vec![Item::string("trunk/a.txt")])).await;
        let found = success(&items[1])[0].as_list().unwrap();
        assert_eq!(lockdesc(&found[0])[0], Item::string("/trunk/a.txt"));

        let items = call(&d, &mut s, frame("get-lock", vec![Item::string("trunk/sub/b.txt")])).await;
        assert_eq!(success(&items[1]), &[Item::List(vec![])]);
    }

    #[tokio::test]
    async fn test_lock_validation() {
        let (d, mut s, repo) = setup(alice()).await;
        let cases = [
            (lock_frame("trunk/missing.txt", false, None), 160013),
            (lock_frame("trunk/sub", false, None), 160017),
            (lock_frame("trunk/a.txt", false, Some(5)), 160006),
        ];
        for (frame, code) in cases {
            let items = call(&d, &mut s, frame).await;
            assert_eq!(failure_code(&items[1]), code);
        }

        repo.commit(
            "master",
            "bob",
            vec![Edit::PutFile {
                path: "/trunk/a.txt".into(),
                content: bytes::Bytes::from_static(b"changed\n"),
            }],
        )
        .await
        .unwrap();
        let items = call(&d, &mut s, lock_frame("trunk/a.txt", false, Some(1))).await;
        assert_eq!(failure_code(&items[1]), 160042);
        let items = call(&d, &mut s, lock_frame("trunk/a.txt", false, Some(2))).await;
        success(&items[1]);
    }

    #[tokio::test]
    async fn test_anonymous_cannot_lock() {
        let (d, mut s, _) = setup(User::anonymous()).await;
        let items = call(&d, &mut s, lock_frame("trunk/a.txt", false, None)).await;
        assert_eq!(failure_code(&items[1]), 160034);
    }

    #[tokio::test]
    async fn test_lock_expiry_from_ttl() {
        let repo = repository().await;
        let context = RepositoryContext::new("repo", "master", repo)
            .with_lock_policy(ExpiredLockPolicy::TreatAsAbsent, Some(chrono::Duration::hours(1)));
        let d = Dispatcher::new(default_registry(), StoreFailurePolicy::default());
        let mut s = session(context, alice());
        let items = call(&d, &mut s, lock_frame("trunk/a.txt", false, None)).await;
        let desc = lockdesc(&success(&items[1])[0]);
        assert_eq!(desc[5].as_list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_ttl_beyond_calendar_never_expires() {
        let repo = repository().await;
        let ttl = chrono::Duration::try_seconds(10_000_000_000_000).unwrap();
        let context = RepositoryContext::new("repo", "master", repo)
            .with_lock_policy(ExpiredLockPolicy::TreatAsAbsent, Some(ttl));
        let d = Dispatcher::new(default_registry(), StoreFailurePolicy::default());
        let mut s = session(context, alice());
        let items = call(&d, &mut s, lock_frame("trunk/a.txt", false, None)).await;
        assert_eq!(items.len(), 2);
        let desc = lockdesc(&success(&items[1])[0]);
        assert!(desc[5].as_list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_locks_depth() {
        let (d, mut s, _) = setup(alice()).await;
        call(&d, &mut s, lock_frame("trunk/a.txt", false, None)).await;
        call(&d, &mut s, lock_frame("trunk/sub/b.txt", false, None)).await;

        let paths = |items: &[Item]| -> Vec<Item> {
            success(&items[1])[0]
                .as_list()
                .unwrap()
                .iter()
                .map(|desc| lockdesc(desc)[0].clone())
                .collect()
        };

        let items = call(&d, &mut s, frame("get-locks", vec![Item::string("trunk")])).await;
        assert_eq!(paths(&items), vec![Item::string("/trunk/a.txt"), Item::string("/trunk/sub/b.txt")]);

        let items = call(&d, &mut s, frame("get-locks", vec![Item::string("trunk"), opt(Some(Item::word("files")))])).await;
        assert_eq!(paths(&items), vec![Item::string("/trunk/a.txt")]);

        let items = call(&d, &mut s, frame("get-locks", vec![Item::string("trunk"), opt(Some(Item::word("empty")))])).await;
        assert!(paths(&items).is_empty());
    }

    #[tokio::test]
    async fn test_get_locks_hides_unreadable_paths() {
        struct HideSub;
        impl PermissionGate for HideSub {
            fn check(&self, user: &User, path: &str, required: AccessLevel) -> Result<(), AccessDenied> {
                if path.starts_with("/trunk/sub") {
                    return Err(AccessDenied {
                        user: user.name().to_string(),
                        path: path.to_string(),
                        required,
                    });
                }
                Ok(())
            }
        }

        let repo = repository().await;
        let context = RepositoryContext::new("repo", "master", repo).with_gate(Arc::new(HideSub));
        context
            .locks
            .create_lock(LockRequest {
                path: "/trunk/sub/b.txt".into(),
                owner: "bob".into(),
                comment: None,
                expires: None,
                force: false,
            })
            .await
            .unwrap();
        let d = Dispatcher::new(default_registry(), StoreFailurePolicy::default());
        let mut s = session(context, alice());
        let items = call(&d, &mut s, frame("get-locks", vec![Item::string("trunk")])).await;
        assert_eq!(success(&items[1]), &[Item::List(vec![])]);
    }

    #[tokio::test]
    async fn test_lock_many_and_unlock_many() {
        let (d, mut s, _) = setup(alice()).await;
        let targets = |paths: &[&str]| {
            Item::List(
                paths
                    .iter()
                    .map(|p| Item::List(vec![Item::string(*p), opt(None)]))
                    .collect(),
            )
        };
        let items = call(
            &d,
            &mut s,
            frame("lock-many", vec![opt(None), Item::word("false"), targets(&["trunk/a.txt", "trunk/nope", "trunk/sub/b.txt"])]),
        )
        .await;
        // prelude, three results, done, final envelope
        assert_eq!(items.len(), 6);
        let first = lockdesc(&success(&items[1])[0]);
        assert_eq!(first[0], Item::string("/trunk/a.txt"));
        assert_eq!(failure_code(&items[2]), 160013);
        success(&items[3]);
        assert_eq!(items[4], Item::word("done"));
        assert!(success(&items[5]).is_empty());

        let items = call(
            &d,
            &mut s,
            frame("unlock-many", vec![Item::word("false"), targets(&["trunk/a.txt", "trunk/a.txt"])]),
        )
        .await;
        assert_eq!(success(&items[1]), &[Item::string("trunk/a.txt")]);
        assert_eq!(failure_code(&items[2]), 160040);
        assert_eq!(items[3], Item::word("done"));
    }

    #[tokio::test]
    async fn test_unlock_rules() {
        let (d, mut alice_session, _) = setup(alice()).await;
        let items = call(&d, &mut alice_session, lock_frame("trunk/a.txt", false, None)).await;
        let token = lockdesc(&success(&items[1])[0])[1].clone();

        // bob connects to the same repository context
        let shared = Arc::clone(alice_session.repository().unwrap());
        let mut bob = Session::new(None);
        bob.authenticate(User::named("bob", Vec::<String>::new())).unwrap();
        bob.select_repository(shared, &crate::session::SvnUrl::parse("svn://localhost/repo").unwrap())
            .unwrap();
        bob.activate().unwrap();

        let unlock = |token: Option<Item>, force: bool| {
            frame(
                "unlock",
                vec![Item::string("trunk/a.txt"), opt(token), Item::word(if force { "true" } else { "false" })],
            )
        };

        let items = call(&d, &mut bob, unlock(Some(Item::string("opaquelocktoken:wrong")), false)).await;
        assert_eq!(failure_code(&items[1]), 160039);
        let items = call(&d, &mut bob, unlock(Some(token), false)).await;
        success(&items[1]);
        let items = call(&d, &mut bob, unlock(None, false)).await;
        assert_eq!(failure_code(&items[1]), 160040);

        call(&d, &mut alice_session, lock_frame("trunk/a.txt", false, None)).await;
        let items = call(&d, &mut bob, unlock(None, true)).await;
        success(&items[1]);
    }
}
