//! Command handlers
//!
//! Read-only repository queries live in [`repos`], lock management in
//! [`locks`]. Everything else (commit, update, log, ...) is not registered
//! and is answered with an unknown-command failure.

pub mod locks;
pub mod repos;

use crate::codec::{Item, Params, SvnWriter};
use crate::dispatch::Registry;
use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use gsvn_core::{Lock, NodeInfo, NodeKind, Repository};

/// Registry holding every supported command
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(repos::Reparent)
        .register(repos::GetLatestRev)
        .register(repos::GetDatedRev)
        .register(repos::CheckPath)
        .register(repos::Stat)
        .register(repos::GetDir)
        .register(repos::GetFile)
        .register(locks::GetLock)
        .register(locks::GetLocks)
        .register(locks::LockPath)
        .register(locks::LockMany)
        .register(locks::Unlock)
        .register(locks::UnlockMany);
    registry
}

/// Subversion timestamp: `2024-01-31T12:00:00.000000Z`
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn kind_word(kind: Option<NodeKind>) -> &'static str {
    match kind {
        None => "none",
        Some(NodeKind::File) => "file",
        Some(NodeKind::Dir) => "dir",
    }
}

/// `( path token owner [ comment ] created [ expires ] )`
pub fn write_lockdesc(w: &mut SvnWriter, lock: &Lock) {
    w.open()
        .string(&lock.path)
        .string(&lock.token)
        .string(&lock.owner)
        .opt_string(lock.comment.as_deref())
        .string(format_time(lock.created))
        .opt_string(lock.expires.map(format_time))
        .close();
}

/// Dirent fields shared by `stat` and `get-dir`:
/// `kind size has-props created-rev [ date ] [ author ]`
fn write_dirent_fields(w: &mut SvnWriter, node: &NodeInfo) {
    w.word(kind_word(Some(node.kind)))
        .number(node.size)
        .bool(!node.properties.is_empty())
        .number(node.created_rev)
        .opt_string(Some(format_time(node.created_date)))
        .opt_string(node.last_author.as_deref());
}

/// `( ( name value ) ... )` with the node's own and `svn:entry:` properties
fn write_proplist(w: &mut SvnWriter, node: &NodeInfo, repository: &dyn Repository) {
    w.open();
    for (name, value) in &node.properties {
        w.open().string(name).string(value).close();
    }
    w.open()
        .string("svn:entry:committed-rev")
        .string(node.created_rev.to_string())
        .close();
    w.open()
        .string("svn:entry:committed-date")
        .string(format_time(node.created_date))
        .close();
    if let Some(author) = &node.last_author {
        w.open().string("svn:entry:last-author").string(author).close();
    }
    w.open().string("svn:entry:uuid").string(repository.uuid()).close();
    w.close();
}

/// Split a list of tuples such as `( ( path [ rev ] ) ... )`
fn tuples<'a>(command: &'a str, items: &'a [Item]) -> Result<Vec<Params<'a>>, ProtocolError> {
    items
        .iter()
        .map(|item| {
            item.as_list()
                .map(|tuple| Params::new(command, tuple))
                .ok_or_else(|| ProtocolError::BadArguments {
                    command: command.to_string(),
                    message: format!("expected a tuple, found {}", item.kind()),
                })
        })
        .collect()
}
