//! Authorization for GSvn
//!
//! The permission gate decides, per command and per referenced path,
//! whether the session's user holds the required access level. Rules come
//! from an Apache Subversion-style authz file:
//!
//! ```text
//! [groups]
//! developers = alice, bob
//! admins = charlie, @developers
//!
//! [/]
//! * = r
//! @admins = rw
//!
//! [repo:/trunk/src]
//! @developers = rw
//! bob = r
//!
//! [/private]
//! $authenticated = r
//! * =
//! ```
//!
//! The most specific section with an entry matching the user wins; within
//! a section the matching entries are combined.

use crate::auth::User;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Access level for repository paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessLevel {
    /// No access
    None,
    /// Read-only access
    Read,
    /// Read/write access
    Write,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessLevel::None => "none",
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
        })
    }
}

/// A denied permission check
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{user}: {required} access denied to {path}")]
pub struct AccessDenied {
    pub user: String,
    pub path: String,
    pub required: AccessLevel,
}

/// The permission gate consulted before every command executes
pub trait PermissionGate: Send + Sync {
    /// Check that `user` holds `required` access to the repository path `path`
    fn check(&self, user: &User, path: &str, required: AccessLevel) -> Result<(), AccessDenied>;
}

/// Gate that grants everything; used when no authz file is configured
#[derive(Clone, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn check(&self, _user: &User, _path: &str, _required: AccessLevel) -> Result<(), AccessDenied> {
        Ok(())
    }
}

/// Who an authz entry applies to
#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Everyone,
    Anonymous,
    Authenticated,
    User(String),
    Group(String),
}

#[derive(Debug, Clone)]
struct AccessRule {
    selector: Selector,
    level: AccessLevel,
}

/// Section key: optional repository name plus a normalized path
type SectionKey = (Option<String>, String);

/// Parsed Subversion authz configuration, shared by all repositories
#[derive(Debug, Clone, Default)]
pub struct SvnAuthz {
    sections: HashMap<SectionKey, Vec<AccessRule>>,
    /// Group definitions: group name -> members (`@name` entries are nested groups)
    groups: HashMap<String, Vec<String>>,
}

impl SvnAuthz {
    /// Load an authz file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read authz file: {}", e))?;

        Self::parse(&content)
    }

    /// Parse raw authz content
    pub fn from_content(content: &str) -> Result<Self, String> {
        Self::parse(content)
    }

    fn parse(content: &str) -> Result<Self, String> {
        let mut authz = SvnAuthz::default();
        let mut current_section: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                current_section = Some(line[1..line.len() - 1].trim().to_string());
                continue;
            }

            let Some(section) = &current_section else {
                return Err(format!("Entry outside of a section: {}", line));
            };
            let Some((lhs, rhs)) = line.split_once('=') else {
                return Err(format!("Invalid entry: {}", line));
            };
            let (lhs, rhs) = (lhs.trim(), rhs.trim());

            match section.as_str() {
                "groups" => {
                    if lhs.is_empty() {
                        return Err("Group name cannot be empty".to_string());
                    }
                    let members = rhs
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    authz.groups.insert(lhs.to_string(), members);
                }
                "aliases" => {}
                section => {
                    let key = Self::section_key(section)?;
                    let rule = AccessRule {
                        selector: Self::parse_selector(lhs)?,
                        level: Self::parse_level(rhs)?,
                    };
                    authz.sections.entry(key).or_default().push(rule);
                }
            }
        }

        authz.validate_groups()?;
        Ok(authz)
    }

    fn section_key(section: &str) -> Result<SectionKey, String> {
        let (repo, path) = match section.split_once(':') {
            Some((repo, path)) => (Some(repo.trim().to_string()), path.trim()),
            None => (None, section),
        };
        if !path.starts_with('/') {
            return Err(format!("Invalid section: [{}]", section));
        }
        let path = crate::path::normalize(path).map_err(|e| e.to_string())?;
        Ok((repo, path))
    }

    fn parse_selector(lhs: &str) -> Result<Selector, String> {
        Ok(match lhs {
            "*" => Selector::Everyone,
            "$anonymous" => Selector::Anonymous,
            "$authenticated" => Selector::Authenticated,
            "" => return Err("Empty selector".to_string()),
            other => match other.strip_prefix('@') {
                Some(group) => Selector::Group(group.to_string()),
                None => Selector::User(other.to_string()),
            },
        })
    }

    fn parse_level(rhs: &str) -> Result<AccessLevel, String> {
        match rhs.to_lowercase().as_str() {
            "" => Ok(AccessLevel::None),
            "r" | "read" => Ok(AccessLevel::Read),
            "rw" | "wr" | "w" | "write" | "read-write" => Ok(AccessLevel::Write),
            other => Err(format!("Invalid access level: {}", other)),
        }
    }

    fn validate_groups(&self) -> Result<(), String> {
        let referenced = self
            .groups
            .values()
            .flatten()
            .filter_map(|m| m.strip_prefix('@'))
            .chain(self.sections.values().flatten().filter_map(|r| match &r.selector {
                Selector::Group(g) => Some(g.as_str()),
                _ => None,
            }));
        for group in referenced {
            if !self.groups.contains_key(group) {
                return Err(format!("Group not found: {}", group));
            }
        }
        Ok(())
    }

    fn is_member(&self, user: &User, group: &str, visited: &mut HashSet<String>) -> bool {
        if user.in_group(group) {
            return true;
        }
        if !visited.insert(group.to_string()) {
            return false;
        }
        let Some(members) = self.groups.get(group) else {
            return false;
        };
        members.iter().any(|member| match member.strip_prefix('@') {
            Some(nested) => self.is_member(user, nested, visited),
            None => !user.is_anonymous() && member == user.name(),
        })
    }

    fn matches(&self, user: &User, selector: &Selector) -> bool {
        match selector {
            Selector::Everyone => true,
            Selector::Anonymous => user.is_anonymous(),
            Selector::Authenticated => !user.is_anonymous(),
            Selector::User(name) => !user.is_anonymous() && name == user.name(),
            Selector::Group(group) => self.is_member(user, group, &mut HashSet::new()),
        }
    }

    /// Combined level of the entries matching `user` in one section
    fn section_level(&self, key: &SectionKey, user: &User) -> Option<AccessLevel> {
        self.sections.get(key)?.iter().filter(|r| self.matches(user, &r.selector)).map(|r| r.level).max()
    }

    /// Effective access level of `user` on `path` inside `repository`
    pub fn access_level(&self, repository: &str, user: &User, path: &str) -> AccessLevel {
        let mut current = path.to_string();
        loop {
            let specific = (Some(repository.to_string()), current.clone());
            let generic = (None, current.clone());
            if let Some(level) = self.section_level(&specific, user).or_else(|| self.section_level(&generic, user)) {
                return level;
            }
            if current == "/" {
                return AccessLevel::None;
            }
            current = crate::path::parent(&current).to_string();
        }
    }

    /// Gate bound to one repository
    pub fn gate(self: &Arc<Self>, repository: impl Into<String>) -> RepositoryAuthz {
        RepositoryAuthz {
            authz: Arc::clone(self),
            repository: repository.into(),
        }
    }
}

/// [`PermissionGate`] view of an [`SvnAuthz`] for a single repository
#[derive(Clone)]
pub struct RepositoryAuthz {
    authz: Arc<SvnAuthz>,
    repository: String,
}

impl PermissionGate for RepositoryAuthz {
    fn check(&self, user: &User, path: &str, required: AccessLevel) -> Result<(), AccessDenied> {
        let granted = self.authz.access_level(&self.repository, user, path);
        if granted >= required && granted != AccessLevel::None {
            Ok(())
        } else {
            Err(AccessDenied {
                user: user.name().to_string(),
                path: path.to_string(),
                required,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(content: &str) -> RepositoryAuthz {
        Arc::new(SvnAuthz::from_content(content).unwrap()).gate("repo")
    }

    fn alice() -> User {
        User::named("alice", Vec::<String>::new())
    }

    #[test]
    fn test_parse_groups() {
        let content = r#"
            [groups]
            developers = alice, bob
            admins = charlie, @developers
        "#;

        let authz = SvnAuthz::from_content(content).unwrap();
        assert_eq!(authz.groups.get("developers").unwrap().len(), 2);
        assert!(authz.is_member(&alice(), "admins", &mut HashSet::new()));
    }

    #[test]
    fn test_unknown_group_rejected() {
        assert!(SvnAuthz::from_content("[/]\n@ghosts = rw\n").is_err());
        assert!(SvnAuthz::from_content("[/]\nalice = rx\n").is_err());
    }

    #[test]
    fn test_access_check_anonymous_and_admin() {
        let gate = gate(
            r#"
            [groups]
            admins = charlie

            [/]
            * = r
            @admins = rw

            [/private]
            @admins = rw
            * =
        "#,
        );

        let anon = User::anonymous();
        let charlie = User::named("charlie", Vec::<String>::new());
        assert!(gate.check(&anon, "/", AccessLevel::Read).is_ok());
        assert!(gate.check(&anon, "/", AccessLevel::Write).is_err());
        assert!(gate.check(&charlie, "/private/x", AccessLevel::Write).is_ok());
        let denied = gate.check(&anon, "/private/x", AccessLevel::Read).unwrap_err();
        assert_eq!(denied.path, "/private/x");
        assert_eq!(denied.required, AccessLevel::Read);
    }

    #[test]
    fn test_most_specific_section_wins() {
        let gate = gate(
            r#"
            [/]
            * = r
            bob = rw

            [/private]
            bob = r
        "#,
        );

        let bob = User::named("bob", Vec::<String>::new());
        assert!(gate.check(&bob, "/trunk", AccessLevel::Write).is_ok());
        assert!(gate.check(&alice(), "/trunk", AccessLevel::Write).is_err());
        assert!(gate.check(&bob, "/private/a", AccessLevel::Write).is_err());
        assert!(gate.check(&bob, "/private/a", AccessLevel::Read).is_ok());
    }

    #[test]
    fn test_repository_sections_and_user_groups() {
        let gate = gate(
            r#"
            [groups]
            developers = dave

            [/]
            * = r

            [other:/trunk]
            alice = rw

            [repo:/trunk]
            @developers = rw
            $anonymous =
        "#,
        );

        // alice is in developers through her own memberships
        let alice = User::named("alice", ["developers"]);
        assert!(gate.check(&alice, "/trunk/file.txt", AccessLevel::Write).is_ok());
        assert!(gate.check(&User::named("eve", Vec::<String>::new()), "/trunk/a", AccessLevel::Write).is_err());
        assert!(gate.check(&User::anonymous(), "/trunk/a", AccessLevel::Read).is_err());
    }
}
