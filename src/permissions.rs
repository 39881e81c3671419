use std::collections::BTreeSet;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};

/// Can read groups and traverse the hierarchy.
pub const HIERARCHY_ROLE_READ: &str = "hierarchy_read";
/// Can create ordinary groups, attach, detach and delete.
pub const HIERARCHY_ROLE_WRITE: &str = "hierarchy_write";
/// Can do everything, including creating the root group.
pub const HIERARCHY_ROLE_ADMIN: &str = "hierarchy_admin";

pub const ALL_HIERARCHY_ROLES: &[&str] = &[
    HIERARCHY_ROLE_READ,
    HIERARCHY_ROLE_WRITE,
    HIERARCHY_ROLE_ADMIN,
];

/// An authenticated caller, as handed over by the identity layer. Credentials are verified
/// before a principal is built; this crate only looks at the granted roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    subject: String,
    roles: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, R>(subject: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            subject: subject.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyAction {
    Read,
    CreateGroup,
    CreateRoot,
    AttachChild,
    DetachChild,
    DeleteGroup,
}

/// Roles that each grant `action`.
pub const fn access_roles(action: HierarchyAction) -> &'static [&'static str] {
    match action {
        HierarchyAction::Read => ALL_HIERARCHY_ROLES,
        HierarchyAction::CreateRoot => &[HIERARCHY_ROLE_ADMIN],
        HierarchyAction::CreateGroup
        | HierarchyAction::AttachChild
        | HierarchyAction::DetachChild
        | HierarchyAction::DeleteGroup => &[HIERARCHY_ROLE_WRITE, HIERARCHY_ROLE_ADMIN],
    }
}

pub fn authorize(principal: &Principal, action: HierarchyAction) -> Result<()> {
    if access_roles(action)
        .iter()
        .any(|role| principal.has_role(role))
    {
        Ok(())
    } else {
        Err(LibError::unauthorized(
            "You are not allowed to perform this hierarchy operation",
            anyhow!("{} lacks a role for {:?}", principal.subject(), action),
        ))
    }
}

pub fn is_hierarchy_role(role_name: &str) -> bool {
    ALL_HIERARCHY_ROLES.iter().any(|known| *known == role_name)
}
