//! Relation records and the shapes that produce them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dn::dn_eq;

/// Group property listing direct user members.
pub const USERS_PROPERTY: &str = "users";
/// Group property listing host members.
pub const HOSTS_PROPERTY: &str = "hosts";
/// Group property listing nested groups.
pub const NESTED_GROUP_PROPERTY: &str = "nestedGroup";

/// Compact projection stored per object DN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RelationRecord {
    /// Resolved membership of a group.
    Membership {
        /// Every member DN: users, then hosts, then nested groups.
        unique_member: Vec<String>,
        /// Short identifiers of the direct user members.
        member_uid: Vec<String>,
    },
    /// Selected attributes of a non-group object.
    Attributes { values: BTreeMap<String, Vec<String>> },
}

impl RelationRecord {
    pub fn membership(unique_member: Vec<String>, member_uid: Vec<String>) -> Self {
        RelationRecord::Membership {
            unique_member,
            member_uid,
        }
    }

    /// Member DNs; empty for attribute records.
    pub fn unique_member(&self) -> &[String] {
        match self {
            RelationRecord::Membership { unique_member, .. } => unique_member,
            RelationRecord::Attributes { .. } => &[],
        }
    }

    /// Member identifiers; empty for attribute records.
    pub fn member_uid(&self) -> &[String] {
        match self {
            RelationRecord::Membership { member_uid, .. } => member_uid,
            RelationRecord::Attributes { .. } => &[],
        }
    }

    /// Whether this record lists `member` as a member DN or member uid.
    pub fn references(&self, member: &str) -> bool {
        self.unique_member().iter().any(|dn| dn_eq(dn, member))
            || self
                .member_uid()
                .iter()
                .any(|uid| uid.eq_ignore_ascii_case(member))
    }
}

/// Which record a shard derives from incoming objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordShape {
    /// Group membership projection.
    Membership,
    /// Copy of the listed attributes; `required` ones must be present.
    Attributes {
        attributes: Vec<String>,
        #[serde(default)]
        required: Vec<String>,
    },
}
