//! Projection of directory objects into relation records.
//!
//! Pure apart from the member-id lookup, which is a pluggable
//! [`MemberIdResolver`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use ldapcache_core::{
    leading_rdn, normalize_dn, DirectoryObject, MappingError, RecordShape, RelationRecord,
    HOSTS_PROPERTY, NESTED_GROUP_PROPERTY, USERS_PROPERTY,
};

/// Translates a member DN whose leading RDN is not `uid` into a short id.
pub trait MemberIdResolver: Send + Sync {
    fn resolve(&self, member_dn: &str) -> Option<String>;
}

/// Resolver that knows no members beyond `uid=` RDNs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemberLookup;

impl MemberIdResolver for NoMemberLookup {
    fn resolve(&self, _member_dn: &str) -> Option<String> {
        None
    }
}

/// Fixed DN to id table, compared on normalised DNs.
#[derive(Debug, Clone, Default)]
pub struct StaticMemberIds {
    ids: BTreeMap<String, String>,
}

impl StaticMemberIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, member_dn: &str, id: impl Into<String>) -> Self {
        self.ids.insert(normalize_dn(member_dn), id.into());
        self
    }
}

impl MemberIdResolver for StaticMemberIds {
    fn resolve(&self, member_dn: &str) -> Option<String> {
        self.ids.get(&normalize_dn(member_dn)).cloned()
    }
}

/// Before/after records of one change.
pub type ProjectedPair = (Option<RelationRecord>, Option<RelationRecord>);

/// Converts objects into the record a shard shape asks for.
#[derive(Clone)]
pub struct Projector {
    resolver: Arc<dyn MemberIdResolver>,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(Arc::new(NoMemberLookup))
    }
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector").finish_non_exhaustive()
    }
}

impl Projector {
    pub fn new(resolver: Arc<dyn MemberIdResolver>) -> Self {
        Self { resolver }
    }

    /// Project both sides of a change. An absent side stays absent.
    pub fn project(
        &self,
        shape: &RecordShape,
        old: Option<&DirectoryObject>,
        new: Option<&DirectoryObject>,
    ) -> Result<ProjectedPair, MappingError> {
        let old = old.map(|o| self.project_object(shape, o)).transpose()?;
        let new = new.map(|o| self.project_object(shape, o)).transpose()?;
        Ok((old, new))
    }

    pub fn project_object(
        &self,
        shape: &RecordShape,
        object: &DirectoryObject,
    ) -> Result<RelationRecord, MappingError> {
        leading_rdn(&object.dn)?;
        match shape {
            RecordShape::Membership => self.project_membership(object),
            RecordShape::Attributes {
                attributes,
                required,
            } => project_attributes(object, attributes, required),
        }
    }

    /// Membership of a group.
    ///
    /// `unique_member` is users, then hosts, then nested groups, with later
    /// duplicates (compared as DNs) dropped. `member_uid` holds the id of
    /// every distinct user member: the `uid` RDN value when there is one,
    /// otherwise whatever the resolver returns.
    pub fn project_membership(
        &self,
        object: &DirectoryObject,
    ) -> Result<RelationRecord, MappingError> {
        let mut seen = HashSet::new();
        let mut unique_member = Vec::new();
        let mut member_uid = Vec::new();
        let mut seen_uids = HashSet::new();

        for property in [USERS_PROPERTY, HOSTS_PROPERTY, NESTED_GROUP_PROPERTY] {
            for member in object.values(property) {
                let member = member.trim();
                if member.is_empty() {
                    continue;
                }
                let rdn = leading_rdn(member).map_err(|e| MappingError::MalformedDn {
                    dn: object.dn.clone(),
                    reason: format!("member {:?}: {}", member, e),
                })?;
                if !seen.insert(normalize_dn(member)) {
                    continue;
                }
                unique_member.push(member.to_string());

                if property != USERS_PROPERTY {
                    continue;
                }
                let uid = if rdn.is("uid") {
                    Some(rdn.value)
                } else {
                    self.resolver.resolve(member)
                };
                if let Some(uid) = uid {
                    if seen_uids.insert(uid.to_lowercase()) {
                        member_uid.push(uid);
                    }
                }
            }
        }

        Ok(RelationRecord::membership(unique_member, member_uid))
    }
}

/// Copy the listed attributes; fail if a required one has no value.
pub fn project_attributes(
    object: &DirectoryObject,
    attributes: &[String],
    required: &[String],
) -> Result<RelationRecord, MappingError> {
    if let Some(missing) = required.iter().find(|name| !object.has(name)) {
        return Err(MappingError::MissingProperty {
            dn: object.dn.clone(),
            property: missing.clone(),
        });
    }

    let values = attributes
        .iter()
        .chain(required.iter())
        .filter(|name| object.has(name))
        .map(|name| (name.clone(), object.values(name).to_vec()))
        .collect();
    Ok(RelationRecord::Attributes { values })
}

/// Membership projection of a change with the default resolver.
pub fn project(
    old: Option<&DirectoryObject>,
    new: Option<&DirectoryObject>,
) -> Result<ProjectedPair, MappingError> {
    Projector::default().project(&RecordShape::Membership, old, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn g1() -> DirectoryObject {
        DirectoryObject::new("cn=g1,cn=groups,dc=example")
            .object_type_of("groups/group")
            .property(
                USERS_PROPERTY,
                ["uid=u1,cn=users,dc=example", "uid=u2,cn=users,dc=example"],
            )
            .property(NESTED_GROUP_PROPERTY, ["cn=g2,cn=groups,dc=example"])
    }

    #[test]
    fn test_project_g1() {
        let record = Projector::default().project_membership(&g1()).expect("projects");
        assert_eq!(
            record.unique_member(),
            [
                "uid=u1,cn=users,dc=example",
                "uid=u2,cn=users,dc=example",
                "cn=g2,cn=groups,dc=example",
            ]
        );
        assert_eq!(record.member_uid(), ["u1", "u2"]);
    }

    #[test]
    fn test_project_orders_users_hosts_nested() {
        let group = DirectoryObject::new("cn=g,dc=example")
            .property(NESTED_GROUP_PROPERTY, ["cn=n,dc=example"])
            .property(HOSTS_PROPERTY, ["cn=h,dc=example"])
            .property(USERS_PROPERTY, ["uid=u,dc=example"]);
        let record = Projector::default().project_membership(&group).expect("projects");
        assert_eq!(
            record.unique_member(),
            ["uid=u,dc=example", "cn=h,dc=example", "cn=n,dc=example"]
        );
        assert_eq!(record.member_uid(), ["u"]);
    }

    #[test]
    fn test_project_drops_duplicate_members() {
        let group = DirectoryObject::new("cn=g,dc=example")
            .property(USERS_PROPERTY, ["uid=u1,dc=example", "UID=U1, DC=example"])
            .property(NESTED_GROUP_PROPERTY, ["uid=u1,dc=example"]);
        let record = Projector::default().project_membership(&group).expect("projects");
        assert_eq!(record.unique_member(), ["uid=u1,dc=example"]);
        assert_eq!(record.member_uid(), ["u1"]);
    }

    #[test]
    fn test_project_empty_group() {
        let record = Projector::default()
            .project_membership(&DirectoryObject::new("cn=empty,dc=example"))
            .expect("projects");
        assert!(record.unique_member().is_empty());
        assert!(record.member_uid().is_empty());
    }

    #[test]
    fn test_non_uid_members_use_resolver() {
        let group = DirectoryObject::new("cn=g,dc=example").property(
            USERS_PROPERTY,
            ["cn=Jane Doe,cn=users,dc=example", "uid=u1,dc=example"],
        );

        let record = Projector::default().project_membership(&group).expect("projects");
        assert_eq!(record.member_uid(), ["u1"]);

        let resolver = StaticMemberIds::new().with("CN=jane doe,cn=users,dc=example", "jdoe");
        let record = Projector::new(Arc::new(resolver))
            .project_membership(&group)
            .expect("projects");
        assert_eq!(record.member_uid(), ["jdoe", "u1"]);
        assert_eq!(record.unique_member().len(), 2);
    }

    #[test]
    fn test_project_rejects_malformed_dns() {
        let err = Projector::default()
            .project_object(&RecordShape::Membership, &DirectoryObject::new(""))
            .expect_err("empty dn");
        assert!(matches!(err, MappingError::MalformedDn { .. }));

        let group = DirectoryObject::new("cn=g,dc=example").property(USERS_PROPERTY, ["garbage"]);
        let err = Projector::default()
            .project_membership(&group)
            .expect_err("malformed member");
        assert_eq!(err.dn(), "cn=g,dc=example");
    }

    #[test]
    fn test_project_null_sides() {
        assert_eq!(project(None, None).expect("projects"), (None, None));
        let (old, new) = project(None, Some(&g1())).expect("projects");
        assert!(old.is_none());
        assert!(new.is_some());
    }

    #[test]
    fn test_project_attributes() {
        let user = DirectoryObject::new("uid=u1,cn=users,dc=example")
            .property("uid", ["u1"])
            .property("uidNumber", ["2001"])
            .property("userPassword", ["secret"]);

        let record = project_attributes(
            &user,
            &["uid".to_string(), "uidNumber".to_string(), "mail".to_string()],
            &["uid".to_string()],
        )
        .expect("projects");
        let RelationRecord::Attributes { values } = record else {
            panic!("expected attribute record");
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values["uidNumber"], ["2001"]);
        assert!(!values.contains_key("userPassword"));

        let err = project_attributes(&user, &[], &["mailPrimaryAddress".to_string()])
            .expect_err("required attribute missing");
        assert!(matches!(err, MappingError::MissingProperty { .. }));
    }

    fn member_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9]{0,6}".prop_map(|v| format!("uid={},cn=users,dc=example", v)),
            "[a-z][a-z0-9]{0,6}".prop_map(|v| format!("cn={},cn=groups,dc=example", v)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Property: members are unique and every uid comes from a user member.
        #[test]
        fn prop_membership_is_deduplicated(
            users in prop::collection::vec(member_strategy(), 0..8),
            nested in prop::collection::vec(member_strategy(), 0..8),
        ) {
            let group = DirectoryObject::new("cn=g,dc=example")
                .property(USERS_PROPERTY, users.clone())
                .property(NESTED_GROUP_PROPERTY, nested.clone());
            let record = Projector::default().project_membership(&group).expect("projects");

            let normalized: HashSet<String> =
                record.unique_member().iter().map(|m| normalize_dn(m)).collect();
            prop_assert_eq!(normalized.len(), record.unique_member().len());

            let expected: HashSet<String> =
                users.iter().chain(nested.iter()).map(|m| normalize_dn(m)).collect();
            prop_assert_eq!(normalized, expected);

            for uid in record.member_uid() {
                let prefix = format!("uid={},", uid);
                prop_assert!(users.iter().any(|u| u.starts_with(&prefix)));
            }
        }
    }
}
