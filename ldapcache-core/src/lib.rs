//! ldapcache Core - Directory Object and Relation Types
//!
//! Pure data structures shared by every other crate in the workspace.
//! Storage, routing and event handling live elsewhere; this crate contains
//! the upstream object snapshots, the change events that carry them, the
//! relation records the cache stores, and the error/config vocabulary.

pub mod config;
pub mod dn;
pub mod error;
pub mod filter;
pub mod record;

pub use config::{
    ConsumerConfig, RetryConfig, StorageConfig, DEFAULT_CLEANUP_BATCH_SIZE,
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_SIZE_MB, DEFAULT_MAX_SUB_DATABASES,
    DEFAULT_STORAGE_PATH,
};
pub use dn::{dn_eq, leading_rdn, normalize_dn, Rdn};
pub use error::{
    CacheError, CacheResult, ConfigError, MappingError, RegistryError, StorageError,
    TransportError,
};
pub use filter::Predicate;
pub use record::{RecordShape, RelationRecord, HOSTS_PROPERTY, NESTED_GROUP_PROPERTY, USERS_PROPERTY};

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// DIRECTORY OBJECTS
// ============================================================================

/// Attribute holding the object-type discriminator (e.g. `groups/group`).
pub const OBJECT_TYPE_ATTRIBUTE: &str = "univentionObjectType";

/// Attribute name to values mapping of a directory object.
pub type Properties = BTreeMap<String, Vec<String>>;

/// Snapshot of an upstream directory entity.
///
/// Objects are produced by the change feed and never mutated by the cache.
/// Every property is multi-valued; single values arriving on the wire are
/// normalised to one-element lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    /// Stable hierarchical name of the object.
    pub dn: String,
    /// Attribute values keyed by attribute name.
    #[serde(default, deserialize_with = "deserialize_properties")]
    pub properties: Properties,
}

impl DirectoryObject {
    /// Create an object without any properties.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            properties: Properties::new(),
        }
    }

    /// Create an object from an existing property map.
    pub fn with_properties(dn: impl Into<String>, properties: Properties) -> Self {
        Self {
            dn: dn.into(),
            properties,
        }
    }

    /// Builder-style setter for a multi-valued property.
    pub fn property<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Builder-style setter for the object-type discriminator.
    pub fn object_type_of(self, object_type: impl Into<String>) -> Self {
        let object_type = object_type.into();
        self.property(OBJECT_TYPE_ATTRIBUTE, [object_type])
    }

    /// All values of a property.
    ///
    /// Attribute names are compared case-insensitively, as in LDAP; an exact
    /// match is preferred. Missing properties yield an empty slice.
    pub fn values(&self, name: &str) -> &[String] {
        if let Some(values) = self.properties.get(name) {
            return values;
        }
        self.properties
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// First value of a property, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    /// Whether the property is present with at least one value.
    pub fn has(&self, name: &str) -> bool {
        !self.values(name).is_empty()
    }

    /// The object-type discriminator, read from [`OBJECT_TYPE_ATTRIBUTE`].
    pub fn object_type(&self) -> Option<&str> {
        self.first(OBJECT_TYPE_ATTRIBUTE)
    }
}

/// Wire representation of a single property value.
#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyValue {
    One(String),
    Many(Vec<String>),
    Number(serde_json::Number),
    Flag(bool),
}

impl PropertyValue {
    fn into_values(self) -> Vec<String> {
        match self {
            PropertyValue::One(value) => vec![value],
            PropertyValue::Many(values) => values,
            PropertyValue::Number(n) => vec![n.to_string()],
            PropertyValue::Flag(b) => vec![b.to_string()],
        }
    }
}

/// Deserialize a property map where values may be a string, a list, a
/// number, a bool or null.
pub fn deserialize_properties<'de, D>(deserializer: D) -> Result<Properties, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Option<PropertyValue>> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| (name, value.map(PropertyValue::into_values).unwrap_or_default()))
        .collect())
}

// ============================================================================
// CHANGE EVENTS
// ============================================================================

/// Kind of change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// A change notification for one directory object.
///
/// Exactly one of `old`/`new` is absent for create and delete, both are
/// present for modify. An event with neither side is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ChangeMessage", into = "ChangeMessage")]
pub struct ChangeEvent {
    /// Object-type discriminator supplied by the feed.
    pub object_type: Option<String>,
    /// DN of the changed object.
    pub dn: String,
    /// State before the change.
    pub old: Option<DirectoryObject>,
    /// State after the change.
    pub new: Option<DirectoryObject>,
}

impl ChangeEvent {
    /// A create event for `object`.
    pub fn create(object: DirectoryObject) -> Self {
        Self {
            object_type: object.object_type().map(str::to_string),
            dn: object.dn.clone(),
            old: None,
            new: Some(object),
        }
    }

    /// A modify event from `old` to `new`.
    pub fn modify(old: DirectoryObject, new: DirectoryObject) -> Self {
        Self {
            object_type: new.object_type().map(str::to_string),
            dn: new.dn.clone(),
            old: Some(old),
            new: Some(new),
        }
    }

    /// A delete event for `object`.
    pub fn delete(object: DirectoryObject) -> Self {
        Self {
            object_type: object.object_type().map(str::to_string),
            dn: object.dn.clone(),
            old: Some(object),
            new: None,
        }
    }

    /// The change kind, or `None` if neither side is present.
    pub fn kind(&self) -> Option<ChangeKind> {
        match (&self.old, &self.new) {
            (None, Some(_)) => Some(ChangeKind::Create),
            (Some(_), Some(_)) => Some(ChangeKind::Modify),
            (Some(_), None) => Some(ChangeKind::Delete),
            (None, None) => None,
        }
    }

    /// Object type from the feed discriminator or either object snapshot.
    pub fn object_type(&self) -> Option<&str> {
        self.object_type
            .as_deref()
            .or_else(|| self.new.as_ref().and_then(DirectoryObject::object_type))
            .or_else(|| self.old.as_ref().and_then(DirectoryObject::object_type))
    }
}

/// JSON shape of a change notification on the feed.
///
/// `old` and `new` are bare property maps; the DN is carried once at the top
/// level.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_type: Option<String>,
    dn: String,
    #[serde(default, deserialize_with = "deserialize_optional_properties")]
    old: Option<Properties>,
    #[serde(default, deserialize_with = "deserialize_optional_properties")]
    new: Option<Properties>,
}

fn deserialize_optional_properties<'de, D>(deserializer: D) -> Result<Option<Properties>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_properties")] Properties);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

impl From<ChangeMessage> for ChangeEvent {
    fn from(message: ChangeMessage) -> Self {
        let object_type = message.object_type;
        let build = |mut properties: Properties| {
            // Predicates read the discriminator from the object itself.
            if let Some(object_type) = &object_type {
                properties
                    .entry(OBJECT_TYPE_ATTRIBUTE.to_string())
                    .or_insert_with(|| vec![object_type.clone()]);
            }
            DirectoryObject::with_properties(message.dn.clone(), properties)
        };
        let old = message.old.map(build);
        let new = message.new.map(build);
        ChangeEvent {
            object_type,
            dn: message.dn,
            old,
            new,
        }
    }
}

impl From<ChangeEvent> for ChangeMessage {
    fn from(event: ChangeEvent) -> Self {
        ChangeMessage {
            object_type: event.object_type,
            dn: event.dn,
            old: event.old.map(|o| o.properties),
            new: event.new.map(|o| o.properties),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_lookup_is_case_insensitive() {
        let obj = DirectoryObject::new("cn=g1,dc=example")
            .property("nestedGroup", ["cn=g2,dc=example"]);
        assert_eq!(obj.values("nestedgroup"), ["cn=g2,dc=example".to_string()]);
        assert!(obj.values("users").is_empty());
        assert!(!obj.has("users"));
    }

    #[test]
    fn test_change_kind() {
        let obj = DirectoryObject::new("cn=g1");
        assert_eq!(ChangeEvent::create(obj.clone()).kind(), Some(ChangeKind::Create));
        assert_eq!(
            ChangeEvent::modify(obj.clone(), obj.clone()).kind(),
            Some(ChangeKind::Modify)
        );
        assert_eq!(ChangeEvent::delete(obj).kind(), Some(ChangeKind::Delete));
    }

    #[test]
    fn test_change_event_from_wire_json() {
        let json = r#"{
            "object_type": "groups/group",
            "dn": "cn=g1,cn=groups,dc=example",
            "old": null,
            "new": {"users": ["uid=u1,cn=users,dc=example"], "gidNumber": 5001, "description": "staff"}
        }"#;
        let event: ChangeEvent = serde_json::from_str(json).expect("valid change json");
        assert_eq!(event.kind(), Some(ChangeKind::Create));
        let new = event.new.as_ref().expect("new side present");
        assert_eq!(new.dn, "cn=g1,cn=groups,dc=example");
        assert_eq!(new.object_type(), Some("groups/group"));
        assert_eq!(new.first("gidNumber"), Some("5001"));
        assert_eq!(new.values("description"), ["staff".to_string()]);
    }

    #[test]
    fn test_change_event_without_sides_has_no_kind() {
        let json = r#"{"dn": "cn=g1"}"#;
        let event: ChangeEvent = serde_json::from_str(json).expect("valid change json");
        assert_eq!(event.kind(), None);
    }

    #[test]
    fn test_change_event_object_type_falls_back_to_objects() {
        let obj = DirectoryObject::new("uid=u1").object_type_of("users/user");
        let mut event = ChangeEvent::delete(obj);
        event.object_type = None;
        assert_eq!(event.object_type(), Some("users/user"));
    }

    #[test]
    fn test_change_event_wire_shape_keeps_dn_once() {
        let obj = DirectoryObject::new("cn=g1").property("users", ["uid=u1"]);
        let value = serde_json::to_value(ChangeEvent::create(obj)).expect("serializable");
        assert_eq!(value["dn"], "cn=g1");
        assert_eq!(value["new"]["users"][0], "uid=u1");
        assert!(value["new"].get("dn").is_none());
    }
}
