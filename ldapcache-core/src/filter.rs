//! Shard selection predicates
//!
//! A [`Predicate`] decides which directory objects a shard accepts. The same
//! type doubles as a query filter: [`Predicate::may_overlap`] tells the
//! registry whether a shard could hold objects matching a query.

use serde::{Deserialize, Serialize};

use crate::{DirectoryObject, OBJECT_TYPE_ATTRIBUTE};

/// Boolean expression over a directory object's properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every object.
    #[default]
    Any,
    /// Object-type discriminator equals `value`.
    ObjectType { value: String },
    /// Some value of `attribute` equals `value` (case-insensitive).
    Equals { attribute: String, value: String },
    /// `attribute` has at least one value.
    Present { attribute: String },
    /// All sub-predicates match.
    And { all: Vec<Predicate> },
    /// At least one sub-predicate matches.
    Or { any: Vec<Predicate> },
    /// The sub-predicate does not match.
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn object_type(value: impl Into<String>) -> Self {
        Predicate::ObjectType {
            value: value.into(),
        }
    }

    pub fn equals(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Predicate::Present {
            attribute: attribute.into(),
        }
    }

    pub fn and(all: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And {
            all: all.into_iter().collect(),
        }
    }

    pub fn or(any: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or {
            any: any.into_iter().collect(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Evaluate the predicate against an object. Pure.
    pub fn matches(&self, object: &DirectoryObject) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::ObjectType { value } => object.object_type() == Some(value.as_str()),
            Predicate::Equals { attribute, value } => object
                .values(attribute)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
            Predicate::Present { attribute } => object.has(attribute),
            Predicate::And { all } => all.iter().all(|p| p.matches(object)),
            Predicate::Or { any } => any.iter().any(|p| p.matches(object)),
            Predicate::Not { predicate } => !predicate.matches(object),
        }
    }

    /// Whether some object could satisfy both `self` and `other`.
    ///
    /// Conservative: `false` is only returned when the two are provably
    /// disjoint (different object types, or an equality/presence one side
    /// requires and the other forbids). Multi-valued attributes mean two
    /// different `Equals` values on the same attribute can still overlap.
    pub fn may_overlap(&self, other: &Predicate) -> bool {
        let left = self.clauses(true);
        let right = other.clauses(true);
        left.iter()
            .any(|l| right.iter().any(|r| consistent(l.iter().chain(r.iter()))))
    }

    /// Disjunctive normal form: a list of conjunctive clauses.
    fn clauses(&self, positive: bool) -> Vec<Vec<Literal>> {
        match (self, positive) {
            (Predicate::Any, true) => vec![Vec::new()],
            (Predicate::Any, false) => Vec::new(),
            (Predicate::ObjectType { value }, _) => {
                vec![vec![Literal::new(Atom::ObjectType(value.clone()), positive)]]
            }
            (Predicate::Equals { attribute, value }, _) => {
                let atom = Atom::Equals(attribute.to_ascii_lowercase(), value.to_ascii_lowercase());
                vec![vec![Literal::new(atom, positive)]]
            }
            (Predicate::Present { attribute }, _) => {
                vec![vec![Literal::new(
                    Atom::Present(attribute.to_ascii_lowercase()),
                    positive,
                )]]
            }
            (Predicate::Not { predicate }, _) => predicate.clauses(!positive),
            (Predicate::And { all }, true) | (Predicate::Or { any: all }, false) => {
                all.iter().fold(vec![Vec::new()], |acc, p| {
                    let next = p.clauses(positive);
                    acc.iter()
                        .flat_map(|clause| {
                            next.iter().map(move |n| {
                                let mut merged = clause.clone();
                                merged.extend(n.iter().cloned());
                                merged
                            })
                        })
                        .collect()
                })
            }
            (Predicate::Or { any }, true) | (Predicate::And { all: any }, false) => {
                any.iter().flat_map(|p| p.clauses(positive)).collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Atom {
    ObjectType(String),
    Equals(String, String),
    Present(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Literal {
    atom: Atom,
    positive: bool,
}

impl Literal {
    fn new(atom: Atom, positive: bool) -> Self {
        Self { atom, positive }
    }
}

/// Whether a conjunction of literals is satisfiable.
fn consistent<'a>(literals: impl Iterator<Item = &'a Literal>) -> bool {
    let literals: Vec<&Literal> = literals.collect();
    let object_type_attr = OBJECT_TYPE_ATTRIBUTE.to_ascii_lowercase();

    for (i, a) in literals.iter().enumerate() {
        for b in &literals[i + 1..] {
            if a.atom == b.atom && a.positive != b.positive {
                return false;
            }
            if !(a.positive && b.positive) {
                if contradicts(a, b, &object_type_attr) {
                    return false;
                }
                continue;
            }
            if let (Atom::ObjectType(x), Atom::ObjectType(y)) = (&a.atom, &b.atom) {
                if x != y {
                    return false;
                }
            }
        }
    }
    true
}

/// One literal needs an attribute value the other forbids to be present.
fn contradicts(a: &Literal, b: &Literal, object_type_attr: &str) -> bool {
    let (pos, neg) = match (a.positive, b.positive) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => return false,
    };
    let Atom::Present(forbidden) = &neg.atom else {
        return false;
    };
    let required_attr = match &pos.atom {
        Atom::Equals(attr, _) | Atom::Present(attr) => attr.as_str(),
        Atom::ObjectType(_) => object_type_attr,
    };
    required_attr == forbidden
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn group() -> DirectoryObject {
        DirectoryObject::new("cn=g1,cn=groups,dc=example")
            .object_type_of("groups/group")
            .property("objectClass", ["posixGroup", "univentionGroup"])
    }

    #[test]
    fn test_matches_object_type() {
        assert!(Predicate::object_type("groups/group").matches(&group()));
        assert!(!Predicate::object_type("users/user").matches(&group()));
        assert!(Predicate::Any.matches(&group()));
    }

    #[test]
    fn test_matches_equals_any_value_case_insensitive() {
        assert!(Predicate::equals("objectclass", "POSIXGROUP").matches(&group()));
        assert!(!Predicate::equals("objectClass", "person").matches(&group()));
    }

    #[test]
    fn test_matches_boolean_combinators() {
        let p = Predicate::and([
            Predicate::object_type("groups/group"),
            Predicate::not(Predicate::present("mailPrimaryAddress")),
        ]);
        assert!(p.matches(&group()));

        let q = Predicate::or([
            Predicate::object_type("users/user"),
            Predicate::equals("objectClass", "univentionGroup"),
        ]);
        assert!(q.matches(&group()));
        assert!(!Predicate::not(q).matches(&group()));
    }

    #[test]
    fn test_overlap_different_object_types_is_disjoint() {
        let groups = Predicate::object_type("groups/group");
        let users = Predicate::object_type("users/user");
        assert!(!groups.may_overlap(&users));
        assert!(groups.may_overlap(&groups));
        assert!(groups.may_overlap(&Predicate::Any));
    }

    #[test]
    fn test_overlap_or_branches() {
        let hosts = Predicate::or([
            Predicate::object_type("computers/windows"),
            Predicate::object_type("computers/linux"),
        ]);
        assert!(hosts.may_overlap(&Predicate::object_type("computers/linux")));
        assert!(!hosts.may_overlap(&Predicate::object_type("users/user")));
    }

    #[test]
    fn test_overlap_negation() {
        let mail = Predicate::present("mailPrimaryAddress");
        let no_mail = Predicate::not(Predicate::present("mailPrimaryAddress"));
        assert!(!mail.may_overlap(&no_mail));
        assert!(!Predicate::equals("mailPrimaryAddress", "a@b").may_overlap(&no_mail));
        assert!(!Predicate::not(Predicate::Any).may_overlap(&Predicate::Any));
        assert!(!Predicate::object_type("groups/group")
            .may_overlap(&Predicate::not(Predicate::object_type("groups/group"))));
    }

    #[test]
    fn test_overlap_multi_valued_equals_is_conservative() {
        let a = Predicate::equals("objectClass", "posixGroup");
        let b = Predicate::equals("objectClass", "univentionGroup");
        assert!(a.may_overlap(&b));
    }

    #[test]
    fn test_predicate_wire_shape() {
        let p: Predicate = serde_json::from_str(r#"{"op": "object_type", "value": "groups/group"}"#)
            .expect("valid predicate json");
        assert_eq!(p, Predicate::object_type("groups/group"));
    }

    fn object_type_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("groups/group".to_string()),
            Just("users/user".to_string()),
            Just("computers/linux".to_string()),
        ]
    }

    proptest! {
        /// Property: if an object matches two predicates, they overlap.
        #[test]
        fn prop_matching_both_implies_overlap(
            obj_type in object_type_strategy(),
            a_type in object_type_strategy(),
            b_type in object_type_strategy(),
            negate_b in any::<bool>(),
        ) {
            let obj = DirectoryObject::new("cn=x").object_type_of(obj_type);
            let a = Predicate::object_type(a_type);
            let b = if negate_b {
                Predicate::not(Predicate::object_type(b_type))
            } else {
                Predicate::object_type(b_type)
            };
            if a.matches(&obj) && b.matches(&obj) {
                prop_assert!(a.may_overlap(&b));
            }
        }
    }
}
