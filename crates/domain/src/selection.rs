//! Frontend tool/skill selection and its intersection with stored
//! permissions.
//!
//! A request carries either the string `"auto"` (use everything the user is
//! permitted to use) or an explicit whitelist of names. Whitelist entries
//! the user is not permitted to use are silently dropped.

use std::collections::HashSet;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Auto,
    Named(Vec<String>),
}

impl Selection {
    /// Intersect this selection with the permitted set.
    ///
    /// `Auto` yields the permitted set unchanged; an explicit list yields
    /// the set intersection by name.
    pub fn apply(&self, permitted: HashSet<String>) -> HashSet<String> {
        match self {
            Selection::Auto => permitted,
            Selection::Named(names) => names
                .iter()
                .filter(|n| permitted.contains(n.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Selection::Auto)
    }
}

impl Serialize for Selection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Selection::Auto => serializer.serialize_str("auto"),
            Selection::Named(names) => {
                let mut seq = serializer.serialize_seq(Some(names.len()))?;
                for n in names {
                    seq.serialize_element(n)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Selection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SelectionVisitor;

        impl<'de> Visitor<'de> for SelectionVisitor {
            type Value = Selection;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("\"auto\" or a list of names")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Selection, E> {
                if v == "auto" {
                    Ok(Selection::Auto)
                } else {
                    Err(E::custom(format!(
                        "expected \"auto\" or a list of names, got \"{v}\""
                    )))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Selection, A::Error> {
                let mut names = Vec::new();
                while let Some(name) = seq.next_element::<String>()? {
                    names.push(name);
                }
                Ok(Selection::Named(names))
            }
        }

        deserializer.deserialize_any(SelectionVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn deserialize_auto() {
        let s: Selection = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(s, Selection::Auto);
    }

    #[test]
    fn deserialize_list() {
        let s: Selection = serde_json::from_str(r#"["tool_x", "tool_y"]"#).unwrap();
        assert_eq!(s, Selection::Named(vec!["tool_x".into(), "tool_y".into()]));
    }

    #[test]
    fn deserialize_other_string_rejected() {
        assert!(serde_json::from_str::<Selection>("\"all\"").is_err());
    }

    #[test]
    fn serialize_roundtrip() {
        for sel in [
            Selection::Auto,
            Selection::Named(vec!["a".into(), "b".into()]),
        ] {
            let json = serde_json::to_string(&sel).unwrap();
            let back: Selection = serde_json::from_str(&json).unwrap();
            assert_eq!(back, sel);
        }
    }

    #[test]
    fn auto_passes_permitted_through() {
        let permitted = set(&["tool_x", "tool_y"]);
        assert_eq!(Selection::Auto.apply(permitted.clone()), permitted);
    }

    #[test]
    fn explicit_selection_intersects() {
        let permitted = set(&["tool_x"]);
        let sel = Selection::Named(vec!["tool_x".into(), "tool_y".into()]);
        assert_eq!(sel.apply(permitted), set(&["tool_x"]));
    }

    #[test]
    fn unpermitted_names_silently_dropped() {
        let sel = Selection::Named(vec!["tool_y".into()]);
        assert!(sel.apply(set(&["tool_x"])).is_empty());
    }
}
