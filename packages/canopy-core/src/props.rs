use rustc_hash::{FxHashMap, FxHasher};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

pub type Props = FxHashMap<String, PropValue>;

/// A callable held engine-side for an event prop. Handlers never cross the
/// renderer bridge and never reach a diff worker; only their names do.
#[derive(Clone)]
pub struct EventHandler(Rc<RefCell<dyn FnMut(PropValue)>>);

impl EventHandler {
    pub fn new(f: impl FnMut(PropValue) + 'static) -> Self {
        Self(Rc::new(RefCell::new(f)))
    }

    pub fn invoke(&self, data: PropValue) {
        (self.0.borrow_mut())(data);
    }
}

impl PartialEq for EventHandler {
    // Handler identity is pointer identity; a re-created closure with the
    // same body counts as a different handler.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventHandler")
    }
}

/// The recursive prop-value domain. Mappings use `BTreeMap` so structural
/// hashing and serialization see a deterministic key order.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PropValue>),
    Map(BTreeMap<String, PropValue>),
    Handler(EventHandler),
}

impl PropValue {
    pub fn handler(f: impl FnMut(PropValue) + 'static) -> Self {
        PropValue::Handler(EventHandler::new(f))
    }

    pub fn is_handler(&self) -> bool {
        matches!(self, PropValue::Handler(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        PropValue::Int(v as i64)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl Serialize for PropValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropValue::Null => serializer.serialize_unit(),
            PropValue::Bool(v) => serializer.serialize_bool(*v),
            PropValue::Int(v) => serializer.serialize_i64(*v),
            PropValue::Float(v) => serializer.serialize_f64(*v),
            PropValue::Str(v) => serializer.serialize_str(v),
            PropValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            PropValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            // Handlers are stripped before any boundary; one that leaks
            // this far degrades to null rather than leaking a callable.
            PropValue::Handler(_) => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for PropValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = PropValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a prop value")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<PropValue, E> {
                Ok(PropValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PropValue, E> {
                Ok(PropValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PropValue, E> {
                i64::try_from(v)
                    .map(PropValue::Int)
                    .map_err(|_| E::custom("integer prop out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<PropValue, E> {
                Ok(PropValue::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PropValue, E> {
                Ok(PropValue::Str(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<PropValue, E> {
                Ok(PropValue::Str(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<PropValue, E> {
                Ok(PropValue::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<PropValue, E> {
                Ok(PropValue::Null)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<PropValue, D::Error> {
                PropValue::deserialize(d)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<PropValue, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = access.next_element()? {
                    items.push(item);
                }
                Ok(PropValue::List(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PropValue, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, PropValue>()? {
                    entries.insert(key, value);
                }
                Ok(PropValue::Map(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A prop is an event prop iff its key is `on`-prefixed and its value is a
/// handler. A handler under any other key is an author mistake, surfaced
/// where props are stripped for the wire.
pub fn is_event_prop(key: &str, value: &PropValue) -> bool {
    key.starts_with("on") && value.is_handler()
}

/// Compute the prop deltas between two renders.
///
/// Keys map to the new value; removals map to `Null`. Event props are
/// reconciled separately and never appear here. An empty result means no
/// renderer update is required.
pub fn diff_props(old: &Props, new: &Props) -> Props {
    let mut changed = Props::default();
    for (key, new_value) in new {
        if is_event_prop(key, new_value) {
            continue;
        }
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            _ => {
                changed.insert(key.clone(), new_value.clone());
            }
        }
    }
    for (key, old_value) in old {
        if is_event_prop(key, old_value) {
            continue;
        }
        if !new.contains_key(key) {
            changed.insert(key.clone(), PropValue::Null);
        }
    }
    changed
}

/// Stable hash of the non-event props, with deterministic key ordering.
/// Used by the instance registry's position+props tie-breaker.
pub fn props_hash(props: &Props) -> u64 {
    let mut keys: Vec<&String> = props
        .iter()
        .filter(|(key, value)| !is_event_prop(key, value) && !value.is_handler())
        .map(|(key, _)| key)
        .collect();
    keys.sort_unstable();

    let mut hasher = FxHasher::default();
    for key in keys {
        key.hash(&mut hasher);
        hash_value(&props[key.as_str()], &mut hasher);
    }
    hasher.finish()
}

fn hash_value<H: Hasher>(value: &PropValue, hasher: &mut H) {
    match value {
        PropValue::Null => 0u8.hash(hasher),
        PropValue::Bool(v) => {
            1u8.hash(hasher);
            v.hash(hasher);
        }
        PropValue::Int(v) => {
            2u8.hash(hasher);
            v.hash(hasher);
        }
        PropValue::Float(v) => {
            3u8.hash(hasher);
            v.to_bits().hash(hasher);
        }
        PropValue::Str(v) => {
            4u8.hash(hasher);
            v.hash(hasher);
        }
        PropValue::List(items) => {
            5u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        PropValue::Map(entries) => {
            6u8.hash(hasher);
            entries.len().hash(hasher);
            for (key, item) in entries {
                key.hash(hasher);
                hash_value(item, hasher);
            }
        }
        PropValue::Handler(_) => 7u8.hash(hasher),
    }
}

/// The element's derived event names: sorted `on`-prefixed handler keys.
pub fn listener_names(props: &Props) -> Vec<String> {
    let mut names: Vec<String> = props
        .iter()
        .filter(|(key, value)| is_event_prop(key, value))
        .map(|(key, _)| key.clone())
        .collect();
    names.sort_unstable();
    names
}

/// Copy of the props with every handler removed, for the renderer and the
/// diff workers. Handlers under non-`on` keys are dropped too, with a
/// diagnostic.
pub fn strip_handlers(props: &Props) -> Props {
    let mut stripped = Props::default();
    for (key, value) in props {
        if value.is_handler() {
            if !key.starts_with("on") {
                tracing::warn!(prop = %key, "handler supplied for non-event prop, dropping");
            }
            continue;
        }
        stripped.insert(key.clone(), value.clone());
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, PropValue)]) -> Props {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn equal_props_produce_no_deltas() {
        let old = props(&[("content", "a".into()), ("fontSize", 14.into())]);
        let new = old.clone();
        assert!(diff_props(&old, &new).is_empty());
    }

    #[test]
    fn changed_and_added_keys_map_to_new_values() {
        let old = props(&[("content", "a".into())]);
        let new = props(&[("content", "b".into()), ("color", "red".into())]);
        let changed = diff_props(&old, &new);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed["content"], "b".into());
        assert_eq!(changed["color"], "red".into());
    }

    #[test]
    fn removed_keys_map_to_null() {
        let old = props(&[("opacity", PropValue::Float(0.5))]);
        let new = props(&[]);
        let changed = diff_props(&old, &new);
        assert_eq!(changed["opacity"], PropValue::Null);
    }

    #[test]
    fn deep_values_compare_structurally() {
        let style = |weight: i64| {
            PropValue::Map(
                [
                    ("margin".to_owned(), PropValue::List(vec![1.into(), 2.into()])),
                    ("weight".to_owned(), weight.into()),
                ]
                .into(),
            )
        };
        let old = props(&[("style", style(400))]);
        let same = props(&[("style", style(400))]);
        let bolder = props(&[("style", style(700))]);

        assert!(diff_props(&old, &same).is_empty());
        assert_eq!(diff_props(&old, &bolder).len(), 1);
    }

    #[test]
    fn handlers_never_appear_in_deltas() {
        let old = props(&[("onPress", PropValue::handler(|_| {}))]);
        let new = props(&[("onPress", PropValue::handler(|_| {})), ("label", "go".into())]);
        let changed = diff_props(&old, &new);
        assert_eq!(changed.len(), 1);
        assert!(changed.contains_key("label"));
    }

    #[test]
    fn props_hash_ignores_handlers_and_insertion_order() {
        let a = props(&[
            ("b", 2.into()),
            ("a", 1.into()),
            ("onTap", PropValue::handler(|_| {})),
        ]);
        let b = props(&[("a", 1.into()), ("b", 2.into())]);
        assert_eq!(props_hash(&a), props_hash(&b));

        let c = props(&[("a", 1.into()), ("b", 3.into())]);
        assert_ne!(props_hash(&a), props_hash(&c));
    }

    #[test]
    fn listener_names_are_sorted_event_keys() {
        let p = props(&[
            ("onScroll", PropValue::handler(|_| {})),
            ("onPress", PropValue::handler(|_| {})),
            ("content", "x".into()),
        ]);
        assert_eq!(listener_names(&p), vec!["onPress", "onScroll"]);
    }

    #[test]
    fn strip_handlers_keeps_data_only() {
        let p = props(&[
            ("onPress", PropValue::handler(|_| {})),
            ("content", "x".into()),
        ]);
        let stripped = strip_handlers(&p);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("content"));
    }
}
