use crate::core::{CompiledQuery, Result, Value};
use crate::query::transform;
use crate::schema::{DocumentType, Registry};
use serde_json::Value as JsonValue;
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

/// Ordered keyword conditions of a leaf, implicitly AND-ed.
///
/// Keys are `path__operator` keywords; inserting an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    entries: Vec<(String, Value)>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Conditions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut conditions = Self::new();
        for (key, value) in iter {
            conditions.insert(key, value);
        }
        conditions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    fn operator(self) -> &'static str {
        match self {
            Self::And => "$and",
            Self::Or => "$or",
        }
    }
}

/// Filter expression tree.
///
/// ```ignore
/// let q = Q::cond("age__gte", 18) & (Q::cond("name", "ann") | Q::cond("name", "bob"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    Leaf(Conditions),
    Combination { op: Combinator, children: Vec<Q> },
}

impl Default for Q {
    fn default() -> Self {
        Self::Leaf(Conditions::new())
    }
}

impl Q {
    /// The empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cond(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Leaf(Conditions::new().with(key, value))
    }

    pub fn leaf(conditions: Conditions) -> Self {
        Self::Leaf(conditions)
    }

    /// Whether the node carries no condition at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Leaf(conditions) => conditions.is_empty(),
            Self::Combination { children, .. } => children.iter().all(Q::is_empty),
        }
    }

    pub fn and(self, other: Q) -> Q {
        self.combine(Combinator::And, other)
    }

    pub fn or(self, other: Q) -> Q {
        self.combine(Combinator::Or, other)
    }

    fn combine(self, op: Combinator, other: Q) -> Q {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        let mut children = Vec::new();
        for node in [self, other] {
            match node {
                Self::Combination { op: inner, children: nested } if inner == op => {
                    children.extend(nested)
                }
                node => children.push(node),
            }
        }
        Self::Combination { op, children }
    }

    /// Bottom-up simplification: an AND whose children are all leaves becomes
    /// one leaf, unless two children use the same keyword key.
    pub fn simplify(self) -> Q {
        match self {
            Self::Leaf(_) => self,
            Self::Combination { op, children } => {
                let children: Vec<Q> = children
                    .into_iter()
                    .map(Q::simplify)
                    .filter(|child| !child.is_empty())
                    .collect();
                if op == Combinator::And && children.iter().all(|c| matches!(c, Self::Leaf(_))) {
                    if let Some(merged) = merge_leaves(&children) {
                        return Self::Leaf(merged);
                    }
                }
                Self::Combination { op, children }
            }
        }
    }

    /// Simplifies then compiles into a native query for `doc_type`.
    pub fn to_query(&self, registry: &Registry, doc_type: &Arc<DocumentType>) -> Result<CompiledQuery> {
        compile_node(&self.clone().simplify(), registry, doc_type)
    }
}

fn merge_leaves(children: &[Q]) -> Option<Conditions> {
    let mut merged = Conditions::new();
    for child in children {
        if let Q::Leaf(conditions) = child {
            for (key, value) in conditions.iter() {
                if merged.contains_key(key) {
                    return None;
                }
                merged.insert(key, value.clone());
            }
        }
    }
    Some(merged)
}

fn compile_node(node: &Q, registry: &Registry, doc_type: &Arc<DocumentType>) -> Result<CompiledQuery> {
    match node {
        Q::Leaf(conditions) => transform::compile(registry, doc_type, conditions),
        Q::Combination { op, children } => {
            let mut compiled = Vec::with_capacity(children.len());
            for child in children.iter().filter(|c| !c.is_empty()) {
                compiled.push(JsonValue::Object(compile_node(child, registry, doc_type)?));
            }
            let mut query = CompiledQuery::new();
            if !compiled.is_empty() {
                query.insert(op.operator().to_string(), JsonValue::Array(compiled));
            }
            Ok(query)
        }
    }
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(self, rhs: Q) -> Q {
        self.and(rhs)
    }
}

impl BitOr for Q {
    type Output = Q;

    fn bitor(self, rhs: Q) -> Q {
        self.or(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use serde_json::json;

    fn setup() -> (Registry, Arc<DocumentType>) {
        let t = DocumentType::builder("Person")
            .field(FieldDescriptor::int("x"))
            .field(FieldDescriptor::string("name"))
            .build()
            .unwrap();
        (Registry::new().with_type(Arc::clone(&t)).unwrap(), t)
    }

    #[test]
    fn test_empty_is_identity() {
        let q = Q::cond("x", 1);
        assert_eq!(Q::new() & q.clone(), q);
        assert_eq!(q.clone() | Q::new(), q);
        assert!(Q::new().is_empty());
        assert!(!q.is_empty());
    }

    #[test]
    fn test_same_operator_flattens() {
        let q = Q::cond("a", 1) & Q::cond("b", 2) & Q::cond("c", 3);
        match q {
            Q::Combination { op, children } => {
                assert_eq!(op, Combinator::And);
                assert_eq!(children.len(), 3);
                assert!(children.iter().all(|c| matches!(c, Q::Leaf(_))));
            }
            other => panic!("expected combination, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_operators_nest() {
        let q = (Q::cond("a", 1) | Q::cond("b", 2)) & Q::cond("c", 3);
        let Q::Combination { children, .. } = q else {
            panic!("expected combination");
        };
        assert!(matches!(children[0], Q::Combination { op: Combinator::Or, .. }));
    }

    #[test]
    fn test_simplify_merges_disjoint_leaves() {
        let q = (Q::cond("x__lt", 7) & Q::cond("x__gt", 1)).simplify();
        let Q::Leaf(conditions) = q else {
            panic!("expected leaf");
        };
        assert_eq!(conditions.keys().collect::<Vec<_>>(), vec!["x__lt", "x__gt"]);
    }

    #[test]
    fn test_simplify_keeps_colliding_keys() {
        let q = Q::cond("x__lt", 7) & Q::cond("x__lt", 3);
        assert_eq!(q.clone().simplify(), q);
    }

    #[test]
    fn test_colliding_bounds_compile_to_and() {
        let (registry, t) = setup();
        let raw = Q::cond("x__lt", 7) & Q::cond("x__lt", 3);
        let simplified = raw.clone().simplify();
        let expected = json!({"$and": [{"x": {"$lt": 7}}, {"x": {"$lt": 3}}]});
        assert_eq!(JsonValue::Object(raw.to_query(&registry, &t).unwrap()), expected);
        assert_eq!(JsonValue::Object(simplified.to_query(&registry, &t).unwrap()), expected);
    }

    #[test]
    fn test_or_compiles_to_or() {
        let (registry, t) = setup();
        let q = Q::cond("name", "a") | Q::cond("name", "b");
        assert_eq!(
            JsonValue::Object(q.to_query(&registry, &t).unwrap()),
            json!({"$or": [{"name": "a"}, {"name": "b"}]})
        );
    }
}
