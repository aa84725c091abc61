/// Query and update compilation tests
///
/// Keyword filters and update operations compiled against a document type,
/// checked both structurally and by evaluating them on stored documents.
/// Run with: cargo test --test query_compile_tests

use docmap::driver::matcher::matches;
use docmap::driver::update::apply_update;
use docmap::{
    CompiledQuery, Conditions, DocumentType, FieldDescriptor, FieldKind, OdmError, Q, RawDocument, Registry,
    ScalarType, Value, compile, compile_update,
};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

fn person() -> (Registry, Arc<DocumentType>) {
    let t = DocumentType::builder("Person")
        .collection("people")
        .field(FieldDescriptor::string("name").db_field("n"))
        .field(FieldDescriptor::int("x"))
        .field(FieldDescriptor::int("score"))
        .field(FieldDescriptor::list("tags", FieldKind::Scalar(ScalarType::String)))
        .build()
        .unwrap();
    (Registry::new().with_type(Arc::clone(&t)).unwrap(), t)
}

fn raw(value: JsonValue) -> RawDocument {
    value.as_object().unwrap().clone()
}

fn population() -> Vec<RawDocument> {
    (0..10)
        .map(|x| raw(json!({"_id": x, "n": format!("p{x}"), "x": x})))
        .collect()
}

fn matching_ids(query: &CompiledQuery) -> Vec<JsonValue> {
    population()
        .into_iter()
        .filter(|doc| matches(doc, query).unwrap())
        .map(|doc| doc["_id"].clone())
        .collect()
}

#[test]
fn test_simplified_tree_selects_same_documents() {
    let (registry, t) = person();
    let trees = vec![
        Q::cond("x__lt", 7) & Q::cond("x__gt", 1),
        Q::cond("x__lt", 7) & Q::cond("x__lt", 3),
        (Q::cond("x__gte", 8) | Q::cond("name", "p1")) & Q::cond("x__ne", 9),
        Q::cond("x__in", Value::List(vec![1.into(), 2.into()])) & Q::new(),
    ];
    for tree in trees {
        let raw_query = tree.to_query(&registry, &t).unwrap();
        let simplified = tree.clone().simplify().to_query(&registry, &t).unwrap();
        assert_eq!(matching_ids(&raw_query), matching_ids(&simplified), "tree {tree:?}");
    }
}

#[test]
fn test_colliding_upper_bounds_keep_both() {
    let (registry, t) = person();
    let query = (Q::cond("x__lt", 7) & Q::cond("x__lt", 3))
        .simplify()
        .to_query(&registry, &t)
        .unwrap();
    assert_eq!(
        JsonValue::Object(query.clone()),
        json!({"$and": [{"x": {"$lt": 7}}, {"x": {"$lt": 3}}]})
    );
    assert_eq!(matching_ids(&query), vec![json!(0), json!(1), json!(2)]);
}

#[test]
fn test_dec_equals_negative_inc() {
    let (registry, t) = person();
    let dec = compile_update(&registry, &t, &Conditions::new().with("dec__score", 5)).unwrap();
    let inc = compile_update(&registry, &t, &Conditions::new().with("inc__score", -5)).unwrap();
    assert_eq!(dec, inc);
    assert_eq!(JsonValue::Object(dec), json!({"$inc": {"score": -5}}));
}

#[test]
fn test_update_round_trip_matches_in_memory_result() {
    let (registry, t) = person();
    let ops = Conditions::new()
        .with("set__name", "renamed")
        .with("inc__score", 3)
        .with("push__tags", "c")
        .with("pull__tags", "a")
        .with("unset__x", true);
    let update = compile_update(&registry, &t, &ops).unwrap();

    let mut stored = raw(json!({"_id": 1, "n": "p1", "x": 4, "score": 10, "tags": ["a", "b"]}));
    assert!(apply_update(&mut stored, &CompiledQuery::new(), &update, false).unwrap());
    assert_eq!(
        JsonValue::Object(stored),
        json!({"_id": 1, "n": "renamed", "score": 13, "tags": ["b", "c"]})
    );
}

#[test]
fn test_push_all_and_add_to_set_shapes() {
    let (registry, t) = person();
    let tags = Value::List(vec!["a".into(), "b".into()]);
    let push_all = compile_update(&registry, &t, &Conditions::new().with("push_all__tags", tags.clone())).unwrap();
    assert_eq!(
        JsonValue::Object(push_all),
        json!({"$push": {"tags": {"$each": ["a", "b"]}}})
    );
    let add = compile_update(&registry, &t, &Conditions::new().with("add_to_set__tags", tags)).unwrap();
    assert_eq!(
        JsonValue::Object(add),
        json!({"$addToSet": {"tags": {"$each": ["a", "b"]}}})
    );
}

#[test]
fn test_update_without_operator_is_rejected() {
    let (registry, t) = person();
    assert!(matches!(
        compile_update(&registry, &t, &Conditions::new().with("name", "x")),
        Err(OdmError::InvalidQuery(_))
    ));
}

#[test]
fn test_raw_condition_passes_through() {
    let (registry, t) = person();
    let conditions = Conditions::new()
        .with("__raw__", Value::from(json!({"x": {"$mod": [2, 0]}})))
        .with("name", "p4");
    let query = compile(&registry, &t, &conditions).unwrap();
    assert_eq!(JsonValue::Object(query.clone()), json!({"x": {"$mod": [2, 0]}, "n": "p4"}));
    assert_eq!(matching_ids(&query), vec![json!(4)]);
}
