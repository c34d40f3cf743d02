//! Leaf visitors over arbitrary JSON trees.
//!
//! Payloads flowing through the recorder are opaque; the only structure we
//! rely on is the closed set of JSON node kinds.  Containers (arrays and
//! objects) are descended into, every other node is a leaf.

use serde_json::Value;

/// Visit every scalar leaf of `root` depth-first, in document order.
pub fn for_each_leaf<'a>(root: &'a Value, mut visit: impl FnMut(&'a Value)) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Value::Array(items) => stack.extend(items.iter().rev()),
            Value::Object(fields) => stack.extend(fields.values().rev()),
            leaf => visit(leaf),
        }
    }
}

/// Like [`for_each_leaf`], with mutable access so a leaf can be replaced
/// in place regardless of whether it sits in an array or an object field.
pub fn for_each_leaf_mut(root: &mut Value, mut visit: impl FnMut(&mut Value)) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Value::Array(items) => stack.extend(items.iter_mut().rev()),
            Value::Object(fields) => stack.extend(fields.values_mut().rev()),
            leaf => visit(leaf),
        }
    }
}

/// Collect the string leaves of `root` for which `pred` holds.
pub fn string_leaves<'a>(root: &'a Value, pred: impl Fn(&str) -> bool) -> Vec<&'a str> {
    let mut found = Vec::new();
    for_each_leaf(root, |leaf| {
        if let Value::String(s) = leaf {
            if pred(s) {
                found.push(s.as_str());
            }
        }
    });
    found
}
