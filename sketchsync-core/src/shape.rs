//! Shapes and their last-writer-wins property registers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::clock::{ClientId, OpId};

/// Globally unique shape identifier.
///
/// A shape is named after the operation that created it, so two peers can
/// never mint the same id without coordinating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeId(pub OpId);

impl ShapeId {
    pub fn op_id(&self) -> OpId {
        self.0
    }

    pub fn creator(&self) -> ClientId {
        self.0.client
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shape:{}", self.0)
    }
}

/// Typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Path data as a polyline.
    Points(Vec<(f64, f64)>),
}

impl PropValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(v) => Some(*v),
            PropValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// JSON rendering for UI layers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            PropValue::Null => Value::Null,
            PropValue::Bool(b) => Value::Bool(*b),
            PropValue::Int(i) => Value::from(*i),
            PropValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropValue::Text(s) => Value::String(s.clone()),
            PropValue::Points(points) => Value::Array(
                points
                    .iter()
                    .map(|(x, y)| serde_json::json!([x, y]))
                    .collect(),
            ),
        }
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

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Text(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Text(v)
    }
}

impl From<Vec<(f64, f64)>> for PropValue {
    fn from(v: Vec<(f64, f64)>) -> Self {
        PropValue::Points(v)
    }
}

/// Identifier smaller than any id that can be issued.
pub(crate) const BOTTOM: OpId = OpId {
    counter: 0,
    client: ClientId::NIL,
};

/// Last-writer-wins cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register<T> {
    value: T,
    stamp: OpId,
}

impl<T> Register<T> {
    pub fn new(value: T, stamp: OpId) -> Self {
        Self { value, stamp }
    }

    /// Replace the value if `stamp` is strictly newer. Returns whether it did.
    pub fn merge(&mut self, value: T, stamp: OpId) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> OpId {
        self.stamp
    }
}

/// Internal record of a shape, tombstoned or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    /// Whether the create operation has been seen. A shape can be referenced
    /// by a set or delete that arrives before its create.
    created: bool,
    visible: Register<bool>,
    props: BTreeMap<String, Register<PropValue>>,
}

impl ShapeRecord {
    pub(crate) fn placeholder() -> Self {
        Self {
            created: false,
            visible: Register::new(false, BOTTOM),
            props: BTreeMap::new(),
        }
    }

    pub(crate) fn apply_create(
        &mut self,
        stamp: OpId,
        props: &BTreeMap<String, PropValue>,
    ) -> bool {
        let mut changed = !self.created;
        self.created = true;
        changed |= self.visible.merge(true, stamp);
        for (key, value) in props {
            changed |= self.merge_prop(key, value.clone(), stamp);
        }
        changed
    }

    pub(crate) fn apply_set(&mut self, key: &str, value: PropValue, stamp: OpId) -> bool {
        // A write newer than the last delete brings the shape back.
        let resurrected = self.visible.merge(true, stamp);
        self.merge_prop(key, value, stamp) | resurrected
    }

    pub(crate) fn apply_delete(&mut self, stamp: OpId) -> bool {
        self.visible.merge(false, stamp)
    }

    fn merge_prop(&mut self, key: &str, value: PropValue, stamp: OpId) -> bool {
        match self.props.get_mut(key) {
            Some(register) => register.merge(value, stamp),
            None => {
                self.props.insert(key.to_string(), Register::new(value, stamp));
                true
            }
        }
    }

    /// Shown in read views.
    pub fn is_visible(&self) -> bool {
        self.created && *self.visible.get()
    }

    /// Tombstoned: created, then deleted by the newest visibility write.
    pub fn is_deleted(&self) -> bool {
        self.created && !*self.visible.get()
    }

    pub fn prop(&self, key: &str) -> Option<&Register<PropValue>> {
        self.props.get(key)
    }

    pub(crate) fn view(&self, id: ShapeId) -> ShapeView {
        ShapeView {
            id,
            props: self
                .props
                .iter()
                .map(|(k, r)| (k.clone(), r.get().clone()))
                .collect(),
        }
    }
}

/// Read-only view of a visible shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeView {
    pub id: ShapeId,
    pub props: BTreeMap<String, PropValue>,
}

impl ShapeView {
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.props.get(key)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let props: serde_json::Map<String, serde_json::Value> = self
            .props
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::json!({
            "id": self.id.to_string(),
            "props": props,
        })
    }
}
