//! Whiteboard operations.
//!
//! Operations are the unit of replication. They are immutable once issued and
//! carry everything a replica needs to merge them, so they can be applied in
//! any order and any number of times.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::clock::OpId;
use crate::shape::{PropValue, ShapeId};

/// Longest accepted property key, in bytes.
pub const MAX_KEY_LEN: usize = 256;
/// Longest accepted text value, in bytes.
pub const MAX_TEXT_LEN: usize = 64 * 1024;
/// Most points accepted in a single path value.
pub const MAX_POINTS: usize = 100_000;
/// Most properties accepted on a single create.
pub const MAX_CREATE_PROPS: usize = 1024;

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Create a shape. Its id is the id of this operation.
    CreateShape { props: BTreeMap<String, PropValue> },
    SetProperty {
        shape: ShapeId,
        key: String,
        value: PropValue,
    },
    DeleteShape { shape: ShapeId },
}

/// A stamped whiteboard mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(id: OpId, kind: OpKind) -> Self {
        Self { id, kind }
    }

    /// The shape this operation targets.
    pub fn shape(&self) -> ShapeId {
        match &self.kind {
            OpKind::CreateShape { .. } => ShapeId(self.id),
            OpKind::SetProperty { shape, .. } | OpKind::DeleteShape { shape } => *shape,
        }
    }

    /// Reject operations no honest replica would issue.
    pub fn validate(&self) -> Result<(), OpError> {
        if self.id.client.is_nil() {
            return Err(OpError::NilClient);
        }
        if self.id.counter == 0 {
            return Err(OpError::ZeroCounter);
        }
        match &self.kind {
            OpKind::CreateShape { props } => {
                if props.len() > MAX_CREATE_PROPS {
                    return Err(OpError::TooManyProperties(props.len()));
                }
                for (key, value) in props {
                    validate_key(key)?;
                    validate_value(value)?;
                }
            }
            OpKind::SetProperty { shape, key, value } => {
                validate_shape(shape)?;
                validate_key(key)?;
                validate_value(value)?;
            }
            OpKind::DeleteShape { shape } => validate_shape(shape)?,
        }
        Ok(())
    }
}

fn validate_shape(shape: &ShapeId) -> Result<(), OpError> {
    if shape.0.client.is_nil() || shape.0.counter == 0 {
        return Err(OpError::InvalidShapeId);
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), OpError> {
    if key.is_empty() {
        return Err(OpError::EmptyKey);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(OpError::KeyTooLong(key.len()));
    }
    Ok(())
}

fn validate_value(value: &PropValue) -> Result<(), OpError> {
    match value {
        PropValue::Float(f) if !f.is_finite() => Err(OpError::NonFiniteNumber),
        PropValue::Text(s) if s.len() > MAX_TEXT_LEN => Err(OpError::TextTooLong(s.len())),
        PropValue::Points(points) => {
            if points.len() > MAX_POINTS {
                return Err(OpError::TooManyPoints(points.len()));
            }
            if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                return Err(OpError::NonFiniteNumber);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Why an operation was rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    NilClient,
    ZeroCounter,
    InvalidShapeId,
    EmptyKey,
    KeyTooLong(usize),
    TextTooLong(usize),
    TooManyPoints(usize),
    TooManyProperties(usize),
    NonFiniteNumber,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::NilClient => write!(f, "operation issued by the nil client"),
            OpError::ZeroCounter => write!(f, "operation counter must be positive"),
            OpError::InvalidShapeId => write!(f, "invalid shape id"),
            OpError::EmptyKey => write!(f, "property key is empty"),
            OpError::KeyTooLong(n) => {
                write!(f, "property key too long: {} bytes (max {})", n, MAX_KEY_LEN)
            }
            OpError::TextTooLong(n) => {
                write!(f, "text value too long: {} bytes (max {})", n, MAX_TEXT_LEN)
            }
            OpError::TooManyPoints(n) => {
                write!(f, "too many points: {} (max {})", n, MAX_POINTS)
            }
            OpError::TooManyProperties(n) => {
                write!(f, "too many properties: {} (max {})", n, MAX_CREATE_PROPS)
            }
            OpError::NonFiniteNumber => write!(f, "numbers must be finite"),
        }
    }
}

impl std::error::Error for OpError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClientId;
    use uuid::Uuid;

    fn id(counter: u64) -> OpId {
        OpId::new(ClientId::from_uuid(Uuid::from_u128(7)), counter)
    }

    fn set(key: &str, value: PropValue) -> Operation {
        Operation::new(
            id(2),
            OpKind::SetProperty {
                shape: ShapeId(id(1)),
                key: key.to_string(),
                value,
            },
        )
    }

    #[test]
    fn test_create_targets_own_id() {
        let op = Operation::new(id(3), OpKind::CreateShape { props: BTreeMap::new() });
        assert_eq!(op.shape(), ShapeId(id(3)));
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_rejects_nil_client_and_zero_counter() {
        let nil = Operation::new(
            OpId::new(ClientId::nil(), 1),
            OpKind::CreateShape { props: BTreeMap::new() },
        );
        assert_eq!(nil.validate(), Err(OpError::NilClient));

        let zero = Operation::new(id(0), OpKind::CreateShape { props: BTreeMap::new() });
        assert_eq!(zero.validate(), Err(OpError::ZeroCounter));
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert_eq!(set("", PropValue::Null).validate(), Err(OpError::EmptyKey));
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert_eq!(
            set(&long, PropValue::Null).validate(),
            Err(OpError::KeyTooLong(MAX_KEY_LEN + 1))
        );
        assert!(set(&"k".repeat(MAX_KEY_LEN), PropValue::Null).validate().is_ok());
    }

    #[test]
    fn test_rejects_non_finite_numbers() {
        assert_eq!(
            set("x", PropValue::Float(f64::INFINITY)).validate(),
            Err(OpError::NonFiniteNumber)
        );
        assert_eq!(
            set("path", PropValue::Points(vec![(0.0, f64::NAN)])).validate(),
            Err(OpError::NonFiniteNumber)
        );
    }

    #[test]
    fn test_rejects_oversized_values() {
        let text = "a".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(
            set("label", PropValue::Text(text)).validate(),
            Err(OpError::TextTooLong(_))
        ));

        let points = vec![(0.0, 0.0); MAX_POINTS + 1];
        assert!(matches!(
            set("path", PropValue::Points(points)).validate(),
            Err(OpError::TooManyPoints(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_target() {
        let op = Operation::new(
            id(2),
            OpKind::DeleteShape {
                shape: ShapeId(OpId::new(ClientId::nil(), 1)),
            },
        );
        assert_eq!(op.validate(), Err(OpError::InvalidShapeId));
    }
}
