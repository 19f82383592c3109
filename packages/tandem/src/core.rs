//! Core types for the tandem bridge.
//!
//! # Overview
//!
//! - [`Action`] = a tagged, immutable event record flowing into and out of the
//!   host store. Its `type` discriminant is mandatory, everything else is free-form.
//! - [`Take`] = the unit flowing through the dispatch channel: a chunk of actions
//!   produced by a process, or an end/failure signal.
//! - [`BridgeId`] = identifies one bridge instance in logs.
//!
//! # Well-formedness
//!
//! Whether something "is an action" is decided structurally, once, at the
//! boundary: a JSON value is an action iff it is an object with a string `type`
//! field. Everything typed as [`Action`] inside the crate is well-formed.

use std::fmt;
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::error::TandemError;

/// The discriminant of an [`Action`].
pub type ActionType = Arc<str>;

/// A tagged event record dispatched into and out of the host store.
///
/// Two actions are equal when their type and fields are structurally equal.
///
/// # Example
///
/// ```ignore
/// use tandem::Action;
///
/// let action = Action::new("REQUEST").with_payload(42);
/// assert_eq!(action.kind(), "REQUEST");
/// assert_eq!(action.payload(), Some(&serde_json::json!(42)));
/// ```
#[derive(Clone, PartialEq)]
pub struct Action {
    kind: ActionType,
    fields: Map<String, Value>,
}

impl Action {
    /// Type used by the reference store for its initialization action.
    pub const INIT_TYPE: &'static str = "@@tandem/INIT";

    /// Create an action with the given type and no additional fields.
    pub fn new(kind: impl AsRef<str>) -> Self {
        Self {
            kind: Arc::from(kind.as_ref()),
            fields: Map::new(),
        }
    }

    /// The initialization action dispatched by the reference store.
    pub fn init() -> Self {
        Self::new(Self::INIT_TYPE)
    }

    /// Set the conventional `payload` field.
    pub fn with_payload(self, payload: impl Into<Value>) -> Self {
        self.with_field("payload", payload)
    }

    /// Set an arbitrary field. Setting `type` through here is ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// The action's type discriminant.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Shared handle to the type discriminant.
    pub fn kind_arc(&self) -> ActionType {
        self.kind.clone()
    }

    /// Check the action's type.
    pub fn is(&self, kind: &str) -> bool {
        &*self.kind == kind
    }

    /// The conventional `payload` field, if present.
    pub fn payload(&self) -> Option<&Value> {
        self.fields.get("payload")
    }

    /// Look up any additional field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// All additional fields (everything except `type`).
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Convert into the JSON object representation.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.kind.to_string()));
        Value::Object(object)
    }
}

/// Returns `true` if the value is an object carrying a string `type` field.
pub fn is_action(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|object| object.get("type"))
        .is_some_and(Value::is_string)
}

impl TryFrom<Value> for Action {
    type Error = TandemError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err(TandemError::NotAnAction {
                reason: "expected a JSON object".into(),
            });
        };
        match fields.remove("type") {
            Some(Value::String(kind)) => Ok(Self {
                kind: Arc::from(kind),
                fields,
            }),
            Some(_) => Err(TandemError::NotAnAction {
                reason: "`type` must be a string".into(),
            }),
            None => Err(TandemError::NotAnAction {
                reason: "missing `type` field".into(),
            }),
        }
    }
}

impl From<Action> for Value {
    fn from(action: Action) -> Self {
        let mut object = action.fields;
        object.insert("type".to_string(), Value::String(action.kind.to_string()));
        Value::Object(object)
    }
}

impl Serialize for Action {
    fn serialize<Se: Serializer>(&self, serializer: Se) -> Result<Se::Ok, Se::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        let value = Value::deserialize(deserializer)?;
        Action::try_from(value).map_err(De::Error::custom)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            f.debug_struct("Action").field("type", &self.kind).finish()
        } else {
            f.debug_struct("Action")
                .field("type", &self.kind)
                .field("fields", &self.fields)
                .finish()
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// Match actions of exactly one type.
pub fn of_type(kind: impl AsRef<str>) -> impl Fn(&Action) -> bool + Clone + Send + Sync + 'static {
    let kind: ActionType = Arc::from(kind.as_ref());
    move |action: &Action| action.kind == kind
}

/// Match actions whose type is any of `kinds`.
pub fn of_types<I, K>(kinds: I) -> impl Fn(&Action) -> bool + Clone + Send + Sync + 'static
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let kinds: Arc<[ActionType]> = kinds
        .into_iter()
        .map(|k| Arc::from(k.as_ref()))
        .collect();
    move |action: &Action| kinds.iter().any(|k| *k == action.kind)
}

/// Match every action.
pub fn any_action(_: &Action) -> bool {
    true
}

// =============================================================================
// Take
// =============================================================================

/// The unit flowing through the dispatch channel.
///
/// A `Chunk` is dispatched to the host action by action, in order. `End` marks
/// the end of one producer's output and does not stop the drain loop. `Fail`
/// carries a producer's failure and is fatal to the drain loop.
#[derive(Debug, Clone)]
pub enum Take {
    /// Actions to dispatch, in order.
    Chunk(SmallVec<[Action; 1]>),
    /// One producer finished.
    End,
    /// One producer failed.
    Fail(Arc<str>),
}

impl Take {
    /// A single-action take.
    pub fn of(action: Action) -> Self {
        let mut chunk = SmallVec::new();
        chunk.push(action);
        Take::Chunk(chunk)
    }

    /// A take holding several actions that are dispatched back to back.
    pub fn chunk(actions: impl IntoIterator<Item = Action>) -> Self {
        Take::Chunk(actions.into_iter().collect())
    }

    /// Number of actions carried by this take.
    pub fn len(&self) -> usize {
        match self {
            Take::Chunk(actions) => actions.len(),
            Take::End | Take::Fail(_) => 0,
        }
    }

    /// Whether the take carries no actions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Bridge ID
// =============================================================================

/// Identifies one bridge instance in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId(Uuid);

impl BridgeId {
    /// Create a new random bridge ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for BridgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
