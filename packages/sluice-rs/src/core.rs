//! Core value types for the sluice state container.
//!
//! # Overview
//!
//! Every value that enters the pipeline is an [`Action`]: a Flux Standard
//! Action with a `type` discriminator, an optional `payload`, optional `meta`
//! and an optional `error` flag. Actions are immutable once created and
//! compare structurally.
//!
//! The pipeline wraps each dispatched action in an [`ActionContext`] that
//! carries a [`CorrelationId`] and the dispatch timestamp. The context lives
//! only for the duration of one pass through the middleware chain.
//!
//! # Wire shape
//!
//! ```text
//! { "type": "Increment", "payload": 1, "meta": { "correlationId": "..." }, "error": true }
//! ```
//!
//! `payload`, `meta` and `error` are omitted when absent.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreError;

/// Action type recognised by the store as a wholesale slice override.
pub const HYDRATE: &str = "@@sluice/HYDRATE";

/// Meta field used to carry a correlation id across dispatches.
pub const CORRELATION_META_KEY: &str = "correlationId";

/// An immutable description of an intent to change state.
///
/// # Example
///
/// ```ignore
/// use sluice::Action;
///
/// let action = Action::new("todos/add").with_payload(&Todo { id: 1, title: "ship".into() })?;
/// let todo: Todo = action.payload_as()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    error: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl Action {
    /// Create an action with only a type discriminator.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
            meta: None,
            error: false,
        }
    }

    /// Attach a serializable payload.
    pub fn with_payload<T: Serialize + ?Sized>(self, payload: &T) -> Result<Self, StoreError> {
        let value = serde_json::to_value(payload).map_err(|source| StoreError::InvalidPayload {
            action_type: self.action_type.clone(),
            source,
        })?;
        Ok(self.with_payload_value(value))
    }

    /// Attach an already-built JSON payload.
    pub fn with_payload_value(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Replace the metadata.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Set a single metadata field.
    ///
    /// Creates an object when no metadata is present. Metadata that exists but
    /// is not an object is left untouched.
    pub fn with_meta_field(mut self, key: &str, value: Value) -> Self {
        match self.meta {
            None => {
                let mut fields = Map::new();
                fields.insert(key.to_string(), value);
                self.meta = Some(Value::Object(fields));
            }
            Some(Value::Object(ref mut fields)) => {
                fields.insert(key.to_string(), value);
            }
            Some(_) => {}
        }
        self
    }

    /// Mark this action as describing a failure.
    pub fn as_error(mut self) -> Self {
        self.error = true;
        self
    }

    /// The type discriminator.
    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Returns true if this action's type equals `action_type`.
    pub fn is(&self, action_type: &str) -> bool {
        self.action_type == action_type
    }

    /// The raw payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Deserialize the payload into `T`.
    ///
    /// A missing payload deserializes from `null`, so `Option<T>` and unit
    /// types work for payload-less actions.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|source| StoreError::InvalidPayload {
            action_type: self.action_type.clone(),
            source,
        })
    }

    /// The raw metadata, if any.
    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Look up a single metadata field.
    pub fn meta_field(&self, key: &str) -> Option<&Value> {
        self.meta.as_ref().and_then(|meta| meta.get(key))
    }

    /// Returns true if the error flag is set.
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Stamp a correlation id into metadata.
    pub fn with_correlation(self, cid: CorrelationId) -> Self {
        self.with_meta_field(CORRELATION_META_KEY, Value::String(cid.to_string()))
    }

    /// Correlation id carried in metadata, if a valid one is present.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.meta_field(CORRELATION_META_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.action_type)
    }
}

/// Correlation ID for tracing one action's journey through the pipeline.
///
/// Use `CorrelationId::NONE` for uncorrelated work, or `CorrelationId::new()`
/// to generate a fresh ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated work (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One action's envelope while it travels through the middleware chain.
///
/// Created once per dispatch by the pipeline and discarded after the
/// after-reduce phase. Middleware may swap the action (keeping the
/// correlation id and timestamp) via [`ActionContext::with_action`].
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The action being dispatched.
    pub action: Action,
    /// Correlation ID for this dispatch.
    pub cid: CorrelationId,
    /// When the action entered the pipeline.
    pub dispatched_at: DateTime<Utc>,
}

impl ActionContext {
    /// Wrap an action with a fresh correlation ID and the current time.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            cid: CorrelationId::new(),
            dispatched_at: Utc::now(),
        }
    }

    /// Replace the action, keeping correlation and timestamp.
    pub fn with_action(self, action: Action) -> Self {
        Self { action, ..self }
    }

    /// Shorthand for `self.action.action_type()`.
    pub fn action_type(&self) -> &str {
        self.action.action_type()
    }
}

/// Payload of a [`HYDRATE`] action.
///
/// Wire shape: `{ "sliceKey": "todos", "state": <any> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hydrate {
    /// Key of the slice to override.
    pub slice_key: String,
    /// Replacement state, in the slice's serialized form.
    pub state: Value,
}

impl Hydrate {
    /// Build a hydration request from a raw JSON state.
    pub fn new(slice_key: impl Into<String>, state: Value) -> Self {
        Self {
            slice_key: slice_key.into(),
            state,
        }
    }

    /// Build a hydration request from a typed state value.
    pub fn from_state<S: Serialize>(slice_key: impl Into<String>, state: &S) -> Result<Self, StoreError> {
        let state = serde_json::to_value(state).map_err(|source| StoreError::InvalidPayload {
            action_type: HYDRATE.to_string(),
            source,
        })?;
        Ok(Self::new(slice_key, state))
    }

    /// Wrap into a dispatchable action.
    pub fn into_action(self) -> Action {
        let slice_key = self.slice_key;
        let mut fields = Map::new();
        fields.insert("sliceKey".to_string(), Value::String(slice_key));
        fields.insert("state".to_string(), self.state);
        Action::new(HYDRATE).with_payload_value(Value::Object(fields))
    }
}
