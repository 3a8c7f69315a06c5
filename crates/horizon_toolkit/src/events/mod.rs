//! # Event notification
//!
//! The toolkit only needs one thing from the host's event system: a way to
//! register interest in a notification kind and get typed notifications
//! back. That seam is the [`NotificationSource`] trait, generic over the kind
//! identifier `K` the host uses.
//!
//! [`EventBus`] is the bundled in-process implementation. Events travel as
//! JSON bytes, the same wire shape the host uses between plugins, and every
//! handler decodes the payload into the type it expects.

mod bus;

pub use bus::{EventBus, EventBusStats};

use crate::error::EventError;
use compact_str::CompactString;
use serde::{de::DeserializeOwned, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;

/// Core trait that all events must implement.
///
/// Implemented automatically for every `Serialize + DeserializeOwned` type
/// that is `Send + Sync + Debug + 'static`.
pub trait Event: Send + Sync + Any + fmt::Debug {
    /// Returns the type name of this event for debugging and routing.
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// Serializes the event to bytes.
    fn serialize(&self) -> Result<Vec<u8>, EventError>;

    /// Deserializes an event from bytes.
    fn deserialize(data: &[u8]) -> Result<Self, EventError>
    where
        Self: Sized;

    fn as_any(&self) -> &dyn Any;
}

impl<T> Event for T
where
    T: Serialize + DeserializeOwned + Send + Sync + Any + fmt::Debug + 'static,
{
    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn serialize(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| {
            tracing::error!(
                "🔴 Event serialization failed for type '{}': {} (event debug: {:?})",
                Self::type_name(),
                e,
                self
            );
            EventError::Serialization(e)
        })
    }

    fn deserialize(data: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(data).map_err(EventError::Deserialization)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Receives serialized events for one registration.
pub trait EventHandler: Send + Sync {
    fn handle(&self, data: &[u8]) -> Result<(), EventError>;

    fn expected_type_id(&self) -> TypeId;

    fn handler_name(&self) -> &str;
}

/// Adapts a typed callback to [`EventHandler`].
///
/// Payloads that do not decode as `T` are a type mismatch between emitter and
/// listener; they are logged and skipped rather than treated as failures.
pub struct TypedEventHandler<T, F> {
    handler: F,
    name: String,
    _phantom: PhantomData<fn(T)>,
}

impl<T, F> TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            handler,
            name: name.into(),
            _phantom: PhantomData,
        }
    }
}

impl<T, F> EventHandler for TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
{
    fn handle(&self, data: &[u8]) -> Result<(), EventError> {
        match T::deserialize(data) {
            Ok(event) => (self.handler)(event),
            Err(e) => {
                log_type_mismatch(&self.name, std::any::type_name::<T>(), data, &e);
                Ok(())
            }
        }
    }

    fn expected_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

pub(crate) fn log_type_mismatch(name: &str, expected_type: &str, data: &[u8], error: &EventError) {
    let data_preview = if data.len() > 100 {
        format!(
            "{}... ({} more bytes)",
            String::from_utf8_lossy(&data[..100]),
            data.len() - 100
        )
    } else {
        String::from_utf8_lossy(data).to_string()
    };

    tracing::warn!(
        "🟡 EventHandler '{}' (expects type '{}'): Deserialization failed - {}. Data preview: '{}'. The handler will be skipped.",
        name,
        expected_type,
        error,
        data_preview
    );
}

/// Identifies one registration with a notification source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Where subscriptions come from.
///
/// `register` adds a handler for one notification kind and returns its id;
/// `unregister` removes it and reports whether it was still registered. The
/// source must tolerate `unregister` being called from inside a handler
/// while a notification is being delivered.
pub trait NotificationSource<K>: Send + Sync {
    fn register(&self, kind: K, handler: std::sync::Arc<dyn EventHandler>) -> Result<HandlerId, EventError>;

    fn unregister(&self, kind: &K, id: HandlerId) -> bool;
}

/// Key for a host-level event, e.g. `core:player_connected`.
pub fn core_key(event_name: &str) -> CompactString {
    CompactString::new_inline("core:") + event_name
}

/// Key for an event owned by a plugin, e.g. `plugin:greeter:greeted`.
pub fn plugin_key(plugin_name: &str, event_name: &str) -> CompactString {
    let mut key = CompactString::new_inline("plugin:");
    key.push_str(plugin_name);
    key.push(':');
    key.push_str(event_name);
    key
}
