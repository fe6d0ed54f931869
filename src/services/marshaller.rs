// Marshaller registry
//
// Structured cache values are encoded by pluggable marshallers, one per
// protobuf message type. All connections of a data source share a single
// SerializationContext; each connection registers through its own
// MarshallerProvider view so closing the connection drops exactly the
// marshallers it added.

use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::Document;

#[derive(Debug, Error)]
pub enum MarshallerError {
    #[error("A marshaller for type '{0}' is already registered")]
    Duplicate(String),

    #[error("Failed to encode '{type_name}': {source}")]
    Encode {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode '{type_name}': {reason}")]
    Decode { type_name: String, reason: String },
}

/// Encoder/decoder for one structured value type
pub trait Marshaller: Send + Sync {
    /// Fully qualified message name this marshaller handles
    fn type_name(&self) -> &str;

    /// Native value type produced by `decode`
    fn native_type(&self) -> TypeId {
        TypeId::of::<Document>()
    }

    fn encode(&self, document: &Document) -> Result<Vec<u8>, MarshallerError>;

    fn decode(&self, bytes: &[u8]) -> Result<Document, MarshallerError>;
}

/// Encodes documents as JSON objects
///
/// Used for every type that has no marshaller registered.
#[derive(Debug, Clone)]
pub struct JsonMarshaller {
    type_name: String,
}

impl JsonMarshaller {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl Marshaller for JsonMarshaller {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn encode(&self, document: &Document) -> Result<Vec<u8>, MarshallerError> {
        serde_json::to_vec(document.fields()).map_err(|source| MarshallerError::Encode {
            type_name: self.type_name.clone(),
            source,
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document, MarshallerError> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => Ok(Document::from_fields(&self.type_name, fields)),
            Ok(other) => Err(MarshallerError::Decode {
                type_name: self.type_name.clone(),
                reason: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
            Err(e) => Err(MarshallerError::Decode {
                type_name: self.type_name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Envelope stored in the cache for every structured value
///
/// The type name routes the payload to the right marshaller and lets table
/// scans pick out entries of one message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub type_name: String,
    pub payload: Vec<u8>,
}

impl WrappedMessage {
    pub fn wrap(marshaller: &dyn Marshaller, document: &Document) -> Result<Self, MarshallerError> {
        Ok(Self {
            type_name: marshaller.type_name().to_string(),
            payload: marshaller.encode(document)?,
        })
    }
}

/// Identity of one registered provider view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

#[derive(Clone)]
struct Registration {
    owner: ProviderId,
    marshaller: Arc<dyn Marshaller>,
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Registration>,
    by_type: HashMap<TypeId, Registration>,
}

impl Registry {
    /// Point `native_type` at a remaining marshaller for it, or drop the entry
    ///
    /// The lowest type name wins so the lookup does not depend on map order.
    fn reassign_native_type(&mut self, native_type: TypeId) {
        let next = self
            .by_name
            .iter()
            .filter(|(_, r)| r.marshaller.native_type() == native_type)
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, r)| r.clone());
        match next {
            Some(registration) => {
                self.by_type.insert(native_type, registration);
            }
            None => {
                self.by_type.remove(&native_type);
            }
        }
    }
}

/// Shared marshaller registry for one data source
///
/// Holds at most one marshaller per type name. Registration is an atomic
/// check-then-insert: a second marshaller for a registered type name is
/// rejected, whichever connection it comes from.
#[derive(Default)]
pub struct SerializationContext {
    registry: Mutex<Registry>,
    next_provider: AtomicU64,
}

impl SerializationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider view that registers into this context
    pub fn register_marshaller_provider(self: &Arc<Self>) -> MarshallerProvider {
        let id = ProviderId(self.next_provider.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Registered marshaller provider {:?}", id);
        MarshallerProvider {
            id,
            ctx: Arc::clone(self),
        }
    }

    /// Drop every marshaller the provider registered
    ///
    /// Returns the number of type names released.
    pub fn unregister_marshaller_provider(&self, provider: &MarshallerProvider) -> usize {
        let mut registry = self.lock();
        let before = registry.by_name.len();
        registry.by_name.retain(|_, r| r.owner != provider.id);
        let orphaned: Vec<TypeId> = registry
            .by_type
            .iter()
            .filter(|(_, r)| r.owner == provider.id)
            .map(|(native_type, _)| *native_type)
            .collect();
        for native_type in orphaned {
            registry.reassign_native_type(native_type);
        }
        let released = before - registry.by_name.len();
        tracing::debug!(
            "Unregistered marshaller provider {:?} ({} marshallers released)",
            provider.id,
            released
        );
        released
    }

    pub fn marshaller(&self, type_name: &str) -> Option<Arc<dyn Marshaller>> {
        self.lock()
            .by_name
            .get(type_name)
            .map(|r| Arc::clone(&r.marshaller))
    }

    pub fn marshaller_for_type(&self, native_type: TypeId) -> Option<Arc<dyn Marshaller>> {
        self.lock()
            .by_type
            .get(&native_type)
            .map(|r| Arc::clone(&r.marshaller))
    }

    /// Registered type names, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    fn insert(&self, owner: ProviderId, marshaller: Arc<dyn Marshaller>) -> Result<(), MarshallerError> {
        let mut registry = self.lock();
        let registration = Registration { owner, marshaller };
        match registry.by_name.entry(registration.marshaller.type_name().to_string()) {
            Entry::Occupied(occupied) => Err(MarshallerError::Duplicate(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(registration.clone());
                registry
                    .by_type
                    .entry(registration.marshaller.native_type())
                    .or_insert(registration);
                Ok(())
            }
        }
    }

    fn remove(&self, owner: ProviderId, marshaller: &Arc<dyn Marshaller>) -> bool {
        let mut registry = self.lock();
        let same = |r: &Registration| {
            r.owner == owner && std::ptr::addr_eq(Arc::as_ptr(&r.marshaller), Arc::as_ptr(marshaller))
        };

        let removed = match registry.by_name.get(marshaller.type_name()) {
            Some(r) if same(r) => registry.by_name.remove(marshaller.type_name()).is_some(),
            _ => false,
        };
        if registry.by_type.get(&marshaller.native_type()).is_some_and(same) {
            registry.reassign_native_type(marshaller.native_type());
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One connection's view into a shared [`SerializationContext`]
pub struct MarshallerProvider {
    id: ProviderId,
    ctx: Arc<SerializationContext>,
}

impl MarshallerProvider {
    pub fn id(&self) -> ProviderId {
        self.id
    }

    /// # Errors
    /// `MarshallerError::Duplicate` if any view already registered the type name.
    pub fn register(&self, marshaller: Arc<dyn Marshaller>) -> Result<(), MarshallerError> {
        let type_name = marshaller.type_name().to_string();
        self.ctx.insert(self.id, marshaller)?;
        tracing::debug!("Registered marshaller for '{}' on provider {:?}", type_name, self.id);
        Ok(())
    }

    /// Remove a marshaller this view registered; returns false if it was not registered here
    pub fn unregister(&self, marshaller: &Arc<dyn Marshaller>) -> bool {
        self.ctx.remove(self.id, marshaller)
    }

    pub fn marshaller(&self, type_name: &str) -> Option<Arc<dyn Marshaller>> {
        self.ctx.marshaller(type_name)
    }
}
