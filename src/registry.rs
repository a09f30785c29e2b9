// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Type registry: stable string keys for entity types.
//!
//! Producers and consumers agree on a key per entity type instead of sharing
//! a schema service. The key travels in every
//! [`MutationEnvelope`](crate::envelope::MutationEnvelope); the consumer looks
//! it up here to find out how to decode the payload and where to store it.
//!
//! The registry is built once during start-up and then frozen:
//!
//! ```rust
//! use mutation_relay::registry::{Entity, TypeRegistry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User { id: u64, name: String }
//!
//! impl Entity for User {
//!     fn table_name() -> &'static str { "users" }
//!     fn registry_key() -> String { "model.User".into() }
//!     fn identity(&self) -> Option<u64> { Some(self.id) }
//!     fn set_identity(&mut self, id: u64) { self.id = id; }
//! }
//!
//! let registry = TypeRegistry::builder().register::<User>().build();
//! assert!(registry.lookup("model.User").is_some());
//! assert_eq!(registry.key_of::<User>().as_deref(), Some("model.User"));
//! ```
//!
//! After `build()` nothing can be added, so lookups need no locking and the
//! registry is shared as `Arc<TypeRegistry>`.

use crate::error::{RelayError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// A persisted, replicable entity type.
///
/// `identity` is the capability the capture hook and replayer rely on: an
/// entity without a primary key (`None`) is published and replayed as-is,
/// an entity whose key is `Some(0)` is treated as "not yet assigned".
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table the entity is stored in.
    fn table_name() -> &'static str
    where
        Self: Sized;

    /// Registry key for this type.
    ///
    /// Defaults to the last two path segments of the Rust type name
    /// (`my_app::model::User` becomes `model.User`). Override it when the
    /// type may move between modules or crates.
    fn registry_key() -> String
    where
        Self: Sized,
    {
        derive_key(std::any::type_name::<Self>())
    }

    /// Primary key value, if the type has one.
    fn identity(&self) -> Option<u64> {
        None
    }

    /// Write back a store-assigned primary key.
    fn set_identity(&mut self, _id: u64) {}
}

/// Derive a registry key from a Rust type name.
///
/// Leading reference markers are stripped, generic arguments are ignored,
/// and the last two `::` segments are joined with `.`.
pub fn derive_key(type_name: &str) -> String {
    let mut name = type_name.trim();
    loop {
        let stripped = name
            .strip_prefix('&')
            .or_else(|| name.strip_prefix("mut "))
            .or_else(|| name.strip_prefix("*const "))
            .or_else(|| name.strip_prefix("*mut "))
            .map(str::trim_start);
        match stripped {
            Some(rest) => name = rest,
            None => break,
        }
    }

    let path = name.split('<').next().unwrap_or(name);
    let segments: Vec<&str> = path.split("::").filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 => String::new(),
        1 => segments[0].to_string(),
        n => format!("{}.{}", segments[n - 2], segments[n - 1]),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Type erasure
// ═══════════════════════════════════════════════════════════════════════════════

/// Object-safe view of an [`Entity`] value.
pub trait ErasedEntity: Send + Sync + 'static {
    fn table_name(&self) -> &'static str;
    fn identity(&self) -> Option<u64>;
    fn set_identity(&mut self, id: u64);
    fn to_json(&self) -> Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Entity> ErasedEntity for T {
    fn table_name(&self) -> &'static str {
        <T as Entity>::table_name()
    }

    fn identity(&self) -> Option<u64> {
        Entity::identity(self)
    }

    fn set_identity(&mut self, id: u64) {
        Entity::set_identity(self, id)
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn ErasedEntity {
    /// Runtime type of the concrete entity.
    pub fn entity_type_id(&self) -> TypeId {
        self.as_any().type_id()
    }

    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: Entity>(self: Box<Self>) -> Option<T> {
        self.into_any().downcast::<T>().ok().map(|b| *b)
    }
}

/// Knows how to turn payload bytes into a fresh instance of one entity type.
pub trait EntityDescriptor: Send + Sync {
    fn key(&self) -> &str;
    fn table_name(&self) -> &'static str;
    fn entity_type_id(&self) -> TypeId;
    fn decode(&self, payload: &[u8]) -> Result<Box<dyn ErasedEntity>>;
}

struct TypedDescriptor<T> {
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityDescriptor for TypedDescriptor<T> {
    fn key(&self) -> &str {
        &self.key
    }

    fn table_name(&self) -> &'static str {
        <T as Entity>::table_name()
    }

    fn entity_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn decode(&self, payload: &[u8]) -> Result<Box<dyn ErasedEntity>> {
        let value: T = serde_json::from_slice(payload)
            .map_err(|e| RelayError::Serialization(format!("{}: {}", self.key, e)))?;
        Ok(Box::new(value))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Collects registrations during start-up.
#[derive(Default)]
pub struct TypeRegistryBuilder {
    by_key: HashMap<String, Arc<dyn EntityDescriptor>>,
    by_type: HashMap<TypeId, String>,
}

impl TypeRegistryBuilder {
    /// Register `T` under its derived (or overridden) key.
    pub fn register<T: Entity>(&mut self) -> &mut Self {
        self.register_as::<T>(T::registry_key())
    }

    /// Register `T` under an explicit key.
    pub fn register_as<T: Entity>(&mut self, key: impl Into<String>) -> &mut Self {
        let key = key.into();
        let descriptor: Arc<dyn EntityDescriptor> = Arc::new(TypedDescriptor::<T> {
            key: key.clone(),
            _marker: PhantomData,
        });

        if let Some(previous) = self.by_key.insert(key.clone(), descriptor) {
            if previous.entity_type_id() != TypeId::of::<T>() {
                warn!(key = %key, type_name = std::any::type_name::<T>(), "Registry key re-registered with a different type");
                self.by_type.remove(&previous.entity_type_id());
            }
        }
        if let Some(old_key) = self.by_type.insert(TypeId::of::<T>(), key.clone()) {
            if old_key != key {
                self.by_key.remove(&old_key);
            }
        }

        debug!(key = %key, table = <T as Entity>::table_name(), "Registered entity type");
        self
    }

    pub fn build(&mut self) -> TypeRegistry {
        TypeRegistry {
            by_key: std::mem::take(&mut self.by_key),
            by_type: std::mem::take(&mut self.by_type),
        }
    }
}

/// Immutable key ⇄ type mapping.
pub struct TypeRegistry {
    by_key: HashMap<String, Arc<dyn EntityDescriptor>>,
    by_type: HashMap<TypeId, String>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Descriptor for a key, or `None` if nothing is registered under it.
    pub fn lookup(&self, key: &str) -> Option<Arc<dyn EntityDescriptor>> {
        self.by_key.get(key).cloned()
    }

    /// Key registered for `T`.
    pub fn key_of<T: Entity>(&self) -> Option<String> {
        self.by_type.get(&TypeId::of::<T>()).cloned()
    }

    /// Key registered for the runtime type of an erased entity.
    pub fn key_for(&self, entity: &dyn ErasedEntity) -> Option<String> {
        self.by_type.get(&entity.entity_type_id()).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    mod model {
        use super::*;

        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        pub struct User {
            pub id: u64,
            pub name: String,
        }

        impl Entity for User {
            fn table_name() -> &'static str {
                "users"
            }
            fn identity(&self) -> Option<u64> {
                Some(self.id)
            }
            fn set_identity(&mut self, id: u64) {
                self.id = id;
            }
        }

        #[derive(Debug, Serialize, Deserialize)]
        pub struct AuditLine {
            pub text: String,
        }

        impl Entity for AuditLine {
            fn table_name() -> &'static str {
                "audit_lines"
            }
            fn registry_key() -> String {
                "audit.Line".into()
            }
        }
    }

    use model::{AuditLine, User};

    #[test]
    fn test_derive_key_last_two_segments() {
        assert_eq!(derive_key("my_app::model::User"), "model.User");
        assert_eq!(derive_key("model::User"), "model.User");
        assert_eq!(derive_key("User"), "User");
    }

    #[test]
    fn test_derive_key_strips_references() {
        assert_eq!(derive_key("&my_app::model::User"), "model.User");
        assert_eq!(derive_key("&mut my_app::model::User"), "model.User");
        assert_eq!(derive_key("&&*const a::b::C"), "b.C");
    }

    #[test]
    fn test_derive_key_ignores_generics() {
        assert_eq!(derive_key("app::wrap::Boxed<app::model::User>"), "wrap.Boxed");
    }

    #[test]
    fn test_default_key_uses_module_path() {
        assert_eq!(User::registry_key(), "model.User");
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TypeRegistry::builder()
            .register::<User>()
            .register::<AuditLine>()
            .build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.keys(), vec!["audit.Line".to_string(), "model.User".to_string()]);

        let descriptor = registry.lookup("model.User").unwrap();
        assert_eq!(descriptor.table_name(), "users");
        assert!(registry.lookup("model.Ghost").is_none());
    }

    #[test]
    fn test_decode_yields_fresh_instance() {
        let registry = TypeRegistry::builder().register::<User>().build();
        let descriptor = registry.lookup("model.User").unwrap();

        let entity = descriptor.decode(br#"{"id":7,"name":"ada"}"#).unwrap();
        assert_eq!(entity.identity(), Some(7));
        assert_eq!(registry.key_for(entity.as_ref()).as_deref(), Some("model.User"));

        let user = entity.downcast::<User>().unwrap();
        assert_eq!(user, User { id: 7, name: "ada".into() });
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let registry = TypeRegistry::builder().register::<User>().build();
        let descriptor = registry.lookup("model.User").unwrap();

        let err = descriptor.decode(b"{not json").err().unwrap();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_reverse_lookup_unregistered_type() {
        let registry = TypeRegistry::builder().register::<User>().build();
        let line: Box<dyn ErasedEntity> = Box::new(AuditLine { text: "x".into() });

        assert!(registry.key_of::<AuditLine>().is_none());
        assert!(registry.key_for(line.as_ref()).is_none());
    }

    #[test]
    fn test_reregister_under_new_key_drops_old_key() {
        let registry = TypeRegistry::builder()
            .register::<User>()
            .register_as::<User>("people.User")
            .build();

        assert!(registry.lookup("model.User").is_none());
        assert!(registry.contains("people.User"));
        assert_eq!(registry.key_of::<User>().as_deref(), Some("people.User"));
    }

    #[test]
    fn test_entity_without_identity() {
        let line = AuditLine { text: "hello".into() };
        assert_eq!(Entity::identity(&line), None);
    }
}
