//! Typed configuration attributes
//!
//! An [`Attribute`] is a named value owned by a device object. Writes go
//! through a single entry point ([`Attribute::set`]) that runs the declared
//! write hooks, and accepted changes are announced synchronously to every
//! subscribed listener in registration order.
//!
//! # Write policy
//!
//! Every attribute declares how a bad write is handled:
//!
//! - [`WritePolicy::Reject`]: the write fails with a configuration error and
//!   the previous value stays in place.
//! - [`WritePolicy::Coerce`]: the value is first replaced by a corrected one
//!   (e.g. a non-square pixel size becomes square) and then validated.
//!
//! # Example
//!
//! ```rust
//! use mb_core::attribute::Attribute;
//!
//! let gain = Attribute::new("scanGain", 1.0_f64).with_range(-10.0, 10.0);
//! let id = gain.subscribe(|value| println!("gain is now {value}"));
//!
//! gain.set(2.5).unwrap();
//! assert!(gain.set(11.0).is_err());
//! assert_eq!(gain.get(), 2.5);
//!
//! gain.unsubscribe(id);
//! ```
//!
//! Clones share the value, the hooks and the listeners.

use crate::error::{AppResult, DaqError};
use crate::listeners::{ListenerId, ListenerSet};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

// =============================================================================
// Type Aliases
// =============================================================================

/// Validating hook: returns an error to reject the value.
pub type Validator<T> = Arc<dyn Fn(&T) -> AppResult<()> + Send + Sync>;

/// Coercing hook: returns the value that will actually be stored.
pub type Coercer<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Bound required on attribute values.
pub trait AttributeValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> AttributeValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

// =============================================================================
// Metadata
// =============================================================================

/// How an attribute reacts to a write it cannot accept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WritePolicy {
    /// Reject with a configuration error, keeping the previous value.
    Reject,
    /// Replace the requested value with a corrected one.
    Coerce,
}

/// Descriptive metadata for an attribute.
#[derive(Debug, Clone, Serialize)]
pub struct AttributeMetadata {
    /// Attribute name (unique within its device).
    pub name: String,
    /// Human readable description.
    pub description: Option<String>,
    /// Physical units (e.g. "s", "m", "V", "rad").
    pub units: Option<String>,
    /// Read-only attributes refuse `set()`; only the owner may `update()`.
    pub read_only: bool,
    /// What happens to out-of-range writes.
    pub policy: WritePolicy,
    /// Lower bound, when the attribute is range constrained.
    pub min_value: Option<serde_json::Value>,
    /// Upper bound, when the attribute is range constrained.
    pub max_value: Option<serde_json::Value>,
}

struct Hooks<T> {
    metadata: AttributeMetadata,
    validators: Vec<Validator<T>>,
    coercer: Option<Coercer<T>>,
}

// =============================================================================
// Attribute<T>
// =============================================================================

/// A named, typed value with write hooks and synchronous listeners.
pub struct Attribute<T: AttributeValue> {
    value: Arc<RwLock<T>>,
    hooks: Arc<RwLock<Hooks<T>>>,
    listeners: Arc<ListenerSet<T>>,
}

impl<T: AttributeValue> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            hooks: Arc::clone(&self.hooks),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T: AttributeValue> Debug for Attribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.read();
        f.debug_struct("Attribute")
            .field("name", &hooks.metadata.name)
            .field("value", &*self.value.read())
            .field("policy", &hooks.metadata.policy)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<T: AttributeValue> Attribute<T> {
    /// Create a new attribute with an initial value and the `Reject` policy.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(initial_value)),
            hooks: Arc::new(RwLock::new(Hooks {
                metadata: AttributeMetadata {
                    name: name.into(),
                    description: None,
                    units: None,
                    read_only: false,
                    policy: WritePolicy::Reject,
                    min_value: None,
                    max_value: None,
                },
                validators: Vec::new(),
                coercer: None,
            })),
            listeners: Arc::new(ListenerSet::new()),
        }
    }

    /// Set the description.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.hooks.write().metadata.description = Some(description.into());
        self
    }

    /// Set the physical units.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.hooks.write().metadata.units = Some(units.into());
        self
    }

    /// Mark this attribute as read-only for everyone but its owner.
    pub fn read_only(self) -> Self {
        self.hooks.write().metadata.read_only = true;
        self
    }

    /// Add a validator. Validators run in the order they were added.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> AppResult<()> + Send + Sync + 'static,
    {
        self.add_validator(validator);
        self
    }

    /// Add a validator to an attribute that is already shared.
    ///
    /// Used for checks that depend on a sibling attribute created later.
    pub fn add_validator<F>(&self, validator: F)
    where
        F: Fn(&T) -> AppResult<()> + Send + Sync + 'static,
    {
        self.hooks.write().validators.push(Arc::new(validator));
    }

    /// Install a coercer and switch the policy to [`WritePolicy::Coerce`].
    pub fn with_coercion<F>(self, coercer: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        {
            let mut hooks = self.hooks.write();
            hooks.coercer = Some(Arc::new(coercer));
            hooks.metadata.policy = WritePolicy::Coerce;
        }
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Attribute name.
    pub fn name(&self) -> String {
        self.hooks.read().metadata.name.clone()
    }

    /// Snapshot of the descriptive metadata.
    pub fn metadata(&self) -> AttributeMetadata {
        self.hooks.read().metadata.clone()
    }

    /// Declared write policy.
    pub fn policy(&self) -> WritePolicy {
        self.hooks.read().metadata.policy
    }

    /// Run the read-only check and every validator without storing.
    pub fn validate(&self, value: &T) -> AppResult<()> {
        let (name, read_only, validators) = {
            let hooks = self.hooks.read();
            (
                hooks.metadata.name.clone(),
                hooks.metadata.read_only,
                hooks.validators.clone(),
            )
        };
        if read_only {
            return Err(DaqError::Configuration(format!(
                "Attribute '{}' is read-only",
                name
            )));
        }
        for validator in &validators {
            validator(value)?;
        }
        Ok(())
    }

    /// Write a new value.
    ///
    /// Returns the value actually stored, which differs from the request
    /// only for coercing attributes. On error the previous value is kept.
    pub fn set(&self, value: T) -> AppResult<T> {
        let coercer = self.hooks.read().coercer.clone();
        let value = match coercer {
            Some(coerce) => {
                let coerced = coerce(value.clone());
                if coerced != value {
                    tracing::warn!(
                        attribute = %self.name(),
                        "Requested value {:?} replaced by {:?}",
                        value,
                        coerced
                    );
                }
                coerced
            }
            None => value,
        };

        self.validate(&value)?;
        self.store(value.clone());
        Ok(value)
    }

    /// Store a value bypassing read-only and validators.
    ///
    /// Reserved for the owning device, e.g. to publish a state change.
    pub fn update(&self, value: T) {
        self.store(value);
    }

    fn store(&self, value: T) {
        let changed = {
            let mut current = self.value.write();
            if *current == value {
                false
            } else {
                *current = value.clone();
                true
            }
        };
        if changed {
            self.listeners.notify(&value);
        }
    }

    /// Register a listener called with every accepted new value.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener)).0
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id).is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Non-owning handle, for cross-attribute checks that must not keep the
    /// other device alive.
    pub fn downgrade(&self) -> WeakAttribute<T> {
        WeakAttribute {
            value: Arc::downgrade(&self.value),
        }
    }

    fn set_bounds(&self, min: serde_json::Value, max: serde_json::Value) {
        let mut hooks = self.hooks.write();
        hooks.metadata.min_value = Some(min);
        hooks.metadata.max_value = Some(max);
    }
}

/// Read access to an attribute without ownership.
#[derive(Clone)]
pub struct WeakAttribute<T> {
    value: Weak<RwLock<T>>,
}

impl<T: Clone> WeakAttribute<T> {
    /// Current value, or `None` once the attribute has been dropped.
    pub fn get(&self) -> Option<T> {
        self.value.upgrade().map(|value| value.read().clone())
    }
}

// =============================================================================
// Range constraints
// =============================================================================

impl<T> Attribute<T>
where
    T: AttributeValue + PartialOrd + Copy + Serialize,
{
    /// Constrain a scalar attribute to `[min, max]` (inclusive).
    pub fn with_range(self, min: T, max: T) -> Self {
        self.set_bounds(json_or_null(&min), json_or_null(&max));
        let name = self.name();
        self.with_validator(move |value: &T| {
            if *value < min || *value > max {
                return Err(DaqError::Configuration(format!(
                    "{}: value {:?} outside range [{:?}, {:?}]",
                    name, value, min, max
                )));
            }
            Ok(())
        })
    }
}

impl<T> Attribute<(T, T)>
where
    T: PartialOrd + Copy + Debug + Serialize + Send + Sync + 'static,
{
    /// Constrain each component of a pair independently.
    pub fn with_pair_range(self, min: (T, T), max: (T, T)) -> Self {
        self.set_bounds(json_or_null(&min), json_or_null(&max));
        let name = self.name();
        self.with_validator(move |value: &(T, T)| {
            let out_x = value.0 < min.0 || value.0 > max.0;
            let out_y = value.1 < min.1 || value.1 > max.1;
            if out_x || out_y {
                return Err(DaqError::Configuration(format!(
                    "{}: value {:?} outside range [{:?}, {:?}]",
                    name, value, min, max
                )));
            }
            Ok(())
        })
    }
}

fn json_or_null<V: Serialize>(value: &V) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// =============================================================================
// JSON access
// =============================================================================

impl<T> Attribute<T>
where
    T: AttributeValue + Serialize + DeserializeOwned,
{
    /// Current value as JSON.
    pub fn get_json(&self) -> AppResult<serde_json::Value> {
        Ok(serde_json::to_value(self.get())?)
    }

    /// Set the value from JSON. Type or arity mismatches are configuration
    /// errors, like any other rejected write.
    pub fn set_json(&self, json_value: serde_json::Value) -> AppResult<()> {
        let value: T = serde_json::from_value(json_value).map_err(|e| {
            DaqError::Configuration(format!(
                "Failed to deserialize attribute '{}': {}. Expected type: {}",
                self.name(),
                e,
                std::any::type_name::<T>()
            ))
        })?;
        self.set(value).map(|_| ())
    }
}

// =============================================================================
// AttributeBase - type-erased access
// =============================================================================

/// Type-erased view of an attribute, for name-based access and for
/// observers that only care that *something* changed.
pub trait AttributeBase: Send + Sync {
    /// Attribute name.
    fn name(&self) -> String;

    /// Descriptive metadata.
    fn metadata(&self) -> AttributeMetadata;

    /// Current value as JSON.
    fn get_json(&self) -> AppResult<serde_json::Value>;

    /// Set from JSON, going through the same checks as a typed `set`.
    fn set_json(&self, value: serde_json::Value) -> AppResult<()>;

    /// Subscribe a callback that ignores the new value.
    fn subscribe_change(&self, callback: Arc<dyn Fn() + Send + Sync>) -> ListenerId;

    /// Remove a listener. Returns false if it was not registered.
    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Number of registered listeners.
    fn listener_count(&self) -> usize;
}

impl<T> AttributeBase for Attribute<T>
where
    T: AttributeValue + Serialize + DeserializeOwned,
{
    fn name(&self) -> String {
        Attribute::name(self)
    }

    fn metadata(&self) -> AttributeMetadata {
        Attribute::metadata(self)
    }

    fn get_json(&self) -> AppResult<serde_json::Value> {
        Attribute::get_json(self)
    }

    fn set_json(&self, value: serde_json::Value) -> AppResult<()> {
        Attribute::set_json(self, value)
    }

    fn subscribe_change(&self, callback: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        self.subscribe(move |_| callback())
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        Attribute::unsubscribe(self, id)
    }

    fn listener_count(&self) -> usize {
        Attribute::listener_count(self)
    }
}

// =============================================================================
// AttributeSet - per-device registry
// =============================================================================

/// Name-indexed collection of a device's attributes.
#[derive(Default)]
pub struct AttributeSet {
    attributes: HashMap<String, Arc<dyn AttributeBase>>,
    order: Vec<String>,
}

impl std::fmt::Debug for AttributeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeSet")
            .field("names", &self.order)
            .finish()
    }
}

impl AttributeSet {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute (usually a clone sharing the owner's state).
    pub fn register<A>(&mut self, attribute: A)
    where
        A: AttributeBase + 'static,
    {
        let name = attribute.name();
        if self.attributes.insert(name.clone(), Arc::new(attribute)).is_none() {
            self.order.push(name);
        }
    }

    /// Look up an attribute by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AttributeBase>> {
        self.attributes.get(name).cloned()
    }

    /// Attribute names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Apply a batch of JSON values by name, stopping at the first failure.
    pub fn apply_json<'a, I>(&self, values: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (&'a String, &'a serde_json::Value)>,
    {
        for (name, value) in values {
            let attribute = self.get(name).ok_or_else(|| {
                DaqError::Configuration(format!("Unknown attribute '{}'", name))
            })?;
            attribute.set_json(value.clone())?;
        }
        Ok(())
    }
}
