//! Entity model
//!
//! An entity is the model-level object on whose behalf a task runs. The
//! kernel never looks inside it; it only asks for names when attributing
//! events in records and traces.

use std::fmt;
use std::sync::Arc;

/// Model object that requests waits and owns tasks
///
/// Implemented by the modeling layer. Only naming is required.
pub trait Entity: Send + Sync {
    /// Display name used in event records
    fn name(&self) -> &str;

    /// Name as written in the model input (defaults to `name`)
    fn input_name(&self) -> &str {
        self.name()
    }

    /// Short type name used to build `Entity.method` labels
    fn type_name(&self) -> &str {
        "Entity"
    }
}

/// Shared reference to an entity
pub type EntityRef = Arc<dyn Entity>;

impl fmt::Debug for dyn Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.name())
    }
}

/// Minimal entity identified by name only
///
/// # Example
/// ```
/// use sim_kernel_core::{Entity, NamedEntity};
///
/// let server = NamedEntity::new("Server1").with_type_name("Server");
/// assert_eq!(server.name(), "Server1");
/// assert_eq!(server.type_name(), "Server");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedEntity {
    name: String,
    input_name: Option<String>,
    type_name: String,
}

impl NamedEntity {
    /// Create an entity with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_name: None,
            type_name: "Entity".to_string(),
        }
    }

    /// Create an entity and wrap it in a shared reference
    pub fn shared(name: impl Into<String>) -> EntityRef {
        Arc::new(Self::new(name))
    }

    /// Set the name used in the model input
    pub fn with_input_name(mut self, input_name: impl Into<String>) -> Self {
        self.input_name = Some(input_name.into());
        self
    }

    /// Set the type name used in `Entity.method` labels
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Wrap in a shared reference
    pub fn into_ref(self) -> EntityRef {
        Arc::new(self)
    }
}

impl Entity for NamedEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_name(&self) -> &str {
        self.input_name.as_deref().unwrap_or(&self.name)
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }
}
