//! Component registry.
//!
//! Holds every registered component that is not currently owned by a
//! run-set, remembers which ids are allocated, and keeps the census that
//! accounts for every component ever registered:
//!
//! ```text
//! free + allocated == registered - unregistered - quarantined
//! ```

use crate::component::{
    ComponentClient, ComponentDescriptor, ComponentId, ComponentRegistration,
    ComponentSnapshot, ComponentSpec, RegisteredComponent, Role,
};
use crate::error::{CncError, CncResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Census {
    pub registered: u64,
    pub unregistered: u64,
    pub quarantined: u64,
    pub free: u64,
    pub allocated: u64,
}

impl Census {
    pub fn is_conserved(&self) -> bool {
        self.free + self.allocated + self.unregistered + self.quarantined == self.registered
    }
}

/// Result of a successful allocation.
#[derive(Debug)]
pub struct Allocation {
    pub components: Vec<RegisteredComponent>,
    /// Requested components that were not available. Empty when strict.
    pub missing: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    free: BTreeMap<ComponentId, RegisteredComponent>,
    allocated: HashMap<ComponentId, ComponentDescriptor>,
    /// Allocated ids unregistered while in use; dropped when returned.
    retired: HashSet<ComponentId>,
    next_id: u32,
    registered: u64,
    unregistered: u64,
    quarantined: u64,
}

impl RegistryInner {
    fn descriptors(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.free
            .values()
            .map(RegisteredComponent::descriptor)
            .chain(self.allocated.values())
    }
}

#[derive(Default)]
pub struct ComponentRegistry {
    inner: RwLock<RegistryInner>,
}

fn validate(registration: &ComponentRegistration) -> CncResult<()> {
    if registration.name.trim().is_empty() {
        return Err(CncError::InvalidDescriptor(
            "component name is empty".to_string(),
        ));
    }
    if registration.name.contains('#') {
        return Err(CncError::InvalidDescriptor(format!(
            "component name '{}' contains '#'",
            registration.name
        )));
    }
    let role = Role::from_name(&registration.name);
    if registration.connectors.is_empty() && !matches!(role, Role::Source | Role::Builder) {
        return Err(CncError::InvalidDescriptor(format!(
            "{} has no connectors",
            registration.name
        )));
    }
    if let Some(conn) = registration
        .connectors
        .iter()
        .find(|c| c.direction.is_input() && c.port.is_none())
    {
        return Err(CncError::InvalidDescriptor(format!(
            "{} input '{}' has no port",
            registration.name, conn.conn_type
        )));
    }
    Ok(())
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component, assigning it a fresh id.
    ///
    /// Re-registration of a known name and instance at a different address
    /// replaces the stale entry.
    pub fn register(
        &self,
        registration: ComponentRegistration,
        client: Arc<dyn ComponentClient>,
    ) -> CncResult<ComponentDescriptor> {
        validate(&registration)?;

        let mut inner = self.inner.write();
        let stale: Vec<(ComponentId, bool)> = inner
            .descriptors()
            .filter(|d| d.name == registration.name && d.num == registration.num)
            .map(|d| {
                let same_address =
                    d.host == registration.host && d.cmd_port == registration.cmd_port;
                (d.id, same_address)
            })
            .collect();

        if stale.iter().any(|(_, same_address)| *same_address) {
            return Err(CncError::DuplicateInstance {
                name: registration.name,
                num: registration.num,
                host: registration.host,
                port: registration.cmd_port,
            });
        }
        for (id, _) in stale {
            warn!(
                "{}#{} re-registered from a new address, dropping component {}",
                registration.name, registration.num, id
            );
            if inner.free.remove(&id).is_some() {
                inner.unregistered += 1;
            } else {
                inner.retired.insert(id);
            }
        }

        inner.next_id += 1;
        let id = ComponentId(inner.next_id);
        let descriptor = ComponentDescriptor::new(id, registration);
        inner
            .free
            .insert(id, RegisteredComponent::new(descriptor.clone(), client));
        inner.registered += 1;
        info!("Registered {}", descriptor);
        Ok(descriptor)
    }

    /// Removes a component. Unknown ids are ignored; an allocated component
    /// is dropped when its run-set returns it.
    pub fn unregister(&self, id: ComponentId) {
        let mut inner = self.inner.write();
        if inner.free.remove(&id).is_some() {
            inner.unregistered += 1;
            info!("Unregistered component {}", id);
        } else if inner.allocated.contains_key(&id) {
            inner.retired.insert(id);
            info!("Component {} will be unregistered when released", id);
        }
    }

    /// Free components, ordered by id.
    pub fn list(&self) -> Vec<ComponentSnapshot> {
        self.inner
            .read()
            .free
            .values()
            .map(RegisteredComponent::snapshot)
            .collect()
    }

    pub fn get(&self, id: ComponentId) -> Option<ComponentDescriptor> {
        let inner = self.inner.read();
        inner
            .free
            .get(&id)
            .map(|c| c.descriptor().clone())
            .or_else(|| inner.allocated.get(&id).cloned())
    }

    pub fn is_allocated(&self, id: ComponentId) -> bool {
        self.inner.read().allocated.contains_key(&id)
    }

    /// Takes the requested components out of the free pool.
    ///
    /// When `strict` is set and any is unavailable, nothing is taken and the
    /// missing names are returned as [`CncError::IncompleteRunSet`].
    pub fn allocate(&self, specs: &[ComponentSpec], strict: bool) -> CncResult<Allocation> {
        let mut inner = self.inner.write();
        let mut chosen: Vec<ComponentId> = Vec::with_capacity(specs.len());
        let mut missing = Vec::new();
        for spec in specs {
            let found = inner
                .free
                .values()
                .find(|c| c.descriptor().matches(spec) && !chosen.contains(&c.id()))
                .map(RegisteredComponent::id);
            match found {
                Some(id) => chosen.push(id),
                None => missing.push(spec.to_string()),
            }
        }

        if !missing.is_empty() && (strict || chosen.is_empty()) {
            return Err(CncError::IncompleteRunSet { missing });
        }

        let mut components = Vec::with_capacity(chosen.len());
        for id in chosen {
            if let Some(component) = inner.free.remove(&id) {
                inner.allocated.insert(id, component.descriptor().clone());
                components.push(component);
            }
        }
        Ok(Allocation {
            components,
            missing,
        })
    }

    /// Gives components back to the free pool after a successful reset.
    pub fn return_components(&self, components: Vec<RegisteredComponent>) {
        let mut inner = self.inner.write();
        for mut component in components {
            let id = component.id();
            if inner.allocated.remove(&id).is_none() {
                warn!("Component {} returned but was not allocated", id);
                continue;
            }
            if inner.retired.remove(&id) {
                inner.unregistered += 1;
                info!("Dropped retired component {}", id);
                continue;
            }
            component.set_order(0);
            inner.free.insert(id, component);
        }
    }

    /// Removes components that failed to reset. They must re-register.
    pub fn quarantine(&self, components: Vec<RegisteredComponent>) {
        let mut inner = self.inner.write();
        for component in components {
            let id = component.id();
            if inner.allocated.remove(&id).is_none() {
                continue;
            }
            if inner.retired.remove(&id) {
                inner.unregistered += 1;
            } else {
                inner.quarantined += 1;
                warn!("Quarantined {}", component.descriptor());
            }
        }
    }

    pub fn census(&self) -> Census {
        let inner = self.inner.read();
        Census {
            registered: inner.registered,
            unregistered: inner.unregistered,
            quarantined: inner.quarantined,
            free: inner.free.len() as u64,
            allocated: inner.allocated.len() as u64,
        }
    }
}
