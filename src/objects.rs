//! Per-session object id table.
//!
//! Maps the object ids live on one connection to the interface they were
//! created with, so later messages addressed to them can be decoded. An id
//! whose interface could not be resolved is still tracked: it occupies the
//! id but decodes as unknown.

use std::collections::HashMap;

use thiserror::Error;

use crate::schema::InterfaceId;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ObjectError {
    #[error("object id {0} already in use")]
    IdInUse(u32),
}

#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: HashMap<u32, Option<InterfaceId>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` without assigning an interface yet.
    ///
    /// Only ids bound to a resolved interface are in use. An unresolved
    /// object never has its destructor decoded, so its id is handed out
    /// again without error.
    pub fn reserve(&mut self, id: u32) -> Result<(), ObjectError> {
        if self.lookup(id).is_some() {
            return Err(ObjectError::IdInUse(id));
        }
        if self.contains(id) {
            log::debug!("[OBJECTS] Reusing unresolved id {}", id);
        }
        self.objects.insert(id, None);
        Ok(())
    }

    /// Set the interface of `id`, registering it if needed.
    pub fn insert(&mut self, id: u32, interface: Option<InterfaceId>) {
        self.objects.insert(id, interface);
    }

    /// Register a freshly created object.
    pub fn bind(&mut self, id: u32, interface: Option<InterfaceId>) -> Result<(), ObjectError> {
        self.reserve(id)?;
        self.insert(id, interface);
        Ok(())
    }

    /// The interface of `id`; `None` for absent and unresolved ids alike.
    pub fn lookup(&self, id: u32) -> Option<InterfaceId> {
        self.objects.get(&id).copied().flatten()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    /// Forget `id`. Returns whether it was present.
    pub fn remove(&mut self, id: u32) -> bool {
        self.objects.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}
