use crate::backend::BackendDescriptor;
use resticwrap_core::{Error, Result};
use std::collections::HashMap;

/// The configured backends of one wrapper, looked up by repository identifier.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<BackendDescriptor>,
    index: Option<HashMap<String, usize>>,
    fallback: BackendDescriptor,
}

impl BackendRegistry {
    pub fn new(backends: Vec<BackendDescriptor>) -> Self {
        Self {
            backends,
            index: None,
            fallback: BackendDescriptor::default(),
        }
    }

    /// Indexes the backends by repository. Fails on duplicate identifiers.
    pub fn build_index(&mut self) -> Result<()> {
        let mut index = HashMap::with_capacity(self.backends.len());
        for (position, backend) in self.backends.iter().enumerate() {
            if backend.repository.is_empty() {
                continue;
            }
            if index.insert(backend.repository.clone(), position).is_some() {
                return Err(Error::Config(format!(
                    "duplicate backend for repository {}",
                    backend.repository
                )));
            }
        }
        self.index = Some(index);
        Ok(())
    }

    /// Returns the backend owning `repository`, if any.
    pub fn get_backend(&self, repository: &str) -> Option<&BackendDescriptor> {
        match &self.index {
            Some(index) => index.get(repository).map(|&i| &self.backends[i]),
            None => self.backends.iter().find(|b| b.repository == repository),
        }
    }

    /// Like [`get_backend`](Self::get_backend) but degrades to the zero descriptor.
    pub fn matched(&self, repository: &str) -> &BackendDescriptor {
        self.get_backend(repository).unwrap_or(&self.fallback)
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn backends_mut(&mut self) -> &mut [BackendDescriptor] {
        &mut self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
