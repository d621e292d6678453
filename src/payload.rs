//! Process-local payload registry.
//!
//! The controller window owns the document bytes. It registers them here and
//! hands out a `blob:` location that any window in the process can resolve,
//! until the owner revokes it. Locations that are not blobs are read from the
//! filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use log::debug;
use uuid::Uuid;

use crate::engine::DocumentRef;

const BLOB_PREFIX: &str = "blob:tandem/";

#[derive(Clone, Default)]
pub struct PayloadStore {
    blobs: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
}

impl PayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, payload: Vec<u8>) -> DocumentRef {
        let location = format!("{BLOB_PREFIX}{}", Uuid::new_v4());
        debug!("payload: registered {location} ({} bytes)", payload.len());
        self.lock().insert(location.clone(), payload.into());
        DocumentRef::new(location)
    }

    /// Returns false if the location was not (or no longer) registered.
    pub fn revoke(&self, location: &DocumentRef) -> bool {
        let removed = self.lock().remove(location.as_str()).is_some();
        if removed {
            debug!("payload: revoked {location}");
        }
        removed
    }

    pub fn resolve(&self, location: &DocumentRef) -> Result<Arc<[u8]>> {
        let loc = location.as_str();
        if loc.starts_with(BLOB_PREFIX) {
            return match self.lock().get(loc) {
                Some(bytes) => Ok(Arc::clone(bytes)),
                None => bail!("{loc} has been revoked or was never registered"),
            };
        }
        if loc.starts_with("blob:") {
            bail!("{loc} belongs to another registry");
        }
        let path = Path::new(loc.strip_prefix("file://").unwrap_or(loc));
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(bytes.into())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<[u8]>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
