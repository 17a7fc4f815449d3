use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// The name registry.
///
/// Every server registers its handle under a well-known name at startup;
/// anything holding the registry can look a handle up later without
/// having been wired to the server directly. Handles are stored by value
/// and cloned out, so they must be cheap `Clone` types.
#[derive(Clone, Default)]
pub struct Registry {
    names: Arc<RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = match self.names.read() {
            Ok(names) => names.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        names.sort_unstable();
        f.debug_tuple("Registry").field(&names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `name`, replacing any previous holder.
    pub fn register_as<H>(&self, name: &'static str, handle: H)
    where
        H: Clone + Send + Sync + 'static,
    {
        self.names
            .write()
            .expect("registry lock poisoned")
            .insert(name, Box::new(handle));
    }

    /// Looks up the handle registered under `name`. `None` if nothing is
    /// registered there or the registered handle has a different type.
    pub fn who_is<H>(&self, name: &str) -> Option<H>
    where
        H: Clone + Send + Sync + 'static,
    {
        self.names
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .and_then(|handle| handle.downcast_ref::<H>())
            .cloned()
    }
}
