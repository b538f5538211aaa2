use std::sync::Arc;

use crate::client_hub::ClientHub;

/// What a module factory sees while its module is being instantiated.
#[derive(Clone, Debug)]
pub struct ModuleCtx {
    module: String,
    hub: Arc<ClientHub>,
}

impl ModuleCtx {
    pub fn new(module: impl Into<String>, hub: Arc<ClientHub>) -> Self {
        Self {
            module: module.into(),
            hub,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn client_hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }
}
