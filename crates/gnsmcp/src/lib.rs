//! gnsmcp — MCP control-plane server for GNS3.
//!
//! Exposes a curated catalog of tools (mutating), resources (read-only
//! views) and prompts (guided workflows) over a GNS3 controller, its node
//! consoles, and the SSH proxy. The dispatcher resolves every collaborator
//! through the typed service registry; tools never raise — they return a
//! success payload or a structured error envelope.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod lifecycle;
pub mod prompts;
pub mod protocol;
pub mod proxy_client;
pub mod resources;
pub mod server;
pub mod tools;

use std::sync::Arc;

use gns_config::Settings;
use gns_registry::ServiceRegistry;

/// Everything a request handler can reach, resolved through the registry.
///
/// The context holds the (already frozen) registry; the registry never
/// holds the context, so there is no ownership cycle to break.
pub struct AppContext {
    pub registry: Arc<ServiceRegistry>,
    pub settings: Settings,
}

impl AppContext {
    pub fn new(registry: Arc<ServiceRegistry>, settings: Settings) -> Self {
        Self { registry, settings }
    }
}
