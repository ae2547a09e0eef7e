//! ProviderClient implementations.

pub mod simplefin;

use std::sync::Arc;

pub use simplefin::SimpleFinClient;

use crate::config::ProvidersConfig;
use crate::ports::ProviderRegistry;

/// Registry holding every built-in provider.
pub fn default_registry(config: &ProvidersConfig) -> ProviderRegistry {
    ProviderRegistry::new().with(Arc::new(SimpleFinClient::from_config(config)))
}
