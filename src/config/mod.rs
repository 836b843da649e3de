//! Layered application configuration.

mod secrets;
mod types;

pub use secrets::SecretString;
pub use types::{
    BillingConfig, Config, ContextConfig, DatabaseConfig, LoggingConfig, ProviderConfig,
    ProvidersConfig, ServerConfig, TriggersConfig,
};
