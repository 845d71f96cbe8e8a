pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    CALLBACK_PATH, Config, ConfigMetadata, CorsConfig, DatabaseConfig, RedisConfig,
    ServerConfig, StorageConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
