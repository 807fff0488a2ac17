pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, AppConfigLayer, AuthConfig, AuthKind, ConfigError, ConfigManager, Defaults,
    LogFolder, LoggingConfig, LoggingConfigLayer, ServerConfig, TimeoutConfig,
    TimeoutConfigLayer,
};
