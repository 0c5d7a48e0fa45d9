//! Configuration for grainql.
//!
//! Handles the TOML settings file, environment variable expansion and the
//! per-compilation runtime view.

mod settings;

pub use settings::{
    expand_env_vars, CacheSettings, CompilerConfig, CompilerSettings, OptimizationSettings,
    RenderingSettings, Settings, SettingsError, SettingsResult,
};
