//! TOML-based configuration for grainql.
//!
//! Supports a config file (grainql.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [compiler]
//! strict_mode = true
//! max_depth = 30
//!
//! [optimizations]
//! enabled = true
//! predicate_pushdown = false
//!
//! [rendering]
//! dialect = "postgres"
//! show_comments = true
//!
//! [cache]
//! enabled = true
//! path = "${HOME}/.cache/grainql/env.sqlite"
//! ```

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::processing::SearchConfig;
use crate::sql::Dialect;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub compiler: CompilerSettings,
    pub optimizations: OptimizationSettings,
    pub rendering: RenderingSettings,
    pub cache: CacheSettings,
}

/// Resolution and integrity settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Raise on invalid-reference markers in compiled SQL.
    pub strict_mode: bool,

    /// Recursion limit for concept search.
    pub max_depth: usize,

    /// Fail lowering when a CTE output has no source.
    pub validate_missing: bool,

    /// Name CTEs after words instead of hashes.
    pub human_identifiers: bool,

    /// Alternative join paths tried before declaring ambiguity.
    pub ambiguity_check_limit: usize,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        let search = SearchConfig::default();
        Self {
            strict_mode: true,
            max_depth: search.max_depth,
            validate_missing: true,
            human_identifiers: true,
            ambiguity_check_limit: search.ambiguity_check_limit,
        }
    }
}

/// CTE rewrite switches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationSettings {
    /// Master switch. When false no rule runs.
    pub enabled: bool,
    pub hide_unused_concepts: bool,
    pub inline_aggregate_filter: bool,
    pub inline_datasource: bool,
    pub predicate_pushdown: bool,
    pub constant_inlining: bool,

    /// Upper bound on rule passes before giving up on a fixpoint.
    pub max_passes: usize,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hide_unused_concepts: true,
            inline_aggregate_filter: true,
            inline_datasource: true,
            predicate_pushdown: true,
            constant_inlining: true,
            max_passes: 10,
        }
    }
}

impl OptimizationSettings {
    /// Every rule switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// SQL output settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderingSettings {
    pub dialect: Dialect,

    /// Emit a `-- ` comment above each CTE describing its source.
    pub show_comments: bool,

    /// Render join keys on nullable columns as null-safe comparisons.
    pub null_safe_joins: bool,
}

impl Default for RenderingSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::DuckDb,
            show_comments: false,
            null_safe_joins: true,
        }
    }
}

/// Environment snapshot cache.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,

    /// Cache database path (supports ${ENV_VAR} expansion). Defaults to the
    /// user cache directory.
    pub path: Option<String>,
}

impl CacheSettings {
    /// The cache database location, if caching is enabled.
    pub fn resolved_path(&self) -> SettingsResult<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        match &self.path {
            Some(path) => Ok(Some(PathBuf::from(expand_env_vars(path)?))),
            None => Ok(dirs::cache_dir().map(|d| d.join("grainql").join("environments.sqlite"))),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SettingsResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse settings from TOML text, expanding `${VAR}` references first.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> SettingsResult<Self> {
        let expanded = expand_env_vars(content)?;
        let settings: Settings = toml::from_str(&expanded)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `GRAINQL_CONFIG`
    /// 2. `./grainql.toml`
    /// 3. `~/.config/grainql/config.toml`
    pub fn load() -> SettingsResult<Self> {
        if let Ok(path) = env::var("GRAINQL_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("grainql.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("grainql").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn validate(&self) -> SettingsResult<()> {
        if self.compiler.max_depth == 0 {
            return Err(SettingsError::InvalidConfig(
                "compiler.max_depth must be at least 1".into(),
            ));
        }
        if self.optimizations.max_passes == 0 {
            return Err(SettingsError::InvalidConfig(
                "optimizations.max_passes must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The runtime view handed to compilation.
    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            strict_mode: self.compiler.strict_mode,
            validate_missing: self.compiler.validate_missing,
            human_identifiers: self.compiler.human_identifiers,
            search: SearchConfig {
                max_depth: self.compiler.max_depth,
                ambiguity_check_limit: self.compiler.ambiguity_check_limit,
            },
            optimizations: self.optimizations.clone(),
            dialect: self.rendering.dialect,
            show_comments: self.rendering.show_comments,
            null_safe_joins: self.rendering.null_safe_joins,
        }
    }
}

/// Flattened settings for a single compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConfig {
    pub strict_mode: bool,
    pub validate_missing: bool,
    pub human_identifiers: bool,
    pub search: SearchConfig,
    pub optimizations: OptimizationSettings,
    pub dialect: Dialect,
    pub show_comments: bool,
    pub null_safe_joins: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Settings::default().compiler_config()
    }
}

impl CompilerConfig {
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_optimizations(mut self, optimizations: OptimizationSettings) -> Self {
        self.optimizations = optimizations;
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_comments(mut self, show: bool) -> Self {
        self.show_comments = show;
        self
    }
}

static ENV_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Expand `${VAR}` references in a string.
///
/// A `$` not followed by `{NAME}` is kept as is.
pub fn expand_env_vars(s: &str) -> SettingsResult<String> {
    let mut missing: Option<String> = None;
    let expanded = ENV_VAR.replace_all(s, |caps: &Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(SettingsError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        env::set_var("GRAINQL_TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${GRAINQL_TEST_VAR}").unwrap(), "hello");
        assert_eq!(
            expand_env_vars("prefix_${GRAINQL_TEST_VAR}_suffix").unwrap(),
            "prefix_hello_suffix"
        );
        assert_eq!(expand_env_vars("no vars here").unwrap(), "no vars here");
        assert_eq!(expand_env_vars("cost: $5").unwrap(), "cost: $5");
        env::remove_var("GRAINQL_TEST_VAR");
    }

    #[test]
    fn test_missing_env_var() {
        let result = expand_env_vars("${GRAINQL_NONEXISTENT_VAR_12345}");
        assert!(matches!(result, Err(SettingsError::MissingEnvVar(name)) if name == "GRAINQL_NONEXISTENT_VAR_12345"));
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.compiler.strict_mode);
        assert_eq!(settings.compiler.max_depth, 30);
        assert_eq!(settings.compiler.ambiguity_check_limit, 20);
        assert!(settings.optimizations.enabled);
        assert_eq!(settings.optimizations.max_passes, 10);
        assert_eq!(settings.rendering.dialect, Dialect::DuckDb);
        assert!(!settings.cache.enabled);
    }

    #[test]
    fn test_parse_partial_settings() {
        let toml = r#"
[compiler]
strict_mode = false

[optimizations]
predicate_pushdown = false

[rendering]
dialect = "postgres"
show_comments = true
"#;
        let settings = Settings::from_str(toml).unwrap();
        assert!(!settings.compiler.strict_mode);
        assert_eq!(settings.compiler.max_depth, 30);
        assert!(!settings.optimizations.predicate_pushdown);
        assert!(settings.optimizations.inline_datasource);
        assert_eq!(settings.rendering.dialect, Dialect::Postgres);
        assert!(settings.rendering.show_comments);
    }

    #[test]
    fn test_env_expansion_before_parse() {
        env::set_var("GRAINQL_TEST_CACHE_DIR", "/tmp/grainql-cache");
        let toml = r#"
[cache]
enabled = true
path = "${GRAINQL_TEST_CACHE_DIR}/env.sqlite"
"#;
        let settings = Settings::from_str(toml).unwrap();
        assert_eq!(
            settings.cache.resolved_path().unwrap(),
            Some(PathBuf::from("/tmp/grainql-cache/env.sqlite"))
        );
        env::remove_var("GRAINQL_TEST_CACHE_DIR");
    }

    #[test]
    fn test_zero_passes_rejected() {
        let result = Settings::from_str("[optimizations]\nmax_passes = 0\n");
        assert!(matches!(result, Err(SettingsError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_dialect_is_parse_error() {
        let result = Settings::from_str("[rendering]\ndialect = \"oracle\"\n");
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_compiler_config_view() {
        let mut settings = Settings::default();
        settings.compiler.max_depth = 12;
        settings.rendering.dialect = Dialect::Sqlite;
        let config = settings.compiler_config();
        assert_eq!(config.search.max_depth, 12);
        assert_eq!(config.dialect, Dialect::Sqlite);
        assert!(config.strict_mode);
    }

    #[test]
    fn test_missing_file() {
        let result = Settings::from_file("/nonexistent/grainql.toml");
        assert!(matches!(result, Err(SettingsError::FileNotFound(_))));
    }
}
