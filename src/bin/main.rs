//! grainql CLI - Compile statements against a concept model to SQL
//!
//! Usage:
//!   grainql compile <environment.json> <statements.json> [--dialect <dialect>]
//!   grainql validate <environment.json> [--database <file.sqlite>]
//!   grainql list <environment.json>
//!
//! Examples:
//!   grainql compile model.json queries.json --dialect sqlite
//!   grainql validate model.json --database warehouse.sqlite --sample 500

use clap::{Parser, Subcommand, ValueEnum};
use grainql::cache::EnvironmentCache;
use grainql::compile::compile_statements;
use grainql::config::{CompilerConfig, Settings};
use grainql::environment::Environment;
use grainql::model::Statement;
use grainql::sql::Dialect;
use grainql::validation;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "grainql")]
#[command(about = "grainql - Resolve concept queries into multi-dialect CTE SQL")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to GRAINQL_CONFIG, ./grainql.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile statements to SQL
    Compile {
        /// Environment JSON
        environment: PathBuf,

        /// JSON array of statements, applied in order
        statements: PathBuf,

        /// SQL dialect to generate (overrides the settings file)
        #[arg(short, long)]
        dialect: Option<DialectArg>,

        /// Fail when the SQL contains an unresolved reference
        #[arg(long)]
        strict: bool,

        /// Annotate CTEs with the concepts they produce
        #[arg(long)]
        comments: bool,
    },

    /// Validate an environment, optionally against sampled rows
    Validate {
        /// Environment JSON
        environment: PathBuf,

        /// SQLite database holding the datasources
        #[arg(long)]
        database: Option<PathBuf>,

        /// Rows sampled per datasource
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },

    /// List concepts and datasources in an environment
    List {
        /// Environment JSON
        environment: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Duckdb,
    Postgres,
    Bigquery,
    Snowflake,
    Tsql,
    Sqlite,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Duckdb => Dialect::DuckDb,
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Bigquery => Dialect::BigQuery,
            DialectArg::Snowflake => Dialect::Snowflake,
            DialectArg::Tsql => Dialect::TSql,
            DialectArg::Sqlite => Dialect::Sqlite,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Compile {
            environment,
            statements,
            dialect,
            strict,
            comments,
        } => {
            let mut config = settings.compiler_config();
            if let Some(dialect) = dialect {
                config = config.with_dialect(dialect.into());
            }
            if strict {
                config = config.with_strict_mode(true);
            }
            if comments {
                config = config.with_comments(true);
            }
            cmd_compile(&settings, &config, &environment, &statements)
        }
        Commands::Validate {
            environment,
            database,
            sample,
        } => cmd_validate(&settings, &environment, database.as_deref(), sample),
        Commands::List { environment } => cmd_list(&settings, &environment),
    }
}

fn load_settings(path: Option<&Path>) -> grainql::Result<Settings> {
    Ok(match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::load()?,
    })
}

fn read(path: &Path) -> Result<String, ExitCode> {
    fs::read_to_string(path).map_err(|e| {
        eprintln!("Error reading file '{}': {}", path.display(), e);
        ExitCode::FAILURE
    })
}

/// Parse the environment file, going through the snapshot cache when enabled.
fn load_environment(settings: &Settings, path: &Path) -> Result<Environment, ExitCode> {
    let source = read(path)?;
    let loaded = match EnvironmentCache::from_settings(&settings.cache) {
        Ok(Some(cache)) => cache.environment_or_build(&source, || Environment::from_json(&source)),
        Ok(None) => Environment::from_json(&source),
        Err(e) => {
            log::warn!("environment cache unavailable: {}", e);
            Environment::from_json(&source)
        }
    };
    loaded.map_err(|e| {
        eprintln!("Invalid environment '{}': {}", path.display(), e);
        ExitCode::FAILURE
    })
}

fn cmd_compile(settings: &Settings, config: &CompilerConfig, environment: &Path, statements: &Path) -> ExitCode {
    let mut env = match load_environment(settings, environment) {
        Ok(env) => env,
        Err(code) => return code,
    };
    let source = match read(statements) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let parsed: Vec<Statement> = match serde_json::from_str(&source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Invalid statements '{}': {}", statements.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match compile_statements(&mut env, &parsed, config) {
        Ok(compiled) => {
            for sql in compiled {
                println!("{};", sql);
                println!();
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_validate(settings: &Settings, environment: &Path, database: Option<&Path>, sample: usize) -> ExitCode {
    let env = match load_environment(settings, environment) {
        Ok(env) => env,
        Err(code) => return code,
    };
    if let Err(e) = validation::validate_environment(&env, &[]) {
        eprintln!("Validation errors:\n  {}", e);
        return ExitCode::FAILURE;
    }

    if let Some(database) = database {
        let conn = match rusqlite::Connection::open(database) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error opening database '{}': {}", database.display(), e);
                return ExitCode::FAILURE;
            }
        };
        let mut failed = false;
        for name in env.datasources.keys() {
            if let Err(e) = validation::validate_datasource(&env, &conn, name, sample) {
                eprintln!("{}: {}", name, e);
                failed = true;
            }
        }
        if failed {
            return ExitCode::FAILURE;
        }
    }

    println!("OK: {} is valid", environment.display());
    ExitCode::SUCCESS
}

fn cmd_list(settings: &Settings, environment: &Path) -> ExitCode {
    let env = match load_environment(settings, environment) {
        Ok(env) => env,
        Err(code) => return code,
    };

    println!("Concepts:");
    for (address, concept) in &env.concepts {
        if concept.address == *address {
            println!("  - {} ({:?}, {})", address, concept.purpose, concept.datatype);
        }
    }
    println!();
    println!("Datasources:");
    for (name, ds) in &env.datasources {
        println!("  - {} (source: \"{}\", grain: {})", name, ds.address.location, ds.resolved_grain(&env));
    }
    ExitCode::SUCCESS
}
