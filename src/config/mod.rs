//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashSet,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::invalidation::{InvalidationType, RuleAction, VersionStrategy};
use crate::pattern::KeyPattern;
use crate::warming::{ModelKind, PriorityAlgorithm, WarmingStrategy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";
const ENV_PREFIX: &str = "TIERCACHE";
const DEFAULT_LAYER_NAME: &str = "memory";
const DEFAULT_LAYER_TTL_SECS: u64 = 300;
const DEFAULT_LAYER_MAX_ENTRIES: u64 = 1_000;
const DEFAULT_LAYER_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 100;
const DEFAULT_PROPAGATION_MAX_DEPTH: u32 = 5;
const DEFAULT_PROPAGATION_BATCH_SIZE: u64 = 10;
const DEFAULT_PROPAGATION_DELAY_MS: u64 = 100;
const DEFAULT_PROPAGATION_DRAIN_INTERVAL_MS: u64 = 500;
const DEFAULT_PROPAGATION_QUEUE_LIMIT: u64 = 10_000;
const DEFAULT_WARMING_MAX_CONCURRENT: u64 = 4;
const DEFAULT_WARMING_MAX_TIME_MS: u64 = 30_000;
const DEFAULT_WARMING_MAX_MEMORY_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_WARMING_RATE_PER_SECOND: u32 = 10;
const DEFAULT_WARMING_PRIORITY_LEVELS: u64 = 5;
const DEFAULT_WARMING_POPULAR_TOP_N: u64 = 10;
const DEFAULT_WARMING_MODEL_REFRESH_MS: u64 = 60 * 60 * 1000;

/// Command-line arguments for the tiercache binary.
#[derive(Debug, Parser)]
#[command(
    name = "tiercache",
    version,
    about = "Multi-layer cache orchestration service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TIERCACHE_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Build the cache runtime and run its background workers until interrupted.
    Serve(Box<ServeArgs>),
    /// Resolve configuration, print it, and exit.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Spawn write-through-up back-fills instead of awaiting them.
    #[arg(
        long = "detached-backfill",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub detached_backfill: Option<bool>,

    /// Override the version strategy (timestamp|semantic|hash|hybrid).
    #[arg(long = "version-strategy", value_name = "STRATEGY")]
    pub version_strategy: Option<String>,

    /// Override the dependency traversal depth bound.
    #[arg(long = "propagation-max-depth", value_name = "DEPTH")]
    pub propagation_max_depth: Option<u32>,

    /// Override the number of concurrent warming fetches.
    #[arg(long = "warming-max-concurrent", value_name = "COUNT")]
    pub warming_max_concurrent_requests: Option<u64>,

    /// Override the period of automatic warming sessions; 0 disables them.
    #[arg(long = "warming-session-interval-ms", value_name = "MILLIS")]
    pub warming_session_interval_ms: Option<u64>,

    /// Override the strategy used by automatic warming sessions.
    #[arg(long = "warming-session-strategy", value_name = "STRATEGY")]
    pub warming_session_strategy: Option<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub orchestrator: OrchestratorSettings,
    pub layers: Vec<LayerSettings>,
    pub propagation: PropagationSettings,
    pub warming: WarmingSettings,
    pub versioning: VersioningSettings,
    pub rules: Vec<RuleSettings>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub detached_backfill: bool,
    pub consume_batch_limit: NonZeroUsize,
}

/// One cache layer, listed fastest first.
#[derive(Debug, Clone)]
pub struct LayerSettings {
    pub name: String,
    /// Zero disables expiry for writes without an explicit TTL.
    pub ttl_seconds: u64,
    pub max_entries: NonZeroUsize,
    pub read_only: bool,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PropagationSettings {
    pub max_depth: u32,
    pub batch_size: NonZeroUsize,
    pub delay: Duration,
    pub drain_interval: Duration,
    pub queue_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct WarmingSettings {
    pub max_concurrent_requests: NonZeroUsize,
    pub max_warming_time: Duration,
    pub max_memory_bytes: NonZeroUsize,
    /// Zero disables rate limiting.
    pub rate_per_second: u32,
    pub priority_levels: NonZeroU32,
    pub popular_top_n: NonZeroUsize,
    pub algorithm: PriorityAlgorithm,
    pub model: ModelKind,
    pub model_refresh_interval: Duration,
    pub session_interval: Option<Duration>,
    pub session_strategy: WarmingStrategy,
}

#[derive(Debug, Clone, Copy)]
pub struct VersioningSettings {
    pub strategy: VersionStrategy,
}

/// A declarative invalidation rule from `[[rules]]`.
#[derive(Debug, Clone)]
pub struct RuleSettings {
    pub id: String,
    pub pattern: KeyPattern,
    pub triggers: Vec<InvalidationType>,
    pub action: RuleAction,
    pub cascade: Vec<KeyPattern>,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        LoadError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load configuration from files, environment, and CLI overrides.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::CheckConfig(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    orchestrator: RawOrchestratorSettings,
    layers: Option<Vec<RawLayerSettings>>,
    propagation: RawPropagationSettings,
    warming: RawWarmingSettings,
    versioning: RawVersioningSettings,
    rules: Vec<RawRuleSettings>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(detached) = overrides.detached_backfill {
            self.orchestrator.detached_backfill = Some(detached);
        }
        if let Some(strategy) = overrides.version_strategy.as_ref() {
            self.versioning.strategy = Some(strategy.clone());
        }
        if let Some(depth) = overrides.propagation_max_depth {
            self.propagation.max_depth = Some(depth);
        }
        if let Some(max) = overrides.warming_max_concurrent_requests {
            self.warming.max_concurrent_requests = Some(max);
        }
        if let Some(interval) = overrides.warming_session_interval_ms {
            self.warming.session_interval_ms = Some(interval);
        }
        if let Some(strategy) = overrides.warming_session_strategy.as_ref() {
            self.warming.session_strategy = Some(strategy.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            orchestrator,
            layers,
            propagation,
            warming,
            versioning,
            rules,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let orchestrator = build_orchestrator_settings(orchestrator)?;
        let layers = build_layer_settings(layers)?;
        let propagation = build_propagation_settings(propagation)?;
        let warming = build_warming_settings(warming)?;
        let versioning = build_versioning_settings(versioning)?;
        let rules = build_rule_settings(rules)?;

        Ok(Self {
            logging,
            orchestrator,
            layers,
            propagation,
            warming,
            versioning,
            rules,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_orchestrator_settings(
    orchestrator: RawOrchestratorSettings,
) -> Result<OrchestratorSettings, LoadError> {
    let consume_batch_limit = non_zero_usize(
        orchestrator
            .consume_batch_limit
            .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
        "orchestrator.consume_batch_limit",
    )?;

    Ok(OrchestratorSettings {
        detached_backfill: orchestrator.detached_backfill.unwrap_or(false),
        consume_batch_limit,
    })
}

fn build_layer_settings(
    layers: Option<Vec<RawLayerSettings>>,
) -> Result<Vec<LayerSettings>, LoadError> {
    let layers = layers.unwrap_or_else(|| {
        vec![RawLayerSettings {
            name: Some(DEFAULT_LAYER_NAME.to_string()),
            ..Default::default()
        }]
    });
    if layers.is_empty() {
        return Err(LoadError::invalid(
            "layers",
            "at least one cache layer must be configured",
        ));
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(layers.len());
    for layer in layers {
        let name = layer
            .name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| LoadError::invalid("layers.name", "every layer needs a name"))?;
        if !seen.insert(name.clone()) {
            return Err(LoadError::invalid(
                "layers.name",
                format!("duplicate layer name `{name}`"),
            ));
        }

        let max_entries = non_zero_usize(
            layer.max_entries.unwrap_or(DEFAULT_LAYER_MAX_ENTRIES),
            "layers.max_entries",
        )?;
        let sweep_interval = positive_millis(
            layer
                .sweep_interval_ms
                .unwrap_or(DEFAULT_LAYER_SWEEP_INTERVAL_MS),
            "layers.sweep_interval_ms",
        )?;

        resolved.push(LayerSettings {
            name,
            ttl_seconds: layer.ttl_seconds.unwrap_or(DEFAULT_LAYER_TTL_SECS),
            max_entries,
            read_only: layer.read_only.unwrap_or(false),
            sweep_interval,
        });
    }

    if resolved.iter().all(|layer| layer.read_only) {
        tracing::warn!("Every configured cache layer is read-only; writes will be rejected");
    }

    Ok(resolved)
}

fn build_propagation_settings(
    propagation: RawPropagationSettings,
) -> Result<PropagationSettings, LoadError> {
    let batch_size = non_zero_usize(
        propagation
            .batch_size
            .unwrap_or(DEFAULT_PROPAGATION_BATCH_SIZE),
        "propagation.batch_size",
    )?;
    let drain_interval = positive_millis(
        propagation
            .drain_interval_ms
            .unwrap_or(DEFAULT_PROPAGATION_DRAIN_INTERVAL_MS),
        "propagation.drain_interval_ms",
    )?;
    let queue_limit = non_zero_usize(
        propagation
            .queue_limit
            .unwrap_or(DEFAULT_PROPAGATION_QUEUE_LIMIT),
        "propagation.queue_limit",
    )?;

    Ok(PropagationSettings {
        max_depth: propagation
            .max_depth
            .unwrap_or(DEFAULT_PROPAGATION_MAX_DEPTH),
        batch_size,
        delay: Duration::from_millis(
            propagation
                .delay_ms
                .unwrap_or(DEFAULT_PROPAGATION_DELAY_MS),
        ),
        drain_interval,
        queue_limit,
    })
}

fn build_warming_settings(warming: RawWarmingSettings) -> Result<WarmingSettings, LoadError> {
    let max_concurrent_requests = non_zero_usize(
        warming
            .max_concurrent_requests
            .unwrap_or(DEFAULT_WARMING_MAX_CONCURRENT),
        "warming.max_concurrent_requests",
    )?;
    let max_warming_time = positive_millis(
        warming
            .max_warming_time_ms
            .unwrap_or(DEFAULT_WARMING_MAX_TIME_MS),
        "warming.max_warming_time_ms",
    )?;
    let max_memory_bytes = non_zero_usize(
        warming
            .max_memory_bytes
            .unwrap_or(DEFAULT_WARMING_MAX_MEMORY_BYTES),
        "warming.max_memory_bytes",
    )?;
    let priority_levels = non_zero_u32(
        warming
            .priority_levels
            .unwrap_or(DEFAULT_WARMING_PRIORITY_LEVELS),
        "warming.priority_levels",
    )?;
    let popular_top_n = non_zero_usize(
        warming
            .popular_top_n
            .unwrap_or(DEFAULT_WARMING_POPULAR_TOP_N),
        "warming.popular_top_n",
    )?;
    let model_refresh_interval = positive_millis(
        warming
            .model_refresh_interval_ms
            .unwrap_or(DEFAULT_WARMING_MODEL_REFRESH_MS),
        "warming.model_refresh_interval_ms",
    )?;

    let algorithm = parse_or_default(warming.algorithm, "warming.algorithm")?;
    let model = parse_or_default(warming.model, "warming.model")?;
    let session_strategy = parse_or_default(warming.session_strategy, "warming.session_strategy")?;

    let session_interval = warming
        .session_interval_ms
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis);

    Ok(WarmingSettings {
        max_concurrent_requests,
        max_warming_time,
        max_memory_bytes,
        rate_per_second: warming
            .rate_per_second
            .unwrap_or(DEFAULT_WARMING_RATE_PER_SECOND),
        priority_levels,
        popular_top_n,
        algorithm,
        model,
        model_refresh_interval,
        session_interval,
        session_strategy,
    })
}

fn build_versioning_settings(
    versioning: RawVersioningSettings,
) -> Result<VersioningSettings, LoadError> {
    Ok(VersioningSettings {
        strategy: parse_or_default(versioning.strategy, "versioning.strategy")?,
    })
}

fn build_rule_settings(rules: Vec<RawRuleSettings>) -> Result<Vec<RuleSettings>, LoadError> {
    let mut seen = HashSet::new();
    rules
        .into_iter()
        .map(|rule| {
            let id = rule
                .id
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| LoadError::invalid("rules.id", "every rule needs an id"))?;
            if !seen.insert(id.clone()) {
                return Err(LoadError::invalid(
                    "rules.id",
                    format!("duplicate rule id `{id}`"),
                ));
            }

            let pattern = match rule.pattern {
                Some(raw) => parse_pattern(&raw, "rules.pattern")?,
                None => {
                    return Err(LoadError::invalid(
                        "rules.pattern",
                        format!("rule `{id}` has no pattern"),
                    ));
                }
            };
            let cascade = rule
                .cascade
                .iter()
                .map(|raw| parse_pattern(raw, "rules.cascade"))
                .collect::<Result<Vec<_>, _>>()?;
            if rule.triggers.is_empty() {
                tracing::warn!(rule_id = %id, "Invalidation rule has no triggers and never fires");
            }

            Ok(RuleSettings {
                id,
                pattern,
                triggers: rule.triggers,
                action: rule.action.unwrap_or_default(),
                cascade,
                priority: rule.priority.unwrap_or(0),
                enabled: rule.enabled.unwrap_or(true),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOrchestratorSettings {
    detached_backfill: Option<bool>,
    consume_batch_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLayerSettings {
    name: Option<String>,
    ttl_seconds: Option<u64>,
    max_entries: Option<u64>,
    read_only: Option<bool>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPropagationSettings {
    max_depth: Option<u32>,
    batch_size: Option<u64>,
    delay_ms: Option<u64>,
    drain_interval_ms: Option<u64>,
    queue_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmingSettings {
    max_concurrent_requests: Option<u64>,
    max_warming_time_ms: Option<u64>,
    max_memory_bytes: Option<u64>,
    rate_per_second: Option<u32>,
    priority_levels: Option<u64>,
    popular_top_n: Option<u64>,
    algorithm: Option<String>,
    model: Option<String>,
    model_refresh_interval_ms: Option<u64>,
    session_interval_ms: Option<u64>,
    session_strategy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawVersioningSettings {
    strategy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRuleSettings {
    id: Option<String>,
    pattern: Option<String>,
    triggers: Vec<InvalidationType>,
    action: Option<RuleAction>,
    cascade: Vec<String>,
    priority: Option<i32>,
    enabled: Option<bool>,
}

fn parse_pattern(raw: &str, key: &'static str) -> Result<KeyPattern, LoadError> {
    KeyPattern::parse(raw).map_err(|err| LoadError::invalid(key, err.to_string()))
}

fn parse_or_default<T>(value: Option<String>, key: &'static str) -> Result<T, LoadError>
where
    T: FromStr<Err = String> + Default,
{
    match value {
        Some(raw) => raw.trim().parse().map_err(|err| LoadError::invalid(key, err)),
        None => Ok(T::default()),
    }
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
