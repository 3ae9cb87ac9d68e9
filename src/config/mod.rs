//! Run Configuration
//!
//! Grouped option sets consumed once at process start. Values come from,
//! in increasing precedence:
//!
//! 1. Built-in defaults (an empty file is a valid configuration)
//! 2. An optional YAML file
//! 3. Environment variables `WDLRUNNER__<SECTION>__<KEY>`
//! 4. Command-line overrides
//!
//! # Example YAML
//!
//! ```yaml
//! scheduler:
//!   task_concurrency: 8
//!   fail_fast: true
//! container:
//!   backend: docker
//!   polling_period_seconds: 1.5
//! task_runtime:
//!   memory_max: 32G
//!   limit_policy: clamp
//! call_cache:
//!   get: true
//!   put: true
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as Yaml};

use crate::error::{Result, RunError};
use crate::workdir::confine::path_within;

/// Prefix of environment variables that override configuration options.
pub const ENV_PREFIX: &str = "WDLRUNNER__";

/// Complete configuration surface of the execution core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub container: ContainerConfig,
    pub file_io: FileIoConfig,
    pub task_runtime: TaskRuntimeConfig,
    pub download_cache: DownloadCacheConfig,
    pub call_cache: CallCacheConfig,
}

/// Concurrency pools and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrently running tasks (0 = host cpu count)
    pub task_concurrency: usize,
    /// Concurrently running downloads
    pub download_concurrency: usize,
    /// Concurrently running subworkflow calls per nesting depth (0 = task concurrency)
    pub subworkflow_concurrency: usize,
    /// Cancel all in-flight tasks on the first failure
    pub fail_fast: bool,
    /// Maximum length of scatter tags in run identifiers (0 disables tags)
    pub scatter_tag_max_length: usize,
    /// Host cpu count override (0 = detect)
    pub host_cpu: u32,
    /// Host memory override in bytes (0 = detect)
    #[serde(deserialize_with = "byte_size")]
    pub host_memory: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_concurrency: 0,
            download_concurrency: 10,
            subworkflow_concurrency: 0,
            fail_fast: true,
            scatter_tag_max_length: 32,
            host_cpu: 0,
            host_memory: 0,
        }
    }
}

/// Container backend selection and its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Backend name: `docker`, `podman`, `swarm`, or a registered one
    pub backend: String,
    /// Backend executable (empty = backend default)
    pub executable: String,
    /// Extra flags placed before every backend subcommand
    pub flags: Vec<String>,
    pub polling_period_seconds: f64,
    pub max_transient_retries: u32,
    /// Networks tasks may attach to
    pub allow_networks: Vec<String>,
    /// Initialize a single-node swarm when none is active
    pub auto_init_swarm: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            backend: "docker".to_string(),
            executable: String::new(),
            flags: Vec::new(),
            polling_period_seconds: 1.0,
            max_transient_retries: 5,
            allow_networks: Vec::new(),
            auto_init_swarm: true,
        }
    }
}

/// When a task's `work/` directory is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    Never,
    Success,
    Failure,
    Always,
}

impl CleanupPolicy {
    /// Returns true if a task ending with `succeeded` should be cleaned.
    pub fn applies(self, succeeded: bool) -> bool {
        match self {
            Self::Never => false,
            Self::Success => succeeded,
            Self::Failure => !succeeded,
            Self::Always => true,
        }
    }
}

/// Filesystem policy for task working directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileIoConfig {
    /// Every path a task touches must resolve within this directory
    pub root: PathBuf,
    /// Accept input files outside `root`
    pub allow_any_input: bool,
    pub copy_input_files: bool,
    pub copy_input_files_for: Vec<String>,
    /// Re-own working directories to the invoking user after each task
    pub chown: bool,
    pub output_hardlinks: bool,
    pub use_relative_output_paths: bool,
    pub delete_work: CleanupPolicy,
    /// Mount a task-private temp directory into the container
    pub mount_tmpdir: bool,
    pub mount_tmpdir_for: Vec<String>,
}

impl Default for FileIoConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            allow_any_input: false,
            copy_input_files: false,
            copy_input_files_for: Vec::new(),
            chown: false,
            output_hardlinks: false,
            use_relative_output_paths: false,
            delete_work: CleanupPolicy::Never,
            mount_tmpdir: false,
            mount_tmpdir_for: Vec::new(),
        }
    }
}

impl FileIoConfig {
    /// Whether inputs of `task_name` are staged by copy.
    pub fn copy_inputs_for(&self, task_name: &str) -> bool {
        self.copy_input_files || self.copy_input_files_for.iter().any(|t| t == task_name)
    }

    /// Whether `task_name` gets a mounted temp dir, honoring a task override.
    pub fn mount_tmpdir_for(&self, task_name: &str, task_override: Option<bool>) -> bool {
        task_override.unwrap_or_else(|| {
            self.mount_tmpdir || self.mount_tmpdir_for.iter().any(|t| t == task_name)
        })
    }
}

/// What happens to a request above `cpu_max` / `memory_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    /// Reduce the request to the maximum
    #[default]
    Clamp,
    /// Fail admission with `ResourceUnsatisfiable`
    Reject,
}

/// Runtime values used when a task leaves them unspecified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeDefaults {
    pub image: String,
    pub cpu: u32,
    #[serde(deserialize_with = "byte_size")]
    pub memory: u64,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            cpu: 1,
            memory: 0,
        }
    }
}

/// Task runtime limits and container environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRuntimeConfig {
    /// Maximum cpu per task (0 = host cpu count)
    pub cpu_max: u32,
    /// Maximum memory per task in bytes (0 = host memory)
    #[serde(deserialize_with = "byte_size")]
    pub memory_max: u64,
    pub limit_policy: LimitPolicy,
    /// Hard memory limit as a multiple of the reservation (0 = none)
    pub memory_limit_multiplier: f64,
    pub defaults: RuntimeDefaults,
    pub command_shell: String,
    pub command_preamble: String,
    /// Injected environment; `None` passes the host's value through
    pub env: BTreeMap<String, Option<String>>,
    /// Run containers as the invoking uid:gid
    pub as_user: bool,
    pub allow_privileged: bool,
}

impl Default for TaskRuntimeConfig {
    fn default() -> Self {
        Self {
            cpu_max: 0,
            memory_max: 0,
            limit_policy: LimitPolicy::Clamp,
            memory_limit_multiplier: 0.0,
            defaults: RuntimeDefaults::default(),
            command_shell: "/bin/bash".to_string(),
            command_preamble: "set -euo pipefail".to_string(),
            env: BTreeMap::new(),
            as_user: false,
            allow_privileged: false,
        }
    }
}

impl TaskRuntimeConfig {
    /// Resolves injected variables, reading pass-through values from the host.
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|(name, value)| match value {
                Some(v) => Some((name.clone(), v.clone())),
                None => std::env::var(name).ok().map(|v| (name.clone(), v)),
            })
            .collect()
    }
}

/// Download cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadCacheConfig {
    pub put: bool,
    pub get: bool,
    pub dir: PathBuf,
    /// Cache URIs with a query string, keyed without it
    pub ignore_query: bool,
    pub enable_patterns: Vec<String>,
    pub disable_patterns: Vec<String>,
    /// Downloader command; `{uri}` and `{dest}` are substituted
    pub downloader: Vec<String>,
}

impl Default for DownloadCacheConfig {
    fn default() -> Self {
        Self {
            put: false,
            get: false,
            dir: PathBuf::from("/tmp/wdlrunner_download_cache"),
            ignore_query: false,
            enable_patterns: vec!["*".to_string()],
            disable_patterns: vec!["*.php".to_string(), "*.aspx".to_string()],
            downloader: ["curl", "-fsSL", "--retry", "3", "-o", "{dest}", "{uri}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Call cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallCacheConfig {
    pub put: bool,
    pub get: bool,
    /// Storage backend name: `json_dir` or a registered one
    pub backend: String,
    pub dir: PathBuf,
}

impl Default for CallCacheConfig {
    fn default() -> Self {
        Self {
            put: false,
            get: false,
            backend: "json_dir".to_string(),
            dir: PathBuf::from("/tmp/wdlrunner_call_cache"),
        }
    }
}

impl Config {
    /// Loads configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| RunError::io(path, e))?;
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };

        let cfg = cfg.with_env_overrides(std::env::vars())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a YAML document; empty input yields the defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Applies `WDLRUNNER__SECTION__KEY` variables from `vars`.
    pub fn with_env_overrides<I>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut overrides = Mapping::new();

        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let Some((section, key)) = rest.split_once("__") else {
                warn!("Ignoring malformed configuration variable {}", name);
                continue;
            };

            let section = Yaml::String(section.to_lowercase());
            let entry = overrides
                .entry(section)
                .or_insert_with(|| Yaml::Mapping(Mapping::new()));
            if let Yaml::Mapping(map) = entry {
                map.insert(Yaml::String(key.to_lowercase()), parse_scalar(&value));
            }
            debug!("Configuration override from environment: {}", name);
        }

        if overrides.is_empty() {
            return Ok(self);
        }
        self.with_overrides(&Yaml::Mapping(overrides))
    }

    /// Merges a tree of `{section: {key: value}}` overrides.
    ///
    /// Unknown sections and keys are reported and ignored.
    pub fn with_overrides(self, overrides: &Yaml) -> Result<Self> {
        let mut tree = serde_yaml::to_value(&self)?;
        merge_yaml(&mut tree, overrides, 0, "");
        Ok(serde_yaml::from_value(tree)?)
    }

    /// Checks cross-option consistency.
    pub fn validate(&self) -> Result<()> {
        if !(self.container.polling_period_seconds > 0.0) {
            return Err(RunError::Config(
                "container.polling_period_seconds must be positive".to_string(),
            ));
        }

        if self.task_runtime.memory_limit_multiplier < 0.0 {
            return Err(RunError::Config(
                "task_runtime.memory_limit_multiplier must not be negative".to_string(),
            ));
        }

        for pattern in self
            .download_cache
            .enable_patterns
            .iter()
            .chain(&self.download_cache.disable_patterns)
        {
            glob::Pattern::new(pattern).map_err(|e| {
                RunError::Config(format!("invalid download_cache pattern '{}': {}", pattern, e))
            })?;
        }

        let cache = &self.download_cache;
        if (cache.get || cache.put)
            && cache.dir.is_absolute()
            && !path_within(&cache.dir, &self.file_io.root)
        {
            return Err(RunError::Config(format!(
                "download_cache.dir '{}' must be within file_io.root '{}'",
                cache.dir.display(),
                self.file_io.root.display()
            )));
        }

        if self.file_io.delete_work != CleanupPolicy::Never && !self.file_io.output_hardlinks {
            warn!(
                "file_io.delete_work = {:?} has no effect unless file_io.output_hardlinks is enabled",
                self.file_io.delete_work
            );
        }

        if self.download_cache.downloader.is_empty() {
            return Err(RunError::Config(
                "download_cache.downloader must name an executable".to_string(),
            ));
        }

        Ok(())
    }

    /// Logs the effective configuration at debug level.
    pub fn log_all(&self) {
        match serde_yaml::to_string(self) {
            Ok(text) => debug!("Effective configuration:\n{}", text),
            Err(e) => warn!("Could not render configuration: {}", e),
        }
    }
}

/// Recursively merges `src` into `dst`.
///
/// Sections (depth 0) and their options (depth 1) must already exist;
/// deeper maps such as `task_runtime.env` accept new keys.
fn merge_yaml(dst: &mut Yaml, src: &Yaml, depth: usize, path: &str) {
    let (Yaml::Mapping(dst_map), Yaml::Mapping(src_map)) = (&mut *dst, src) else {
        *dst = src.clone();
        return;
    };

    for (key, value) in src_map {
        let name = key.as_str().unwrap_or("?");
        let full = if path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", path, name)
        };

        match dst_map.get_mut(key) {
            Some(existing) => merge_yaml(existing, value, depth + 1, &full),
            None if depth < 2 => warn!("Ignoring unknown configuration option '{}'", full),
            None => {
                dst_map.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Interprets an environment value as a YAML scalar, falling back to a string.
fn parse_scalar(value: &str) -> Yaml {
    match value.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" => return Yaml::Bool(true),
        "false" | "f" | "no" | "n" | "off" => return Yaml::Bool(false),
        "" => return Yaml::String(String::new()),
        _ => {}
    }
    match serde_yaml::from_str::<Yaml>(value) {
        Ok(Yaml::Null) | Err(_) => Yaml::String(value.to_string()),
        Ok(parsed) => parsed,
    }
}

/// Parses `--env NAME=VALUE` / `--env NAME` arguments.
pub fn parse_env_override(items: &[String]) -> Result<BTreeMap<String, Option<String>>> {
    let mut env = BTreeMap::new();
    for item in items {
        let (name, value) = match item.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (item.as_str(), None),
        };
        if name.is_empty() {
            return Err(RunError::Config(format!("invalid --env argument: {}", item)));
        }
        env.insert(name.to_string(), value);
    }
    Ok(env)
}

/// Parses a byte size such as `512`, `4G`, `1.5 GiB`.
///
/// `K`/`KB` are powers of 1000 and `Ki`/`KiB` powers of 1024; the same
/// holds for `M`, `G` and `T`.
pub fn parse_byte_size(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid byte size: '{}'", text))?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "ki" | "kib" => 1024.0,
        "m" | "mb" => 1e6,
        "mi" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" => 1e9,
        "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" => 1e12,
        "ti" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => return Err(format!("unknown byte size unit '{}' in '{}'", other, text)),
    };

    Ok((number * multiplier).round() as u64)
}

/// Deserializes a byte size given either as an integer or a string with units.
pub(crate) fn byte_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Float(f) if f >= 0.0 => Ok(f.round() as u64),
        Raw::Float(f) => Err(de::Error::custom(format!("negative byte size: {}", f))),
        Raw::Text(s) => parse_byte_size(&s).map_err(de::Error::custom),
    }
}

/// Optional variant of [`byte_size`].
pub(crate) fn optional_byte_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "byte_size")] u64);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(n)| n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.scheduler.fail_fast);
        assert_eq!(cfg.scheduler.download_concurrency, 10);
        assert_eq!(cfg.container.backend, "docker");
        assert_eq!(cfg.file_io.delete_work, CleanupPolicy::Never);
        assert_eq!(cfg.task_runtime.limit_policy, LimitPolicy::Clamp);
        assert_eq!(cfg.download_cache.enable_patterns, vec!["*"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let cfg = Config::from_yaml("  \n").unwrap();
        assert_eq!(cfg.call_cache.backend, "json_dir");
    }

    #[test]
    fn test_yaml_sections_and_byte_sizes() {
        let cfg = Config::from_yaml(
            r#"
scheduler:
  task_concurrency: 3
  host_memory: 16G
task_runtime:
  memory_max: 2GiB
  limit_policy: reject
file_io:
  delete_work: success
  output_hardlinks: true
"#,
        )
        .unwrap();

        assert_eq!(cfg.scheduler.task_concurrency, 3);
        assert_eq!(cfg.scheduler.host_memory, 16_000_000_000);
        assert_eq!(cfg.task_runtime.memory_max, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.task_runtime.limit_policy, LimitPolicy::Reject);
        assert_eq!(cfg.file_io.delete_work, CleanupPolicy::Success);
        // untouched options keep their defaults
        assert!(cfg.scheduler.fail_fast);
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("WDLRUNNER__SCHEDULER__TASK_CONCURRENCY".to_string(), "7".to_string()),
            ("WDLRUNNER__CALL_CACHE__GET".to_string(), "yes".to_string()),
            ("WDLRUNNER__CONTAINER__BACKEND".to_string(), "swarm".to_string()),
            ("WDLRUNNER__TASK_RUNTIME__MEMORY_MAX".to_string(), "8G".to_string()),
            ("UNRELATED".to_string(), "1".to_string()),
        ];
        let cfg = Config::default().with_env_overrides(vars).unwrap();

        assert_eq!(cfg.scheduler.task_concurrency, 7);
        assert!(cfg.call_cache.get);
        assert_eq!(cfg.container.backend, "swarm");
        assert_eq!(cfg.task_runtime.memory_max, 8_000_000_000);
    }

    #[test]
    fn test_unknown_override_is_ignored() {
        let vars = vec![("WDLRUNNER__NOPE__THING".to_string(), "1".to_string())];
        let cfg = Config::default().with_env_overrides(vars).unwrap();
        assert_eq!(cfg.scheduler.download_concurrency, 10);
    }

    #[test]
    fn test_overrides_merge_env_map() {
        let cfg = Config::from_yaml("task_runtime:\n  env:\n    A: '1'\n").unwrap();
        let overrides: Yaml = serde_yaml::from_str("task_runtime:\n  env:\n    B: '2'\n").unwrap();
        let cfg = cfg.with_overrides(&overrides).unwrap();

        assert_eq!(cfg.task_runtime.env.get("A"), Some(&Some("1".to_string())));
        assert_eq!(cfg.task_runtime.env.get("B"), Some(&Some("2".to_string())));
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("4K").unwrap(), 4000);
        assert_eq!(parse_byte_size("4KiB").unwrap(), 4096);
        assert_eq!(parse_byte_size("1.5 GiB").unwrap(), 1_610_612_736);
        assert_eq!(parse_byte_size("2 TB").unwrap(), 2_000_000_000_000);
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("3 parsecs").is_err());
    }

    #[test]
    fn test_parse_env_override() {
        let env = parse_env_override(&["A=1".to_string(), "HOME".to_string(), "B=x=y".to_string()])
            .unwrap();
        assert_eq!(env.get("A"), Some(&Some("1".to_string())));
        assert_eq!(env.get("HOME"), Some(&None));
        assert_eq!(env.get("B"), Some(&Some("x=y".to_string())));

        assert!(parse_env_override(&["=oops".to_string()]).is_err());
    }

    #[test]
    fn test_resolved_env_pass_through() {
        let mut cfg = TaskRuntimeConfig::default();
        cfg.env.insert("WDLRUNNER_TEST_SET".to_string(), Some("v".to_string()));
        cfg.env.insert("WDLRUNNER_TEST_SURELY_UNSET_VAR".to_string(), None);

        let env = cfg.resolved_env();
        assert_eq!(env.get("WDLRUNNER_TEST_SET").map(String::as_str), Some("v"));
        assert!(!env.contains_key("WDLRUNNER_TEST_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_download_dir_must_be_within_root() {
        let mut cfg = Config::default();
        cfg.file_io.root = PathBuf::from("/data");
        cfg.download_cache.put = true;
        cfg.download_cache.dir = PathBuf::from("/var/cache/downloads");
        assert!(matches!(cfg.validate(), Err(RunError::Config(_))));

        cfg.download_cache.dir = PathBuf::from("/data/cache");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut cfg = Config::default();
        cfg.download_cache.disable_patterns = vec!["[".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cleanup_policy_applies() {
        assert!(!CleanupPolicy::Never.applies(true));
        assert!(CleanupPolicy::Success.applies(true));
        assert!(!CleanupPolicy::Success.applies(false));
        assert!(CleanupPolicy::Failure.applies(false));
        assert!(CleanupPolicy::Always.applies(false));
    }

    #[test]
    fn test_copy_and_tmpdir_selection() {
        let mut io = FileIoConfig::default();
        io.copy_input_files_for = vec!["mutator".to_string()];
        io.mount_tmpdir_for = vec!["big_sort".to_string()];

        assert!(io.copy_inputs_for("mutator"));
        assert!(!io.copy_inputs_for("reader"));
        assert!(io.mount_tmpdir_for("big_sort", None));
        assert!(!io.mount_tmpdir_for("big_sort", Some(false)));
        assert!(io.mount_tmpdir_for("other", Some(true)));
    }
}
