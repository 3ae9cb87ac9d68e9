//! wdlrunner CLI Entry Point
//!
//! Runs an evaluated workflow plan, or pre-populates the download cache.
//!
//! # Usage
//!
//! ```bash
//! # Run a plan, creating the run directory under the current directory
//! wdlrunner plan.yaml
//!
//! # With a configuration file and a run parent directory
//! wdlrunner plan.yaml --cfg wdlrunner.yaml --dir /data/runs
//!
//! # Limit concurrency and per-task resources
//! wdlrunner plan.yaml --max-tasks 8 --runtime-cpu-max 4 --runtime-memory-max 16G
//!
//! # Pre-populate the download cache
//! wdlrunner localize https://example.org/ref.fa s3://bucket/reads/
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use log::{info, warn};
use serde_json::json;

use wdlrunner::cache::DownloadCache;
use wdlrunner::config::{parse_byte_size, parse_env_override};
use wdlrunner::monitoring::ExecutionTimeline;
use wdlrunner::{load_plan, Config, RunError, Scheduler, APP_NAME, VERSION};

/// What the invocation asks for.
#[derive(Debug, PartialEq)]
enum Command {
    Run { plan: PathBuf },
    Localize { uris: Vec<String> },
}

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct Options {
    command: Command,
    cfg_file: Option<PathBuf>,
    dir: PathBuf,
    max_tasks: Option<usize>,
    cpu_max: Option<u32>,
    memory_max: Option<u64>,
    env: Vec<String>,
    copy_input_files: bool,
    as_me: bool,
    no_cache: bool,
    error_json: bool,
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            command: Command::Run {
                plan: PathBuf::new(),
            },
            cfg_file: None,
            dir: PathBuf::from("."),
            max_tasks: None,
            cpu_max: None,
            memory_max: None,
            env: Vec::new(),
            copy_input_files: false,
            as_me: false,
            no_cache: false,
            error_json: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: {} [OPTIONS] <PLAN>", APP_NAME);
    println!("       {} localize [--cfg FILE] <URI>...", APP_NAME);
    println!();
    println!("Arguments:");
    println!("  <PLAN>                      Path to the plan YAML file");
    println!();
    println!("Options:");
    println!("  --cfg FILE                  Configuration YAML file");
    println!("  --dir DIR                   Parent directory of the run directory (default: .)");
    println!("  --max-tasks N               Maximum concurrently running tasks");
    println!("  --runtime-cpu-max N         Maximum cpu per task");
    println!("  --runtime-memory-max SIZE   Maximum memory per task, e.g. 16G");
    println!("  --env NAME[=VALUE]          Inject an environment variable into every task");
    println!("  --copy-input-files          Copy input files instead of mounting them");
    println!("  --as-me                     Run containers as the invoking user");
    println!("  --no-cache                  Do not reuse call cache entries");
    println!("  --error-json                Print failures as JSON");
    println!("  --verbose                   Enable debug logging");
    println!("  --help                      Show this help message");
    println!("  --version                   Show version information");
}

/// Parses command-line arguments into Options.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut positional: Vec<String> = Vec::new();
    let mut i = 1; // Skip program name

    let value = |i: &mut usize, name: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", name))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => options.verbose = true,
            "--copy-input-files" => options.copy_input_files = true,
            "--as-me" => options.as_me = true,
            "--no-cache" => options.no_cache = true,
            "--error-json" => options.error_json = true,
            "--cfg" => options.cfg_file = Some(PathBuf::from(value(&mut i, arg)?)),
            "--dir" => options.dir = PathBuf::from(value(&mut i, arg)?),
            "--env" => options.env.push(value(&mut i, arg)?),
            "--max-tasks" => {
                let text = value(&mut i, arg)?;
                let n = text
                    .parse()
                    .map_err(|_| format!("Invalid --max-tasks value: {}", text))?;
                options.max_tasks = Some(n);
            }
            "--runtime-cpu-max" => {
                let text = value(&mut i, arg)?;
                let n = text
                    .parse()
                    .map_err(|_| format!("Invalid --runtime-cpu-max value: {}", text))?;
                options.cpu_max = Some(n);
            }
            "--runtime-memory-max" => {
                let text = value(&mut i, arg)?;
                options.memory_max = Some(parse_byte_size(&text)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    options.command = match positional.split_first() {
        Some((first, rest)) if first == "localize" => {
            if rest.is_empty() {
                return Err("localize requires at least one URI".to_string());
            }
            Command::Localize {
                uris: rest.to_vec(),
            }
        }
        Some((plan, [])) => Command::Run {
            plan: PathBuf::from(plan),
        },
        Some((_, [extra, ..])) => return Err(format!("Unexpected argument: {}", extra)),
        None => return Err("missing plan file".to_string()),
    };

    Ok(options)
}

/// Loads the configuration and applies command-line overrides.
fn load_config(options: &Options) -> Result<Config, RunError> {
    let mut cfg = Config::load(options.cfg_file.as_deref())?;

    if let Some(n) = options.max_tasks {
        cfg.scheduler.task_concurrency = n;
    }
    if let Some(n) = options.cpu_max {
        cfg.task_runtime.cpu_max = n;
    }
    if let Some(n) = options.memory_max {
        cfg.task_runtime.memory_max = n;
    }
    if options.copy_input_files {
        cfg.file_io.copy_input_files = true;
    }
    if options.as_me {
        cfg.task_runtime.as_user = true;
    }
    if options.no_cache {
        cfg.call_cache.get = false;
    }
    if !options.env.is_empty() {
        warn!("--env makes the run depend on this host's environment; prefer task inputs");
        cfg.task_runtime.env.extend(parse_env_override(&options.env)?);
    }

    cfg.validate()?;
    cfg.log_all();
    Ok(cfg)
}

/// Quotes an argument for a POSIX shell when needed.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Writes the command line that reproduces this run.
fn write_rerun(run_dir: &Path, args: &[String]) {
    let cwd = env::current_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_default();
    let line: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    let text = format!("pushd {} && {}; popd\n", shell_quote(&cwd), line.join(" "));

    let path = run_dir.join("rerun");
    if let Err(e) = fs::write(&path, text) {
        warn!("Could not write {}: {}", path.display(), e);
    }
}

/// Prints outcome counts and per-call durations.
fn print_summary(timeline: &ExecutionTimeline) {
    let summary = timeline.summary();

    println!();
    println!("{}", "Run summary".bold());
    println!("  {:<10} {}", "completed", summary.completed.to_string().green());
    println!("  {:<10} {}", "cached", summary.cache_hits.to_string().cyan());
    println!("  {:<10} {}", "failed", summary.failed.to_string().red());
    println!("  {:<10} {}", "cancelled", summary.cancelled.to_string().yellow());

    let durations = timeline.get_durations();
    if !durations.is_empty() {
        println!();
        for (call, duration) in &durations {
            println!("  {:<40} {:>10.2?}", call, duration);
        }
    }
    println!();
    println!("Total execution time: {:.2?}", timeline.elapsed());
}

fn run_plan(plan: &Path, options: &Options, args: &[String]) -> Result<(), RunError> {
    let cfg = load_config(options)?;

    info!("Loading plan: {}", plan.display());
    let workflow = load_plan(plan, cfg.file_io.use_relative_output_paths)?;

    let scheduler = Scheduler::new(cfg)?;
    let outcome = scheduler.run_workflow(&workflow, &options.dir)?;
    write_rerun(&outcome.dir, args);
    print_summary(&scheduler.timeline());

    let (dir, outputs) = outcome.into_result()?;
    let outputs: serde_json::Map<String, serde_json::Value> = outputs
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    let result = json!({ "outputs": outputs, "dir": dir });
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_localize(uris: &[String], options: &Options) -> Result<(), RunError> {
    let cfg = load_config(options)?;
    let cache = DownloadCache::new(&cfg.download_cache)?;

    for (uri, entry) in cache.localize(uris)? {
        match entry {
            Some(path) => println!("{} {}", "cached".green(), format!("{} -> {}", uri, path.display())),
            None => println!("{} {}", "skipped".yellow(), uri),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let options = match parse_arguments(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::from(2);
        }
    };

    setup_logging(options.verbose);

    let result = match &options.command {
        Command::Run { plan } => run_plan(plan, &options, &args),
        Command::Localize { uris } => run_localize(uris, &options),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if options.error_json {
                println!("{}", e.to_json());
            } else {
                eprintln!();
                eprintln!("{} {}", "Error:".red().bold(), e);
            }
            // exit statuses are 8-bit
            ExitCode::from(e.exit_status().clamp(1, 255) as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("wdlrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run_options() {
        let options = parse_arguments(&args(&[
            "plan.yaml",
            "--dir",
            "/runs",
            "--max-tasks",
            "3",
            "--runtime-memory-max",
            "2G",
            "--env",
            "REF=hg38",
            "--as-me",
        ]))
        .unwrap();

        assert_eq!(
            options.command,
            Command::Run {
                plan: PathBuf::from("plan.yaml")
            }
        );
        assert_eq!(options.dir, PathBuf::from("/runs"));
        assert_eq!(options.max_tasks, Some(3));
        assert_eq!(options.memory_max, Some(2_000_000_000));
        assert_eq!(options.env, vec!["REF=hg38"]);
        assert!(options.as_me);
    }

    #[test]
    fn test_parse_localize() {
        let options = parse_arguments(&args(&["localize", "https://x/a", "https://x/b"])).unwrap();
        assert_eq!(
            options.command,
            Command::Localize {
                uris: vec!["https://x/a".to_string(), "https://x/b".to_string()]
            }
        );
        assert!(parse_arguments(&args(&["localize"])).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--max-tasks"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--max-tasks", "many"])).is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plan.yaml"), "plan.yaml");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_rerun_file() {
        let temp = tempfile::tempdir().unwrap();
        write_rerun(temp.path(), &args(&["plan.yaml", "--env", "A=1 2"]));
        let text = fs::read_to_string(temp.path().join("rerun")).unwrap();
        assert!(text.contains("wdlrunner plan.yaml --env 'A=1 2'"));
    }
}
