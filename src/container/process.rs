//! Backend Executable Invocation
//!
//! Runs the configured container executable with its extra flags and
//! classifies failures. A non-zero exit whose stderr carries a server-side
//! 5xx marker is transient; every other failure is permanent.

use std::process::Command;

use log::debug;

use crate::error::{Result, RunError};

/// Markers of a server-side failure worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "Internal Server Error",
    "Bad Gateway",
    "Service Unavailable",
    "Gateway Timeout",
];

/// The backend executable plus the flags placed before every subcommand.
#[derive(Debug, Clone)]
pub struct BackendCommand {
    executable: String,
    flags: Vec<String>,
}

impl BackendCommand {
    pub fn new(executable: impl Into<String>, flags: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            flags,
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Runs `<executable> <flags...> <args...>` and returns trimmed stdout.
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.flags);
        cmd.args(args.iter().map(|a| a.as_ref()));

        debug!(
            "Invoking {} {}",
            self.executable,
            args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(" ")
        );

        let output = cmd.output().map_err(|e| {
            RunError::backend(format!("failed to invoke '{}': {}", self.executable, e))
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let subcommand = args.first().map(|a| a.as_ref()).unwrap_or("");
        Err(classify_failure(
            &self.executable,
            subcommand,
            output.status.code(),
            &stderr,
        ))
    }
}

/// Builds the error for a failed backend invocation.
pub fn classify_failure(executable: &str, subcommand: &str, code: Option<i32>, stderr: &str) -> RunError {
    let message = format!(
        "{} {} exited with {}: {}",
        executable,
        subcommand,
        code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
        stderr.trim()
    );
    if is_transient(stderr) {
        RunError::transient(message)
    } else {
        RunError::backend(message)
    }
}

/// Returns true if `stderr` looks like a server-side 5xx failure.
pub fn is_transient(stderr: &str) -> bool {
    TRANSIENT_MARKERS.iter().any(|marker| {
        stderr.match_indices(marker).any(|(at, _)| {
            // numeric codes must stand alone, not inside longer numbers or ids
            let before = stderr[..at].chars().next_back();
            let after = stderr[at + marker.len()..].chars().next();
            let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_ascii_alphanumeric());
            !marker.chars().all(|c| c.is_ascii_digit()) || (boundary(before) && boundary(after))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_markers() {
        assert!(is_transient("Error response from daemon: 503 Service Unavailable"));
        assert!(is_transient("received unexpected HTTP status: 500 Internal Server Error"));
        assert!(is_transient("Bad Gateway"));
        assert!(!is_transient("No such image: ubuntu:99"));
        assert!(!is_transient("container a5003fe not found"));
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure("docker", "inspect", Some(1), "Gateway Timeout\n");
        assert!(err.is_transient());

        let err = classify_failure("docker", "create", Some(125), "invalid reference format");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("invalid reference format"));
    }

    #[test]
    fn test_run_success_and_failure() {
        let sh = BackendCommand::new("sh", vec!["-c".to_string()]);
        assert_eq!(sh.run(&["echo  hello "]).unwrap(), "hello");

        let err = sh.run(&["echo 503 >&2; exit 1"]).unwrap_err();
        assert!(err.is_transient());

        let err = sh.run(&["echo nope >&2; exit 1"]).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_missing_executable_is_permanent() {
        let cmd = BackendCommand::new("/nonexistent/container-engine", Vec::new());
        let err = cmd.run(&["ps"]).unwrap_err();
        assert!(!err.is_transient());
    }
}
