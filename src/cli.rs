//! CLI argument parsing for the fntrace driver

use crate::backend::BackendPreference;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fntrace")]
#[command(version)]
#[command(
    about = "Trace call counts and latency of selected functions in a synthetic workload",
    long_about = None
)]
pub struct Cli {
    /// TOML config file (backend, timeouts, default function list)
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Functions to trace, as module.function (e.g., -f workload.fib,workload.flaky)
    #[arg(short = 'f', long = "functions", value_name = "NAMES", value_delimiter = ',')]
    pub functions: Vec<String>,

    /// Backend to use, overriding the config file
    #[arg(long = "backend", value_enum)]
    pub backend: Option<BackendPreference>,

    /// Worker threads running the workload
    #[arg(long = "threads", value_name = "N", default_value = "4")]
    pub threads: usize,

    /// Workload rounds per thread
    #[arg(long = "calls", value_name = "N", default_value = "50")]
    pub calls: usize,

    /// Argument passed to the recursive fib function
    #[arg(long = "depth", value_name = "N", default_value = "10")]
    pub depth: u32,

    /// Serve tracer requests from a dedicated agent thread
    #[arg(long = "threaded-transport")]
    pub threaded_transport: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["fntrace"]);
        assert!(cli.config.is_none());
        assert!(cli.functions.is_empty());
        assert!(cli.backend.is_none());
        assert_eq!(cli.threads, 4);
        assert_eq!(cli.calls, 50);
        assert_eq!(cli.depth, 10);
        assert!(!cli.threaded_transport);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_functions_comma_separated() {
        let cli = Cli::parse_from(["fntrace", "-f", "workload.fib,workload.checksum"]);
        assert_eq!(cli.functions, vec!["workload.fib", "workload.checksum"]);
    }

    #[test]
    fn test_cli_functions_repeated() {
        let cli = Cli::parse_from(["fntrace", "-f", "a", "--functions", "m.b"]);
        assert_eq!(cli.functions, vec!["a", "m.b"]);
    }

    #[test]
    fn test_cli_backend_flag() {
        let cli = Cli::parse_from(["fntrace", "--backend", "injection"]);
        assert_eq!(cli.backend, Some(BackendPreference::Injection));
    }

    #[test]
    fn test_cli_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["fntrace", "--backend", "ptrace"]).is_err());
    }

    #[test]
    fn test_cli_workload_flags() {
        let cli = Cli::parse_from([
            "fntrace",
            "--threads",
            "2",
            "--calls",
            "7",
            "--depth",
            "5",
            "--threaded-transport",
            "--debug",
        ]);
        assert_eq!(cli.threads, 2);
        assert_eq!(cli.calls, 7);
        assert_eq!(cli.depth, 5);
        assert!(cli.threaded_transport);
        assert!(cli.debug);
    }
}
