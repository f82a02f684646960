//! # fnexec CLI
//!
//! Command-line front end: load an engine configuration and a function manifest, then invoke
//! functions from the shell. Results are printed to stdout as one JSON object per line.

use crate::{
    config::{EngineConfig, FunctionManifest},
    engine::ExecutionEngine,
    retry::{RetryConfig, invoke_with_retry},
    types::InvocationRequest,
    utils::logging::init_logging,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::{path::PathBuf, time::Duration};

/// How long in-flight invocations get to finish once the process is asked to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// fnexec: run serverless functions in warm, isolated sandboxes.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about,
    long_about = "fnexec deploys the functions listed in a manifest and invokes them.

Examples:
  fnexec --functions functions.toml list
  fnexec --functions functions.toml invoke echo --payload '{\"name\": \"world\"}'
  fnexec --config engine.toml --functions functions.toml invoke echo --repeat 20 --concurrency 4"
)]
pub struct Cli {
    /// Engine configuration file (TOML). Built-in defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Function manifest (TOML with [[function]] tables)
    #[arg(long, default_value = "functions.toml")]
    pub functions: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Log to stderr instead of file
    #[arg(long)]
    pub log_to_stderr: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Invoke a deployed function and print each result as JSON
    Invoke {
        /// Function id from the manifest
        function: String,

        /// JSON payload passed to the function
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Deadline for each invocation, in milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Number of invocations to run
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Invocations in flight at once
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Re-invoke on transient system faults, up to this many times
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// List the functions in the manifest
    List,
    /// Check the configuration and manifest without running anything
    Validate,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load engine config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn load_manifest(cli: &Cli) -> Result<FunctionManifest> {
    FunctionManifest::load_from_file(&cli.functions)
        .with_context(|| format!("Failed to load function manifest {}", cli.functions.display()))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    init_logging(log_level, !cli.log_to_stderr)?;

    let config = load_config(&cli)?;
    config.validate().context("Invalid engine config")?;
    let manifest = load_manifest(&cli)?;

    match &cli.command {
        Command::Validate => {
            println!(
                "ok: {} driver, {} function(s)",
                serde_json::to_value(config.driver.kind)?
                    .as_str()
                    .unwrap_or("unknown"),
                manifest.functions.len()
            );
            Ok(())
        }
        Command::List => {
            for spec in &manifest.functions {
                println!(
                    "{}\t{}\t{}\ttimeout={}ms memory={}MiB",
                    spec.id,
                    spec.artifact.image,
                    spec.artifact.command.join(" "),
                    spec.limits.timeout.as_millis(),
                    spec.limits.memory_mb
                );
            }
            Ok(())
        }
        Command::Invoke {
            function,
            payload,
            timeout_ms,
            repeat,
            concurrency,
            retries,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(payload).context("--payload is not valid JSON")?;
            if *concurrency == 0 {
                bail!("--concurrency must be at least 1");
            }
            if !manifest.functions.iter().any(|f| f.id.as_str() == function) {
                bail!(
                    "function '{}' is not in {}",
                    function,
                    cli.functions.display()
                );
            }

            let engine = ExecutionEngine::new(config)?;
            for spec in manifest.functions {
                engine.deploy(spec).await?;
            }

            let stopper = engine.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, shutting down");
                    stopper.shutdown(SHUTDOWN_GRACE).await;
                }
            });

            let retry = RetryConfig::default()
                .with_max_retries(*retries)
                .with_jitter(true);
            let timeout = Duration::from_millis(*timeout_ms);
            let mut failures = 0usize;
            let (engine_ref, retry_ref, function) = (&engine, &retry, function.as_str());
            let mut results = futures::stream::iter(0..*repeat)
                .map(move |_| {
                    let request =
                        InvocationRequest::with_timeout(function, payload.clone(), timeout);
                    async move { invoke_with_retry(engine_ref, retry_ref, request).await }
                })
                .buffer_unordered(*concurrency);
            while let Some(result) = results.next().await {
                if !result.is_success() {
                    failures += 1;
                }
                println!("{}", serde_json::to_string(&result)?);
            }
            drop(results);

            tracing::debug!(
                "engine stats: {}",
                serde_json::to_string(&engine.stats())?
            );
            engine.shutdown(SHUTDOWN_GRACE).await;
            if failures > 0 {
                bail!("{} of {} invocation(s) did not succeed", failures, repeat);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_invoke_arguments() {
        let cli = Cli::try_parse_from([
            "fnexec",
            "--functions",
            "fns.toml",
            "--log-to-stderr",
            "invoke",
            "echo",
            "--payload",
            r#"{"a": 1}"#,
            "--repeat",
            "3",
            "--concurrency",
            "2",
        ])
        .unwrap();
        assert!(cli.log_to_stderr);
        assert_eq!(cli.functions, PathBuf::from("fns.toml"));
        match cli.command {
            Command::Invoke {
                function,
                repeat,
                concurrency,
                timeout_ms,
                retries,
                ..
            } => {
                assert_eq!(function, "echo");
                assert_eq!((repeat, concurrency), (3, 2));
                assert_eq!(timeout_ms, 30_000);
                assert_eq!(retries, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let cli = Cli::try_parse_from(["fnexec", "list"]).unwrap();
        assert_eq!(load_config(&cli).unwrap(), EngineConfig::default());
    }
}
