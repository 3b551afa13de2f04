//! `prc` talks to the API of PRC private servers from the command line.
//!
//! The binary is a wrapper around `prc-lib`, which takes care of rate
//! limits, retries and de-duplication.
//!
//! List the players on a server:
//! ```sh
//! PRC_SERVER_KEY=... prc get /server/players
//! ```
//!
//! Fetch the latest kill logs:
//! ```sh
//! prc get /server/killlogs --param limit=10
//! ```
//!
//! Send a message to everyone in-game:
//! ```sh
//! prc command ":h Server restart in 5 minutes"
//! ```
//!
//! Settings can also be stored in a `prc.toml` in the working directory.
//! Values given on the command line take precedence.
#![warn(clippy::all, clippy::pedantic)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::error;
use prc_lib::{
    COMMAND_ROUTE, Governor, GovernorBuilder, GovernorConfig, RequestDescriptor, ServerKey,
};
use secrecy::ExposeSecret;
use serde_json::json;

mod logging;
mod options;
mod verbosity;

use crate::logging::init_logging;
use crate::options::{Action, Config, PRC_CONFIG_FILE, PrcOptions};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is also used for any `Result::Err` bubbled up to
    // `main()` using the `?` operator, e.g. configuration errors.
    Failure = 1,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap the main code in another function to ensure that.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Merge all provided config options into one.
/// This includes a potential config file, command-line- and environment variables
fn load_config() -> Result<PrcOptions> {
    let mut opts = PrcOptions::parse();

    init_logging(&opts.config.verbose);

    // Load a potentially existing config file and merge it into the config from
    // the CLI. Without an explicit file, a `prc.toml` in the current directory
    // is used if it exists.
    let config_file = match &opts.config_file {
        Some(path) => Some(path.clone()),
        None => Some(PathBuf::from(PRC_CONFIG_FILE)).filter(|p| p.is_file()),
    };
    if let Some(config_file) = config_file {
        match Config::load_from_file(&config_file) {
            Ok(c) => opts.config.merge(c),
            Err(e) => {
                bail!(
                    "Cannot load configuration file `{}`: {e:?}",
                    config_file.display()
                );
            }
        }
    }

    Ok(opts)
}

/// Set up runtime and call prc entrypoint
fn run_main() -> Result<i32> {
    let opts = load_config()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(&opts))
}

fn create_governor(cfg: &Config) -> Result<Governor> {
    let config = GovernorConfig {
        max_retries: cfg.max_retries,
        request_timeout: cfg.request_timeout,
        ..GovernorConfig::default()
    };

    let builder = GovernorBuilder::builder()
        .config(config)
        .resolver(cfg.buckets.resolver())
        .global_key(cfg.global_key.clone())
        .user_agent(cfg.user_agent.clone())
        .timeout(cfg.timeout);

    let governor = match &cfg.base_url {
        Some(base_url) => builder.base_url(base_url.clone()).build().governor(),
        None => builder.build().governor(),
    };
    governor.context("Failed to create the API client")
}

fn descriptor(action: &Action, server_key: ServerKey) -> Result<RequestDescriptor> {
    let descriptor = match action {
        Action::Get {
            route,
            params,
            cache_category,
        } => {
            let mut descriptor = RequestDescriptor::get(server_key, route)?;
            for (name, value) in params {
                descriptor = descriptor.with_param(name.as_str(), value.as_str());
            }
            match cache_category {
                Some(category) => descriptor.cacheable(category.as_str()),
                None => descriptor,
            }
        }
        Action::Command { text } => {
            RequestDescriptor::post_json(server_key, COMMAND_ROUTE, &json!({ "command": text }))?
        }
    };
    Ok(descriptor)
}

/// Run the requested action
async fn run(opts: &PrcOptions) -> Result<i32> {
    let Some(server_key) = &opts.config.server_key else {
        bail!("No server key given. Use `--server-key` or set PRC_SERVER_KEY");
    };
    let server_key: ServerKey = server_key
        .expose_secret()
        .parse()
        .context("Cannot use the given server key")?;

    let governor = create_governor(&opts.config)?;
    let descriptor = descriptor(&opts.action, server_key)?;
    let bucket = governor.bucket_for(&descriptor);

    let exit_code = match governor.submit(descriptor).await {
        Ok(response) => {
            println!("{}", response.text());
            ExitCode::Success
        }
        Err(e) => {
            error!("{e}");
            ExitCode::Failure
        }
    };

    if opts.config.stats {
        let stats = governor.bucket_stats(&bucket);
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }

    Ok(exit_code as i32)
}
