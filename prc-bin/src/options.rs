use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use prc_lib::{
    BucketKeyResolver, CommandBuckets, DEFAULT_USER_AGENT, RouteBuckets, ServerBuckets,
};
use secrecy::SecretString;
use serde::Deserialize;

use crate::verbosity::Verbosity;

pub(crate) const PRC_CONFIG_FILE: &str = "prc.toml";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const HELP_MSG_CONFIG_FILE: &str = "Configuration file to use [default: ./prc.toml, if it exists]";

// Macro for generating default functions to be used by serde
macro_rules! default_function {
    ( $( $name:ident : $T:ty = $e:expr; )* ) => {
        $(
            #[allow(clippy::missing_const_for_fn)]
            fn $name() -> $T {
                $e
            }
        )*
    };
}

// Generate the functions for serde defaults
default_function! {
    max_retries: u32 = DEFAULT_MAX_RETRIES;
    request_timeout: Duration = DEFAULT_REQUEST_TIMEOUT;
    user_agent: String = DEFAULT_USER_AGENT.to_string();
    verbosity: Verbosity = Verbosity::default();
}

// Macro for merging configuration values
macro_rules! fold_in {
    ($cli:ident , $toml:ident ; $ty:ident { $(..$ignore:ident,)* $( $key:ident : $default:expr, )* } ) => {
        if (false) {
            #[allow(dead_code, unused, clippy::diverging_sub_expression)]
            let _check_fold_in_exhaustivity = $ty {
                $($key: unreachable!(), )*
                $($ignore: unreachable!(), )*
            };
        };
        $(
            if $cli.$key == $default && $toml.$key != $default {
                $cli.$key = $toml.$key;
            }
        )*
    };
}

/// How requests are grouped into rate limit buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum BucketLayout {
    /// One bucket per route
    #[default]
    Route,
    /// One bucket per server
    Server,
    /// One bucket for commands, one for everything else
    Command,
}

impl BucketLayout {
    pub(crate) fn resolver(self) -> Arc<dyn BucketKeyResolver> {
        match self {
            Self::Route => Arc::new(RouteBuckets),
            Self::Server => Arc::new(ServerBuckets),
            Self::Command => Arc::new(CommandBuckets),
        }
    }
}

/// Parse a query parameter in `name=value` format
fn parse_param(param: &str) -> Result<(String, String)> {
    let (name, value) = param
        .split_once('=')
        .ok_or_else(|| anyhow!("Parameter `{param}` must be in `name=value` format"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Parameter `{param}` has an empty name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// What to do against the API
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Fetch a route with GET and print the response body
    Get {
        /// Route relative to the API base URL, e.g. `/server/players`
        route: String,

        /// Query parameter in `name=value` format; can be repeated
        #[arg(short, long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Cache the response under this category
        #[arg(long, value_name = "CATEGORY")]
        cache_category: Option<String>,
    },
    /// Run a command on the server, e.g. `:h Hello`
    Command {
        /// The command text
        text: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct PrcOptions {
    /// Configuration file to use
    #[arg(short, long = "config")]
    #[arg(help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) config: Config,

    #[command(subcommand)]
    pub(crate) action: Action,
}

/// The main configuration for prc
#[derive(Parser, Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Verbose program output
    #[clap(flatten)]
    #[serde(default = "verbosity")]
    pub(crate) verbose: Verbosity,

    /// Server key of the private server, from the server settings
    #[arg(long, env = "PRC_SERVER_KEY", hide_env_values = true, global = true)]
    #[serde(default)]
    pub(crate) server_key: Option<SecretString>,

    /// Global API key, only needed for large scale applications
    #[arg(long, env = "PRC_GLOBAL_KEY", hide_env_values = true, global = true)]
    #[serde(default)]
    pub(crate) global_key: Option<SecretString>,

    /// Base URL of the API
    #[arg(long, global = true)]
    #[serde(default)]
    pub(crate) base_url: Option<String>,

    /// Maximum number of retries after a rate limited or failed attempt
    #[arg(long, default_value_t = max_retries(), global = true)]
    #[serde(default = "max_retries")]
    pub(crate) max_retries: u32,

    /// Give up waiting for a result after this long, e.g. `30s` or `2m`
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s", global = true)]
    #[serde(default = "request_timeout", with = "humantime_serde")]
    pub(crate) request_timeout: Duration,

    /// Timeout of a single HTTP attempt, e.g. `10s`
    #[arg(long, value_parser = humantime::parse_duration, global = true)]
    #[serde(default, with = "humantime_serde")]
    pub(crate) timeout: Option<Duration>,

    /// How requests are grouped into rate limit buckets
    #[arg(long, value_enum, default_value_t, global = true)]
    #[serde(default)]
    pub(crate) buckets: BucketLayout,

    /// User agent sent with every request
    #[arg(long, default_value_t = user_agent(), global = true)]
    #[serde(default = "user_agent")]
    pub(crate) user_agent: String,

    /// Print bucket statistics as JSON to stderr when done
    #[arg(long, global = true)]
    #[serde(default)]
    pub(crate) stats: bool,
}

impl Config {
    /// Load configuration from a file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        // Read configuration file
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }

    /// Merge the configuration from TOML into the CLI configuration
    pub(crate) fn merge(&mut self, toml: Config) {
        // Keys are merged outside of fold_in! because SecretBox doesn't implement Eq.
        if self.server_key.is_none() && toml.server_key.is_some() {
            self.server_key = toml.server_key;
        }
        if self.global_key.is_none() && toml.global_key.is_some() {
            self.global_key = toml.global_key;
        }

        // NOTE: if you see an error within this macro call, check to make sure that
        // that the fields provided to fold_in! match all the fields of the Config struct.
        fold_in! {
            // Destination and source configs
            self, toml;

            Config {
                // Keys which are handled outside of fold_in
                ..server_key,
                ..global_key,

                // Keys with defaults to assign
                verbose: Verbosity::default(),
                base_url: None,
                max_retries: DEFAULT_MAX_RETRIES,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                timeout: None,
                buckets: BucketLayout::default(),
                user_agent: DEFAULT_USER_AGENT,
                stats: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    #[test]
    fn verify_app() {
        use clap::CommandFactory;
        PrcOptions::command().debug_assert();
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("limit = 10").unwrap(),
            ("limit".to_string(), "10".to_string())
        );
        assert_eq!(
            parse_param("q=a=b").unwrap(),
            ("q".to_string(), "a=b".to_string())
        );
        assert!(parse_param("limit").is_err());
        assert!(parse_param("=10").is_err());
    }

    #[test]
    fn test_parse_get() {
        let opts = PrcOptions::try_parse_from([
            "prc",
            "get",
            "/server/killlogs",
            "-p",
            "limit=10",
            "--cache-category",
            "logs",
            "--max-retries",
            "5",
        ])
        .unwrap();

        assert_eq!(
            opts.action,
            Action::Get {
                route: "/server/killlogs".into(),
                params: vec![("limit".into(), "10".into())],
                cache_category: Some("logs".into()),
            }
        );
        assert_eq!(opts.config.max_retries, 5);
        assert_eq!(opts.config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_merge_prefers_cli() {
        let mut cli = PrcOptions::try_parse_from([
            "prc",
            "--max-retries",
            "1",
            "--server-key",
            "from-cli",
            "command",
            ":h hi",
        ])
        .unwrap()
        .config;

        let toml: Config = toml::from_str(
            r#"
            server_key = "from-file"
            global_key = "global"
            max_retries = 7
            request_timeout = "5s"
            buckets = "server"
            "#,
        )
        .unwrap();
        cli.merge(toml);

        assert_eq!(cli.max_retries, 1);
        assert_eq!(cli.request_timeout, Duration::from_secs(5));
        assert_eq!(cli.buckets, BucketLayout::Server);
        assert_eq!(cli.server_key.unwrap().expose_secret(), "from-cli");
        assert_eq!(cli.global_key.unwrap().expose_secret(), "global");
    }

    #[test]
    fn test_unknown_config_key() {
        assert!(toml::from_str::<Config>("retries = 3").is_err());
    }
}
