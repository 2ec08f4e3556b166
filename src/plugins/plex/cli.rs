use crate::plugins::registry::{CliPlugin, ServiceConfig};
use clap::{Arg, ArgMatches, Command};

pub struct PlexCliPlugin;

impl PlexCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for PlexCliPlugin {
    fn name(&self) -> &'static str {
        "plex"
    }

    fn applies_to(&self, subcommand: &str) -> bool {
        matches!(subcommand, "serve" | "download")
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("plex_url")
                .long("plex-url")
                .env("PLEX_URL")
                .help_heading("Plex")
                .help("Base URL of the Plex server")
                .default_value("http://localhost:32400")
                .num_args(1),
        )
        .arg(
            Arg::new("plex_token")
                .long("plex-token")
                .env("PLEX_TOKEN")
                .hide_env_values(true)
                .help_heading("Plex")
                .help("X-Plex-Token sent with every request")
                .num_args(1),
        )
        .arg(
            Arg::new("plex_timeout_secs")
                .long("timeout-secs")
                .help_heading("Plex")
                .help("Request timeout for catalog calls, connect timeout for downloads")
                .default_value("60")
                .num_args(1),
        )
        .arg(
            Arg::new("plex_retries")
                .long("retries")
                .help_heading("Plex")
                .help("Retries for transient catalog errors (downloads are never retried)")
                .default_value("2")
                .num_args(1),
        )
        .arg(
            Arg::new("plex_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("Plex")
                .help("Retry backoff base in milliseconds")
                .default_value("400")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServiceConfig) -> anyhow::Result<()> {
        if let Some(u) = matches.get_one::<String>("plex_url") {
            cfg.plex.url = u.clone();
        }
        if let Some(t) = matches.get_one::<String>("plex_token") {
            cfg.plex.token = t.clone();
        }
        if let Some(s) = matches.get_one::<String>("plex_timeout_secs") {
            cfg.plex.timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("plex_retries") {
            cfg.plex.retries = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("plex_retry_backoff_ms") {
            cfg.plex.retry_backoff_ms = s.parse()?;
        }
        url::Url::parse(&cfg.plex.url).map_err(|e| anyhow::anyhow!("invalid --plex-url {}: {}", cfg.plex.url, e))?;
        Ok(())
    }
}
