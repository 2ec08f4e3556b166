use crate::plugins::registry::{CliPlugin, ServiceConfig};
use clap::{Arg, ArgMatches, Command};
use std::net::SocketAddr;

pub struct ApiCliPlugin;

impl ApiCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for ApiCliPlugin {
    fn name(&self) -> &'static str {
        "api"
    }

    fn applies_to(&self, subcommand: &str) -> bool {
        subcommand == "serve"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("listen")
                .long("listen")
                .env("LISTEN_ADDR")
                .help_heading("API")
                .help("Address the HTTP and WebSocket API binds to")
                .default_value("0.0.0.0:8080")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServiceConfig) -> anyhow::Result<()> {
        if let Some(l) = matches.get_one::<String>("listen") {
            l.parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid --listen {}: {}", l, e))?;
            cfg.listen = l.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_serve_gets_listen() {
        let p = ApiCliPlugin::new();
        assert!(p.applies_to("serve"));
        assert!(!p.applies_to("download"));
    }

    #[test]
    fn listen_must_be_a_socket_address() {
        let p = ApiCliPlugin::new();
        let m = p
            .augment_command(Command::new("serve"))
            .try_get_matches_from(["serve", "--listen", "127.0.0.1:9000"])
            .unwrap();
        let mut cfg = ServiceConfig::default();
        p.apply_matches(&m, &mut cfg).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");

        let m = p
            .augment_command(Command::new("serve"))
            .try_get_matches_from(["serve", "--listen", "localhost"])
            .unwrap();
        assert!(p.apply_matches(&m, &mut cfg).is_err());
    }
}
