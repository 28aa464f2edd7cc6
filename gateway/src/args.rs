use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Relay gateway between chat clients and model vendors.
#[derive(Debug, Parser)]
#[command(name = "gateway", version)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GATEWAY_CONFIG_PATH", default_value = "./gateway.toml")]
    pub config: PathBuf,

    /// Address to listen on. Overrides `server.listen_address`.
    #[arg(short, long, env = "GATEWAY_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "relay=debug,server=info".
    #[arg(long, env = "GATEWAY_LOG", default_value = "info")]
    pub log: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn listen_address_overrides() {
        let args = Args::parse_from(["gateway", "--config", "relay.toml", "-l", "0.0.0.0:9000"]);

        assert_eq!(args.config, PathBuf::from("relay.toml"));
        assert_eq!(args.listen_address, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(args.log, "info");
    }
}
