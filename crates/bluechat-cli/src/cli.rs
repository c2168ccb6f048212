//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bluechat", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Scan for nearby chat servers
    Scan {
        /// How long to scan, in seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// List paired and connected devices
    Devices,
    /// Host the chat service and broadcast lines typed on stdin
    Serve,
    /// Connect to a chat server and send lines typed on stdin
    Connect {
        /// Address of the server, e.g. AA:BB:CC:DD:EE:FF
        peer: String,
    },
    /// Run a client and a server against an in-process radio
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let cli = Cli::try_parse_from(["bluechat", "-v", "connect", "AA:BB"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(
            cli.command,
            Commands::Connect {
                peer: "AA:BB".to_string()
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["bluechat", "scan", "--seconds", "3", "--config", "x.toml"])
                .unwrap();
        assert_eq!(cli.command, Commands::Scan { seconds: Some(3) });
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
    }

    #[test]
    fn test_connect_requires_peer() {
        assert!(Cli::try_parse_from(["bluechat", "connect"]).is_err());
    }
}
