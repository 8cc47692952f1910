use std::{fs::read_to_string, net::SocketAddr};

use clap::Parser;
use serde::Deserialize;
use service::RuleMode;

#[derive(Deserialize, Debug)]
pub struct Tunnel {
    /// udp listen address
    ///
    /// the address and port the shared udp socket binds to. both halves of
    /// a deployment bind one of these; everything else rides on it.
    #[serde(default = "Tunnel::bind")]
    pub bind: SocketAddr,

    /// peer forwarder address
    ///
    /// where the opposite forwarder lives. when set, the udp socket is
    /// connected to it at startup; when left out, the peer is learned from
    /// the first packet heard on the socket (useful behind a hole-punched
    /// path where only the remote side dials in).
    #[serde(default)]
    pub peer: Option<SocketAddr>,
}

impl Tunnel {
    fn bind() -> SocketAddr {
        "0.0.0.0:8930".parse().unwrap()
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self {
            bind: Self::bind(),
            peer: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    pub fn as_rule_mode(&self) -> RuleMode {
        match *self {
            Self::Client => RuleMode::Client,
            Self::Server => RuleMode::Server,
        }
    }
}

/// one forward rule.
///
/// client mode listens on `address` and tunnels every accepted connection
/// to the peer under `service`; server mode answers tunneled connects for
/// `service` by dialing `address`.
#[derive(Deserialize, Debug, Clone)]
pub struct Forward {
    pub mode: Mode,
    pub service: String,
    pub address: SocketAddr,
}

#[derive(Deserialize, Debug)]
pub struct Options {
    /// timeout for udp packet wait response, in milliseconds.
    /// 10 - 30000, default 500.
    #[serde(default = "Options::udp_timeout")]
    pub udp_timeout: u64,

    /// retries for resent udp packets. 0 - 20, default 3.
    #[serde(default = "Options::udp_retries")]
    pub udp_retries: u64,

    /// slide window for udp packets. 1 - 64, default 16.
    #[serde(default = "Options::slide_window")]
    pub slide_window: u64,

    /// session timeout in seconds. 10 - 86400, default 900.
    #[serde(default = "Options::session_timeout")]
    pub session_timeout: u64,

    /// debug option: simulate a delay on outbound udp, in milliseconds.
    /// default 0.
    #[serde(default)]
    pub debug_delay: u64,

    /// debug option: simulate packet loss, per 10000. default 0.
    #[serde(default)]
    pub debug_packet_loss: u64,

    /// debug option: simulate bandwidth in bps, 0 is unlimited. default 0.
    #[serde(default)]
    pub debug_bandwidth: u64,
}

impl Options {
    fn udp_timeout() -> u64 {
        500
    }

    fn udp_retries() -> u64 {
        3
    }

    fn slide_window() -> u64 {
        16
    }

    fn session_timeout() -> u64 {
        900
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            udp_timeout: Self::udp_timeout(),
            udp_retries: Self::udp_retries(),
            slide_window: Self::slide_window(),
            session_timeout: Self::session_timeout(),
            debug_delay: 0,
            debug_packet_loss: 0,
            debug_bandwidth: 0,
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub tunnel: Tunnel,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub rules: Vec<Forward>,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> anyhow::Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: Config = serde_json5::from_str(
            r#"
            {
                tunnel: {
                    bind: "127.0.0.1:8930",
                    peer: "127.0.0.1:8931",
                },
                options: {
                    udp_timeout: 200,
                    slide_window: 32,
                },
                rules: [
                    { mode: "client", service: "ssh", address: "127.0.0.1:7000" },
                    { mode: "server", service: "web", address: "127.0.0.1:80" },
                ],
                log: { level: "Debug" },
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.bind, "127.0.0.1:8930".parse().unwrap());
        assert_eq!(config.tunnel.peer, Some("127.0.0.1:8931".parse().unwrap()));
        assert_eq!(config.options.udp_timeout, 200);
        assert_eq!(config.options.slide_window, 32);
        // omitted options keep their defaults.
        assert_eq!(config.options.udp_retries, 3);
        assert_eq!(config.options.session_timeout, 900);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].mode, Mode::Client);
        assert_eq!(config.rules[1].service, "web");
        assert_eq!(config.log.level.as_level(), log::Level::Debug);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tunnel.bind, "0.0.0.0:8930".parse().unwrap());
        assert!(config.tunnel.peer.is_none());
        assert!(config.rules.is_empty());
    }
}
