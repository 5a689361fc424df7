use clap::Parser;
use serde::*;
use std::{fs::read_to_string, net::SocketAddr};

#[derive(Deserialize, Debug)]
pub struct Coap {
    /// endpoint listen address
    ///
    /// the address and port bound by the UDP socket. the bound address
    /// supports ipv4 and ipv6; the default is the well-known coap port on
    /// every interface.
    #[serde(default = "Coap::listen")]
    pub listen: SocketAddr,

    /// join the all-coap-nodes multicast group
    ///
    /// when enabled the endpoint additionally receives requests addressed
    /// to 224.0.1.187 (or FF00::FD for an ipv6 bind) so it can take part
    /// in group discovery.
    #[serde(default)]
    pub multicast: bool,

    /// first message id
    ///
    /// the seed of the sequential MID generator. mostly useful to make
    /// test runs reproducible; when unset a random seed is drawn.
    #[serde(default)]
    pub starting_mid: Option<u16>,
}

impl Coap {
    fn listen() -> SocketAddr {
        "0.0.0.0:5683".parse().unwrap()
    }
}

impl Default for Coap {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            multicast: false,
            starting_mid: None,
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
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
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
    pub coap: Coap,
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
        let payload = Cli::parse()
            .config
            .map(read_to_string)
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());

        Ok(serde_json5::from_str(&payload)?)
    }
}
