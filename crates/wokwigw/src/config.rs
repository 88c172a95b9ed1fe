//! Command line / environment configuration.
//!
//! [`Args`] is what the user typed; [`GatewayConfig`] is the validated, immutable value that is
//! handed to the backend and the server. Nothing here is global.

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use clap::{Parser, ValueEnum};
use url::Url;

use crate::{codec::DEFAULT_MAX_FRAME_LEN, stack::StackEndpoint, ConfigError};

pub const DEFAULT_LISTEN_PORT: u16 = 9011;
pub const DEFAULT_STACK_ENDPOINT: &str = "tcp://127.0.0.1:9012";

const DEFAULT_HOST_ADDR: Ipv4Addr = Ipv4Addr::new(10, 13, 37, 254);
const DEFAULT_GATEWAY_ADDR: Ipv4Addr = Ipv4Addr::new(10, 13, 37, 1);
const DEFAULT_GATEWAY_MAC: &str = "42:13:37:55:aa:01";
const DEFAULT_SUBNET: &str = "10.13.37.0/24";
const DEFAULT_FORWARD_PORT: u16 = 9080;
const DEFAULT_FORWARD_HOST: &str = "10.13.37.2";
const DEFAULT_FORWARD_REMOTE_PORT: u16 = 80;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "wokwigw",
    version,
    about = "Wokwi IoT Gateway",
    long_about = "Wokwi IoT Gateway\n\nConnect your Wokwi simulated IoT devices (e.g. ESP32) to your local network!"
)]
pub struct Args {
    /// Listening port (on local host).
    #[arg(
        long = "listenPort",
        visible_alias = "listen-port",
        env = "WOKWIGW_LISTEN_PORT",
        default_value_t = DEFAULT_LISTEN_PORT
    )]
    pub listen_port: u16,

    /// Listening address.
    #[arg(long, env = "WOKWIGW_LISTEN_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub listen_addr: IpAddr,

    /// Forward a host port into the simulated network, `[udp:]localPort:addr:remotePort`.
    ///
    /// May be repeated or comma separated. Not available in bridge mode.
    #[arg(long = "forward", value_name = "RULE", value_delimiter = ',')]
    pub forwards: Vec<ForwardRule>,

    /// How frames reach the network.
    #[arg(long, value_enum, env = "WOKWIGW_MODE", default_value_t = Mode::Stack)]
    pub mode: Mode,

    /// Requested TAP interface name (bridge mode). The kernel picks one when unset.
    #[arg(long, env = "WOKWIGW_TAP_NAME")]
    pub tap_name: Option<String>,

    /// Record every relayed frame to this pcap file.
    #[arg(long, env = "WOKWIGW_CAPTURE_FILE")]
    pub capture_file: Option<PathBuf>,

    /// Where the user-space network stack accepts guest attachments (stack mode).
    #[arg(long, env = "WOKWIGW_STACK_ENDPOINT", default_value = DEFAULT_STACK_ENDPOINT)]
    pub stack_endpoint: StackEndpoint,

    /// HTTP control API of the network stack, used to publish DNS zones and forwards.
    #[arg(long, env = "WOKWIGW_STACK_API")]
    pub stack_api: Option<Url>,

    /// Print the network stack's JSON launch configuration and exit (stack mode).
    #[arg(long)]
    pub print_stack_config: bool,

    /// Log filter (tracing-subscriber EnvFilter syntax). Falls back to `RUST_LOG`, then `info`.
    #[arg(long, env = "WOKWIGW_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// User-space network stack.
    Stack,
    /// Host TAP interface.
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One port-forward rule: host `local_port` to `remote_host:remote_port` inside the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardRule {
    /// Listen address on the host side, e.g. `:9080`.
    pub fn local(&self) -> String {
        format!(":{}", self.local_port)
    }

    /// Target inside the simulated network, e.g. `10.13.37.2:80`.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol == Protocol::Udp {
            f.write_str("udp:")?;
        }
        write!(f, "{}:{}", self.local_port, self.remote())
    }
}

impl FromStr for ForwardRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        // Same shape as `ssh -L`, so the splitting is done by hand.
        let mut parts: Vec<&str> = s.split(':').collect();
        let protocol = match parts.first() {
            Some(&"udp") => {
                parts.remove(0);
                Protocol::Udp
            }
            Some(&"tcp") => {
                parts.remove(0);
                Protocol::Tcp
            }
            _ => Protocol::Tcp,
        };

        let [local, host, remote] = parts.as_slice() else {
            return Err(ConfigError::ForwardSyntax(s.to_string()));
        };
        let local_port = local
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::ForwardLocalPort(s.to_string()))?;
        let remote_port = remote
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::ForwardRemotePort(s.to_string()))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::ForwardRemoteHost(s.to_string()));
        }

        Ok(Self {
            protocol,
            local_port,
            remote_host: host.to_string(),
            remote_port,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsZone {
    /// Fully qualified, with the trailing dot (`wokwi.internal.`).
    pub name: String,
    pub records: Vec<DnsRecord>,
}

/// Settings for the user-space network stack. The gateway does not interpret these; they are
/// passed to the stack when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub mtu: u32,
    pub subnet: String,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: String,
    pub gateway_virtual_ips: Vec<Ipv4Addr>,
    /// IP to MAC.
    pub dhcp_static_leases: BTreeMap<Ipv4Addr, String>,
    pub dns: Vec<DnsZone>,
    pub forwards: Vec<ForwardRule>,
    /// Virtual address inside the network to host address.
    pub nat: BTreeMap<Ipv4Addr, Ipv4Addr>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            subnet: DEFAULT_SUBNET.to_string(),
            gateway_ip: DEFAULT_GATEWAY_ADDR,
            gateway_mac: DEFAULT_GATEWAY_MAC.to_string(),
            gateway_virtual_ips: vec![DEFAULT_HOST_ADDR],
            dhcp_static_leases: BTreeMap::from([(
                Ipv4Addr::new(10, 13, 37, 2),
                "24:0a:c4:00:01:10".to_string(),
            )]),
            dns: vec![DnsZone {
                name: "wokwi.internal.".to_string(),
                records: vec![
                    DnsRecord {
                        name: "gateway".to_string(),
                        ip: DEFAULT_GATEWAY_ADDR,
                    },
                    DnsRecord {
                        name: "host".to_string(),
                        ip: DEFAULT_HOST_ADDR,
                    },
                ],
            }],
            forwards: vec![ForwardRule {
                protocol: Protocol::Tcp,
                local_port: DEFAULT_FORWARD_PORT,
                remote_host: DEFAULT_FORWARD_HOST.to_string(),
                remote_port: DEFAULT_FORWARD_REMOTE_PORT,
            }],
            nat: BTreeMap::from([(DEFAULT_HOST_ADDR, Ipv4Addr::LOCALHOST)]),
        }
    }
}

impl StackConfig {
    /// Add a forward; an existing rule for the same protocol and local port is replaced.
    pub fn add_forward(&mut self, rule: ForwardRule) {
        self.forwards
            .retain(|r| !(r.protocol == rule.protocol && r.local_port == rule.local_port));
        self.forwards.push(rule);
    }
}

#[derive(Debug, Clone)]
pub struct StackOptions {
    pub stack: StackConfig,
    pub endpoint: StackEndpoint,
    pub api: Option<Url>,
    pub capture_file: Option<PathBuf>,
    pub max_frame_len: usize,
}

/// Bridge mode has no forward field: the host interface is the network, there is nothing to
/// forward into.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub tap_name: Option<String>,
    pub capture_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Stack(StackOptions),
    Bridge(BridgeOptions),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendConfig,
}

impl GatewayConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let backend = match args.mode {
            Mode::Stack => {
                let mut stack = StackConfig::default();
                for rule in args.forwards {
                    stack.add_forward(rule);
                }
                BackendConfig::Stack(StackOptions {
                    stack,
                    endpoint: args.stack_endpoint,
                    api: args.stack_api,
                    capture_file: args.capture_file,
                    max_frame_len: DEFAULT_MAX_FRAME_LEN,
                })
            }
            Mode::Bridge => {
                if !args.forwards.is_empty() {
                    return Err(ConfigError::ForwardsInBridgeMode(args.forwards.len()));
                }
                BackendConfig::Bridge(BridgeOptions {
                    tap_name: args.tap_name,
                    capture_file: args.capture_file,
                })
            }
        };

        Ok(Self {
            listen_addr: SocketAddr::new(args.listen_addr, args.listen_port),
            backend,
        })
    }
}
