use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::PathBuf, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{io::copy_bidirectional, net::TcpStream};
use url::Url;

use super::{NetworkStack, StackError, StackFactory};
use crate::{
    config::{DnsZone, ForwardRule, Protocol, StackConfig},
    link::LinkEnd,
    ConfigError,
};

/// Where a stack daemon accepts guest attachments using the QEMU socket protocol (every frame
/// prefixed with its 4-byte big-endian length).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEndpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for StackEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::StackEndpoint(s.to_string());
        let url = Url::parse(s).map_err(|_| invalid())?;
        match url.scheme() {
            "tcp" => {
                let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
                let port = url.port().ok_or_else(invalid)?;
                Ok(Self::Tcp(format!("{host}:{port}")))
            }
            "unix" => match url.path() {
                "" | "/" => Err(invalid()),
                path => Ok(Self::Unix(PathBuf::from(path))),
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for StackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum DaemonStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl StackEndpoint {
    async fn connect(&self) -> Result<DaemonStream, StackError> {
        let connected = match self {
            Self::Tcp(addr) => TcpStream::connect(addr.as_str()).await.map(|stream| {
                let _ = stream.set_nodelay(true);
                DaemonStream::Tcp(stream)
            }),
            #[cfg(unix)]
            Self::Unix(path) => tokio::net::UnixStream::connect(path)
                .await
                .map(DaemonStream::Unix),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        };
        connected.map_err(|source| StackError::Connect {
            endpoint: self.clone(),
            source,
        })
    }
}

/// HTTP control API of the stack daemon.
#[derive(Debug)]
struct ControlApi {
    base: Url,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ZoneBody<'a> {
    name: &'a str,
    records: Vec<RecordBody<'a>>,
}

#[derive(Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "IP")]
    ip: Ipv4Addr,
}

impl<'a> From<&'a DnsZone> for ZoneBody<'a> {
    fn from(zone: &'a DnsZone) -> Self {
        Self {
            name: &zone.name,
            records: zone
                .records
                .iter()
                .map(|r| RecordBody {
                    name: &r.name,
                    ip: r.ip,
                })
                .collect(),
        }
    }
}

/// What the daemon must be started with, shaped like gvisor-tap-vsock's `types.Configuration`.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchConfig<'a> {
    #[serde(rename = "MTU")]
    mtu: u32,
    subnet: &'a str,
    #[serde(rename = "GatewayIP")]
    gateway_ip: Ipv4Addr,
    gateway_mac_address: &'a str,
    #[serde(rename = "DHCPStaticLeases")]
    dhcp_static_leases: &'a BTreeMap<Ipv4Addr, String>,
    #[serde(rename = "DNS")]
    dns: Vec<ZoneBody<'a>>,
    forwards: BTreeMap<String, String>,
    #[serde(rename = "NAT")]
    nat: &'a BTreeMap<Ipv4Addr, Ipv4Addr>,
    #[serde(rename = "GatewayVirtualIPs")]
    gateway_virtual_ips: &'a [Ipv4Addr],
    protocol: &'static str,
}

/// Render `config` as the daemon's JSON launch configuration.
///
/// The attachment socket carries frames only, so addressing, DHCP leases and NAT reach the
/// daemon this way, at launch. Its `Forwards` map is TCP only; UDP rules are published through
/// the control API.
pub fn launch_config(config: &StackConfig) -> serde_json::Result<String> {
    let launch = LaunchConfig {
        mtu: config.mtu,
        subnet: &config.subnet,
        gateway_ip: config.gateway_ip,
        gateway_mac_address: &config.gateway_mac,
        dhcp_static_leases: &config.dhcp_static_leases,
        dns: config.dns.iter().map(ZoneBody::from).collect(),
        forwards: config
            .forwards
            .iter()
            .filter(|rule| rule.protocol == Protocol::Tcp)
            .map(|rule| (rule.local(), rule.remote()))
            .collect(),
        nat: &config.nat,
        gateway_virtual_ips: &config.gateway_virtual_ips,
        protocol: "qemu",
    };
    serde_json::to_string_pretty(&launch)
}

#[derive(Serialize)]
struct ExposeBody {
    local: String,
    remote: String,
    protocol: &'static str,
}

#[derive(Serialize)]
struct UnexposeBody {
    local: String,
    protocol: &'static str,
}

impl ControlApi {
    fn new(base: Url) -> Self {
        Self {
            base,
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), StackError> {
        let url = self.base.join(path)?;
        self.client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| StackError::Api {
                url: url.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn add_zone(&self, zone: &DnsZone) -> Result<(), StackError> {
        self.post("services/dns/add", &ZoneBody::from(zone)).await
    }

    async fn expose(&self, rule: &ForwardRule) -> Result<(), StackError> {
        let body = ExposeBody {
            local: rule.local(),
            remote: rule.remote(),
            protocol: rule.protocol.as_str(),
        };
        self.post("services/forwarder/expose", &body).await
    }

    async fn unexpose(&self, rule: &ForwardRule) -> Result<(), StackError> {
        let body = UnexposeBody {
            local: rule.local(),
            protocol: rule.protocol.as_str(),
        };
        self.post("services/forwarder/unexpose", &body).await
    }

    /// Best effort; every rule is attempted.
    async fn withdraw(&self, rules: &[ForwardRule]) -> Result<(), StackError> {
        let mut failed = Vec::new();
        for rule in rules {
            if let Err(err) = self.unexpose(rule).await {
                tracing::warn!(%rule, "failed to withdraw forward: {err}");
                failed.push(err);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StackError::Withdraw(failed))
        }
    }
}

/// Creates [`QemuSocketStack`]s. With an API URL the stack's DNS zones and forwards are
/// published through it; without one the daemon is expected to be configured already.
#[derive(Debug, Clone)]
pub struct QemuSocketFactory {
    endpoint: StackEndpoint,
    api: Option<Url>,
}

impl QemuSocketFactory {
    pub fn new(endpoint: StackEndpoint, api: Option<Url>) -> Self {
        Self { endpoint, api }
    }
}

#[async_trait]
impl StackFactory for QemuSocketFactory {
    async fn create(&self, config: &StackConfig) -> Result<Arc<dyn NetworkStack>, StackError> {
        // Fail at startup, not on the first connection.
        drop(self.endpoint.connect().await?);

        let api = self.api.clone().map(ControlApi::new);
        let mut exposed = Vec::new();
        match &api {
            Some(api) => {
                for zone in &config.dns {
                    api.add_zone(zone).await?;
                }
                for rule in &config.forwards {
                    if let Err(err) = api.expose(rule).await {
                        let _ = api.withdraw(&exposed).await;
                        return Err(err);
                    }
                    tracing::info!(%rule, "forwarding {} to {}", rule.local(), rule.remote());
                    exposed.push(rule.clone());
                }
            }
            None if !config.forwards.is_empty() => {
                tracing::warn!(
                    rules = config.forwards.len(),
                    "no stack API configured; forwards must be set up on the stack itself"
                );
            }
            None => {}
        }

        tracing::info!(
            endpoint = %self.endpoint,
            subnet = %config.subnet,
            gateway = %config.gateway_ip,
            "network stack ready; it must have been launched with --print-stack-config output"
        );
        Ok(Arc::new(QemuSocketStack {
            endpoint: self.endpoint.clone(),
            api,
            exposed,
        }))
    }
}

/// A stack daemon reached over a socket. Every guest gets its own daemon connection.
#[derive(Debug)]
pub struct QemuSocketStack {
    endpoint: StackEndpoint,
    api: Option<ControlApi>,
    exposed: Vec<ForwardRule>,
}

#[async_trait]
impl NetworkStack for QemuSocketStack {
    async fn accept_guest(&self, mut link: LinkEnd) -> Result<(), StackError> {
        let copied = match self.endpoint.connect().await? {
            DaemonStream::Tcp(mut stream) => copy_bidirectional(&mut link, &mut stream).await,
            #[cfg(unix)]
            DaemonStream::Unix(mut stream) => copy_bidirectional(&mut link, &mut stream).await,
        };
        link.close();

        let (to_stack, to_guest) = copied.map_err(StackError::Attachment)?;
        tracing::debug!(to_stack, to_guest, "guest detached from network stack");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StackError> {
        match &self.api {
            Some(api) => api.withdraw(&self.exposed).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::link::DuplexLink;

    async fn echo_daemon() -> StackEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        StackEndpoint::Tcp(addr.to_string())
    }

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    async fn control_api() -> (Url, Calls) {
        let calls: Calls = Arc::default();
        let record = |path: &'static str| {
            move |State(calls): State<Calls>, Json(body): Json<Value>| async move {
                calls.lock().unwrap().push((path.to_string(), body));
            }
        };
        let app = Router::new()
            .route("/services/dns/add", post(record("dns/add")))
            .route("/services/forwarder/expose", post(record("expose")))
            .route("/services/forwarder/unexpose", post(record("unexpose")))
            .with_state(calls.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), calls)
    }

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            "tcp://127.0.0.1:9012".parse::<StackEndpoint>().unwrap(),
            StackEndpoint::Tcp("127.0.0.1:9012".into())
        );
        assert_eq!(
            "unix:///run/gvproxy.sock".parse::<StackEndpoint>().unwrap(),
            StackEndpoint::Unix("/run/gvproxy.sock".into())
        );
        assert_eq!(
            "tcp://127.0.0.1:9012".parse::<StackEndpoint>().unwrap().to_string(),
            "tcp://127.0.0.1:9012"
        );
        for bad in ["127.0.0.1:9012", "tcp://127.0.0.1", "unix://", "http://x:1"] {
            assert!(bad.parse::<StackEndpoint>().is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn create_fails_when_daemon_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = QemuSocketFactory::new(StackEndpoint::Tcp(addr.to_string()), None);
        let Err(err) = factory.create(&StackConfig::default()).await else {
            panic!("created a stack without a daemon");
        };
        assert!(matches!(err, StackError::Connect { .. }), "{err:?}");
    }

    #[test]
    fn launch_config_carries_the_whole_network_layout() {
        let mut config = StackConfig::default();
        config.add_forward("udp:5353:10.13.37.2:53".parse().unwrap());
        config.add_forward("8443:10.13.37.3:443".parse().unwrap());

        let launch: Value = serde_json::from_str(&launch_config(&config).unwrap()).unwrap();
        assert_eq!(
            launch,
            json!({
                "MTU": 1500,
                "Subnet": "10.13.37.0/24",
                "GatewayIP": "10.13.37.1",
                "GatewayMacAddress": "42:13:37:55:aa:01",
                "DHCPStaticLeases": {"10.13.37.2": "24:0a:c4:00:01:10"},
                "DNS": [{
                    "Name": "wokwi.internal.",
                    "Records": [
                        {"Name": "gateway", "IP": "10.13.37.1"},
                        {"Name": "host", "IP": "10.13.37.254"},
                    ],
                }],
                "Forwards": {":8443": "10.13.37.3:443", ":9080": "10.13.37.2:80"},
                "NAT": {"10.13.37.254": "127.0.0.1"},
                "GatewayVirtualIPs": ["10.13.37.254"],
                "Protocol": "qemu",
            })
        );
    }

    #[tokio::test]
    async fn attachment_carries_bytes_both_ways() {
        let factory = QemuSocketFactory::new(echo_daemon().await, None);
        let stack = factory.create(&StackConfig::default()).await.unwrap();

        let (near, mut far) = DuplexLink::pair(1024);
        let attached = tokio::spawn({
            let stack = stack.clone();
            async move { stack.accept_guest(near).await }
        });

        far.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 7];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 3, 1, 2, 3]);

        far.shutdown().await.unwrap();
        attached.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publishes_zones_and_forwards_then_withdraws() {
        let (api, calls) = control_api().await;
        let factory = QemuSocketFactory::new(echo_daemon().await, Some(api));

        let stack = factory.create(&StackConfig::default()).await.unwrap();
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].0, "dns/add");
            assert_eq!(
                calls[0].1,
                json!({
                    "Name": "wokwi.internal.",
                    "Records": [
                        {"Name": "gateway", "IP": "10.13.37.1"},
                        {"Name": "host", "IP": "10.13.37.254"},
                    ],
                })
            );
            assert_eq!(
                calls[1],
                (
                    "expose".to_string(),
                    json!({"local": ":9080", "remote": "10.13.37.2:80", "protocol": "tcp"})
                )
            );
        }

        stack.shutdown().await.unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[2],
            (
                "unexpose".to_string(),
                json!({"local": ":9080", "protocol": "tcp"})
            )
        );
    }
}
