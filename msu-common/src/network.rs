//! Uplink classification heuristics.
//!
//! Two read-only probes decide whether the device is on a connection that
//! should not carry large software downloads:
//!
//! - a cellular (WWAN) uplink, detected by the presence of the
//!   point-to-point interface. Some VPN clients reuse the same interface
//!   name, so false positives are expected.
//! - an Android phone acting as a Wi-Fi hotspot, detected by the hotspot's
//!   fixed subnet on the wireless interface plus the phone's resolver
//!   answering a `version.bind` query with a dnsmasq version string.
//!
//! A missing interface is a plain `false`, never an error.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

pub const ANDROID_WAP_NETWORK: Ipv4Addr = Ipv4Addr::new(192, 168, 43, 0);
pub const ANDROID_WAP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const ANDROID_WAP_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 43, 1);
pub const VERSION_QUERY_NAME: &str = "version.bind";
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

static ANDROID_RESOLVER_SIGNATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"?dnsmasq-\d"#).expect("valid resolver signature regex"));

/// IPv4 address and netmask bound to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Config {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Ipv4Config {
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.netmask))
    }

    pub fn is_in(&self, network: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        self.netmask == netmask && self.network() == network
    }
}

/// Read-only view of local network interfaces.
pub trait InterfaceInspector {
    /// Whether the interface exists and answers a status query.
    fn interface_active(&self, name: &str) -> impl Future<Output = bool> + Send;

    /// First IPv4 address of the interface, if any.
    fn ipv4_config(&self, name: &str) -> impl Future<Output = Option<Ipv4Config>> + Send;
}

/// TXT lookups against a specific resolver.
pub trait DnsProbe {
    /// Raw answer text, or `None` on timeout, failure, or empty answer.
    fn query_txt(
        &self,
        server: Ipv4Addr,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = Option<String>> + Send;
}

/// Whether a `version.bind` answer came from Android's tethering resolver.
pub fn is_android_resolver(answer: &str) -> bool {
    answer
        .lines()
        .any(|line| ANDROID_RESOLVER_SIGNATURE.is_match(line.trim()))
}

/// Classifies the current uplink.
pub struct NetworkClassifier<I, D> {
    interfaces: I,
    dns: D,
    cellular_interface: String,
    wifi_interface: String,
    dns_timeout: Duration,
}

impl<I: InterfaceInspector, D: DnsProbe> NetworkClassifier<I, D> {
    pub fn new(interfaces: I, dns: D) -> Self {
        Self {
            interfaces,
            dns,
            cellular_interface: "ppp0".to_string(),
            wifi_interface: "en0".to_string(),
            dns_timeout: DEFAULT_DNS_TIMEOUT,
        }
    }

    pub fn with_interfaces(mut self, cellular: impl Into<String>, wifi: impl Into<String>) -> Self {
        self.cellular_interface = cellular.into();
        self.wifi_interface = wifi.into();
        self
    }

    pub fn with_dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    pub fn cellular_interface(&self) -> &str {
        &self.cellular_interface
    }

    pub fn wifi_interface(&self) -> &str {
        &self.wifi_interface
    }

    /// True when the point-to-point interface is up.
    pub async fn is_on_cellular_uplink(&self) -> bool {
        let active = self.interfaces.interface_active(&self.cellular_interface).await;
        if active {
            info!(interface = %self.cellular_interface, "Point-to-point interface active");
        } else {
            debug!(interface = %self.cellular_interface, "No point-to-point interface");
        }
        active
    }

    /// True only when the hotspot subnet matches AND the gateway's resolver
    /// identifies itself as Android's dnsmasq.
    pub async fn is_on_tethered_wap(&self) -> bool {
        let Some(config) = self.interfaces.ipv4_config(&self.wifi_interface).await else {
            debug!(interface = %self.wifi_interface, "Wireless interface has no IPv4 address");
            return false;
        };
        if !config.is_in(ANDROID_WAP_NETWORK, ANDROID_WAP_NETMASK) {
            debug!(
                interface = %self.wifi_interface,
                addr = %config.addr,
                netmask = %config.netmask,
                "Wireless subnet is not a tethering subnet"
            );
            return false;
        }

        let answer = self
            .dns
            .query_txt(ANDROID_WAP_GATEWAY, VERSION_QUERY_NAME, self.dns_timeout)
            .await;
        match answer {
            Some(answer) if is_android_resolver(&answer) => {
                info!(
                    interface = %self.wifi_interface,
                    resolver = %answer.trim(),
                    "Tethered Android access point detected"
                );
                true
            }
            Some(answer) => {
                debug!(resolver = %answer.trim(), "Tethering subnet but resolver is not Android's");
                false
            }
            None => {
                debug!("Tethering subnet but gateway resolver did not answer");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeInterfaces {
        active: Vec<String>,
        ipv4: HashMap<String, Ipv4Config>,
    }

    impl InterfaceInspector for FakeInterfaces {
        async fn interface_active(&self, name: &str) -> bool {
            self.active.iter().any(|n| n == name)
        }

        async fn ipv4_config(&self, name: &str) -> Option<Ipv4Config> {
            self.ipv4.get(name).copied()
        }
    }

    struct FakeDns {
        answer: Option<String>,
        queries: Mutex<Vec<(Ipv4Addr, String, Duration)>>,
    }

    impl FakeDns {
        fn answering(answer: Option<&str>) -> Self {
            Self {
                answer: answer.map(str::to_string),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    impl DnsProbe for FakeDns {
        async fn query_txt(&self, server: Ipv4Addr, name: &str, timeout: Duration) -> Option<String> {
            self.queries
                .lock()
                .unwrap()
                .push((server, name.to_string(), timeout));
            self.answer.clone()
        }
    }

    fn wifi(addr: [u8; 4], mask: [u8; 4]) -> FakeInterfaces {
        let mut ipv4 = HashMap::new();
        ipv4.insert(
            "en0".to_string(),
            Ipv4Config {
                addr: Ipv4Addr::from(addr),
                netmask: Ipv4Addr::from(mask),
            },
        );
        FakeInterfaces {
            active: vec!["en0".to_string()],
            ipv4,
        }
    }

    #[test]
    fn test_network_math() {
        let cfg = Ipv4Config {
            addr: Ipv4Addr::new(192, 168, 43, 57),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        };
        assert_eq!(cfg.network(), Ipv4Addr::new(192, 168, 43, 0));
        assert!(cfg.is_in(ANDROID_WAP_NETWORK, ANDROID_WAP_NETMASK));

        let wider = Ipv4Config {
            netmask: Ipv4Addr::new(255, 255, 0, 0),
            ..cfg
        };
        assert!(!wider.is_in(ANDROID_WAP_NETWORK, ANDROID_WAP_NETMASK));
    }

    #[test]
    fn test_resolver_signature() {
        assert!(is_android_resolver("\"dnsmasq-2.51\"\n"));
        assert!(is_android_resolver("dnsmasq-2.78"));
        assert!(!is_android_resolver("\"9.16.1-Ubuntu\""));
        assert!(!is_android_resolver("\"dnsmasq-pi\""));
        assert!(!is_android_resolver(""));
    }

    #[tokio::test]
    async fn test_cellular_present() {
        let interfaces = FakeInterfaces {
            active: vec!["ppp0".to_string()],
            ..Default::default()
        };
        let classifier = NetworkClassifier::new(interfaces, FakeDns::answering(None));
        assert!(classifier.is_on_cellular_uplink().await);
    }

    #[tokio::test]
    async fn test_cellular_absent() {
        let classifier =
            NetworkClassifier::new(FakeInterfaces::default(), FakeDns::answering(None));
        assert!(!classifier.is_on_cellular_uplink().await);
    }

    #[tokio::test]
    async fn test_cellular_uses_configured_interface() {
        let interfaces = FakeInterfaces {
            active: vec!["ppp0".to_string()],
            ..Default::default()
        };
        let classifier = NetworkClassifier::new(interfaces, FakeDns::answering(None))
            .with_interfaces("wwan0", "en1");
        assert!(!classifier.is_on_cellular_uplink().await);
    }

    #[tokio::test]
    async fn test_tethered_requires_subnet_and_dns() {
        let classifier = NetworkClassifier::new(
            wifi([192, 168, 43, 20], [255, 255, 255, 0]),
            FakeDns::answering(Some("\"dnsmasq-2.51\"")),
        );
        assert!(classifier.is_on_tethered_wap().await);

        let queries = classifier.dns.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].0, ANDROID_WAP_GATEWAY);
        assert_eq!(queries[0].1, "version.bind");
        assert_eq!(queries[0].2, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_subnet_match_without_dns_answer_is_false() {
        let classifier = NetworkClassifier::new(
            wifi([192, 168, 43, 20], [255, 255, 255, 0]),
            FakeDns::answering(None),
        );
        assert!(!classifier.is_on_tethered_wap().await);
    }

    #[tokio::test]
    async fn test_subnet_match_with_foreign_resolver_is_false() {
        let classifier = NetworkClassifier::new(
            wifi([192, 168, 43, 20], [255, 255, 255, 0]),
            FakeDns::answering(Some("\"unbound 1.13\"")),
        );
        assert!(!classifier.is_on_tethered_wap().await);
    }

    #[tokio::test]
    async fn test_other_subnet_skips_dns_probe() {
        let classifier = NetworkClassifier::new(
            wifi([10, 0, 0, 5], [255, 255, 255, 0]),
            FakeDns::answering(Some("\"dnsmasq-2.51\"")),
        );
        assert!(!classifier.is_on_tethered_wap().await);
        assert!(classifier.dns.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_wifi_interface_is_false() {
        let classifier = NetworkClassifier::new(
            FakeInterfaces::default(),
            FakeDns::answering(Some("\"dnsmasq-2.51\"")),
        );
        assert!(!classifier.is_on_tethered_wap().await);
    }
}
