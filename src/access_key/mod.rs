//! Access keys and service configurations
//!
//! An access key is either static (`ss://`, the whole transport config is
//! embedded) or dynamic (`ssconf://` or `https://`, the key points at a
//! location serving the config). [`parse_access_key`] turns the key into a
//! [`ServiceConfig`]; [`ConfigResolver::resolve`] turns that into a runnable
//! [`TunnelConfig`], fetching dynamic configs on every call.

pub mod fetch;
pub mod shadowsocks;

pub use fetch::{ConfigFetcher, HttpConfigFetcher};
pub use shadowsocks::{ShadowsocksConfig, ShadowsocksConfigParser, TunnelConfigParser};

use crate::error::{Result, VpnError};
use crate::tunnel::TunnelConfig;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Access key with the full transport config embedded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticServiceConfig {
    pub name: Option<String>,
    /// `host:port` of the first-hop proxy
    pub first_hop: String,
    /// Serialized transport descriptor handed to the backend
    pub client: String,
}

/// Access key pointing at a config location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicServiceConfig {
    pub name: Option<String>,
    /// Always `https`
    pub transport_config_location: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceConfig {
    Static(StaticServiceConfig),
    Dynamic(DynamicServiceConfig),
}

impl ServiceConfig {
    /// Display name carried by the access key, if any
    pub fn name(&self) -> Option<&str> {
        match self {
            ServiceConfig::Static(config) => config.name.as_deref(),
            ServiceConfig::Dynamic(config) => config.name.as_deref(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ServiceConfig::Dynamic(_))
    }

    /// Host of the first hop for static keys, or of the config location for
    /// dynamic ones
    pub fn host(&self) -> Option<String> {
        match self {
            ServiceConfig::Static(config) => split_host_port(&config.first_hop)
                .map(|(host, _)| host.to_string()),
            ServiceConfig::Dynamic(config) => {
                config.transport_config_location.host_str().map(str::to_string)
            }
        }
    }
}

impl FromStr for ServiceConfig {
    type Err = VpnError;

    /// Parse with the native Shadowsocks parser
    fn from_str(access_key: &str) -> Result<Self> {
        parse_access_key(access_key, &ShadowsocksConfigParser)
    }
}

/// Parse an access key into a [`ServiceConfig`].
///
/// The display name is the first `&`-separated fragment segment that is not
/// a `key=value` pair, percent-decoded. The fragment plays no part in
/// transport resolution.
///
/// # Errors
/// `InvalidServiceConfiguration` for a malformed key or unsupported scheme,
/// `ServerUrlInvalid` when a dynamic key's config location cannot be built.
pub fn parse_access_key(
    access_key: &str,
    parser: &dyn TunnelConfigParser,
) -> Result<ServiceConfig> {
    let mut url = Url::parse(access_key.trim())?;

    let name = match url.fragment() {
        Some(fragment) => name_from_fragment(fragment)?,
        None => None,
    };
    url.set_fragment(None);

    match url.scheme() {
        "ss" => {
            let tunnel_config = parser.parse_tunnel_config(url.as_str())?;
            Ok(ServiceConfig::Static(StaticServiceConfig {
                name,
                first_hop: tunnel_config.first_hop,
                client: tunnel_config.client,
            }))
        }
        "ssconf" | "https" => {
            let transport_config_location = to_https(&url)?;
            Ok(ServiceConfig::Dynamic(DynamicServiceConfig {
                name,
                transport_config_location,
            }))
        }
        other => Err(VpnError::invalid_config_msg(format!(
            "not a ss:// or ssconf:// URL (scheme '{other}')"
        ))),
    }
}

fn name_from_fragment(fragment: &str) -> Result<Option<String>> {
    let Some(segment) = fragment.split('&').find(|segment| !segment.contains('=')) else {
        return Ok(None);
    };
    let name = urlencoding::decode(segment)
        .map_err(|e| VpnError::invalid_config("access key name is not valid UTF-8", e))?;
    Ok(Some(name.into_owned()).filter(|name| !name.is_empty()))
}

/// `ssconf://` cannot be switched to `https` in place: the URL parser does
/// not allow moving between special and non-special schemes.
fn to_https(url: &Url) -> Result<Url> {
    let rest = &url[url::Position::AfterScheme..];
    let location = Url::parse(&format!("https{rest}"))
        .map_err(|e| VpnError::ServerUrlInvalid(format!("{url}: {e}")))?;
    if location.host_str().map_or(true, str::is_empty) {
        return Err(VpnError::ServerUrlInvalid(format!("{url}: missing host")));
    }
    Ok(location)
}

/// Split `host:port`, unbracketing IPv6 hosts
pub(crate) fn split_host_port(first_hop: &str) -> Option<(&str, u16)> {
    let (host, port) = first_hop.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host, port))
}

/// Resolves service configs into tunnel configs.
///
/// Nothing is cached: every call for a dynamic config fetches the location
/// again, which is how dynamic key servers rotate credentials.
#[derive(Clone)]
pub struct ConfigResolver {
    parser: Arc<dyn TunnelConfigParser>,
    fetcher: Arc<dyn ConfigFetcher>,
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver").finish_non_exhaustive()
    }
}

impl ConfigResolver {
    pub fn new(parser: Arc<dyn TunnelConfigParser>, fetcher: Arc<dyn ConfigFetcher>) -> Self {
        Self { parser, fetcher }
    }

    pub fn parse_access_key(&self, access_key: &str) -> Result<ServiceConfig> {
        parse_access_key(access_key, self.parser.as_ref())
    }

    pub async fn resolve(&self, service_config: &ServiceConfig) -> Result<TunnelConfig> {
        match service_config {
            ServiceConfig::Static(config) => Ok(TunnelConfig {
                client: config.client.clone(),
                first_hop: config.first_hop.clone(),
            }),
            ServiceConfig::Dynamic(config) => {
                let body = self.fetcher.fetch(&config.transport_config_location).await?;
                self.parser.parse_tunnel_config(&body)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fetcher that replays scripted responses and counts calls
    #[derive(Default)]
    pub struct ScriptedFetcher {
        pub responses: Mutex<VecDeque<Result<String>>>,
        pub calls: AtomicUsize,
        /// Never answer
        pub stall: AtomicBool,
    }

    impl ScriptedFetcher {
        pub fn with(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                stall: AtomicBool::new(false),
            })
        }

        /// Fetcher whose requests never complete
        pub fn stalled() -> Arc<Self> {
            let fetcher = Self::with(vec![]);
            fetcher.stall.store(true, Ordering::SeqCst);
            fetcher
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfigFetcher for ScriptedFetcher {
        async fn fetch(&self, location: &Url) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(VpnError::Other(format!("no scripted response for {location}")))
                })
        }
    }

    pub fn resolver_with(fetcher: Arc<ScriptedFetcher>) -> ConfigResolver {
        ConfigResolver::new(Arc::new(ShadowsocksConfigParser), fetcher)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::ServerApiError;

    const STATIC_KEY: &str =
        "ss://Y2hhY2hhMjAtaWV0Zi1wb2x5MTMwNTpwYXNzd29yZA@example.com:8388#MyServer";

    #[test]
    fn test_static_key() {
        let config: ServiceConfig = STATIC_KEY.parse().expect("parse");
        let ServiceConfig::Static(config) = config else {
            panic!("expected a static config");
        };
        assert_eq!(config.name.as_deref(), Some("MyServer"));
        assert_eq!(config.first_hop, "example.com:8388");
        assert!(config.client.contains("chacha20-ietf-poly1305"));
    }

    #[test]
    fn test_static_key_surrounding_whitespace() {
        let config: ServiceConfig = format!("  {STATIC_KEY}\n").parse().expect("parse");
        assert_eq!(config.name(), Some("MyServer"));
    }

    #[test]
    fn test_dynamic_key() {
        let config: ServiceConfig = "ssconf://example.com/conf#MyDyn".parse().expect("parse");
        let ServiceConfig::Dynamic(config) = config else {
            panic!("expected a dynamic config");
        };
        assert_eq!(config.name.as_deref(), Some("MyDyn"));
        assert_eq!(config.transport_config_location.scheme(), "https");
        assert_eq!(config.transport_config_location.host_str(), Some("example.com"));
        assert_eq!(config.transport_config_location.path(), "/conf");
        assert_eq!(config.transport_config_location.fragment(), None);
    }

    #[test]
    fn test_https_key_is_dynamic() {
        let config: ServiceConfig = "https://example.com:8443/k?x=1".parse().expect("parse");
        assert!(config.is_dynamic());
        assert_eq!(config.name(), None);
        assert_eq!(config.host().as_deref(), Some("example.com"));
    }

    #[test]
    fn test_name_skips_key_value_segments() {
        let config: ServiceConfig = "ssconf://example.com/conf#outline=1&My%20Server&x=y"
            .parse()
            .expect("parse");
        assert_eq!(config.name(), Some("My Server"));

        let config: ServiceConfig = "ssconf://example.com/conf#outline=1".parse().expect("parse");
        assert_eq!(config.name(), None);

        let config: ServiceConfig = "ssconf://example.com/conf#".parse().expect("parse");
        assert_eq!(config.name(), None);
    }

    #[test]
    fn test_invalid_keys() {
        for key in ["not a url", "http://example.com/conf", "vmess://abc"] {
            let err = key.parse::<ServiceConfig>().unwrap_err();
            assert!(
                matches!(err, VpnError::InvalidServiceConfiguration { .. }),
                "{key}: {err}"
            );
        }
    }

    #[test]
    fn test_ssconf_without_host_is_server_url_invalid() {
        // Opaque hosts accept characters a domain may not contain.
        for key in ["ssconf://exa%mple.com/conf#Bad", "ssconf:"] {
            let err = key.parse::<ServiceConfig>().unwrap_err();
            assert!(matches!(err, VpnError::ServerUrlInvalid(_)), "{key}: {err}");
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_host_port("[::1]:8388"), Some(("::1", 8388)));
        assert_eq!(split_host_port("example.com"), None);
    }

    #[tokio::test]
    async fn test_resolve_static_does_not_fetch() {
        let fetcher = ScriptedFetcher::with(vec![]);
        let resolver = resolver_with(fetcher.clone());

        let config = resolver.parse_access_key(STATIC_KEY).expect("parse");
        let tunnel = resolver.resolve(&config).await.expect("resolve");
        assert_eq!(tunnel.first_hop, "example.com:8388");
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_dynamic_fetches_every_time() {
        let body =
            r#"{"server":"1.2.3.4","server_port":1234,"password":"a","method":"aes-256-gcm"}"#;
        let rotated =
            r#"{"server":"5.6.7.8","server_port":1234,"password":"b","method":"aes-256-gcm"}"#;
        let fetcher = ScriptedFetcher::with(vec![Ok(body.to_string()), Ok(rotated.to_string())]);
        let resolver = resolver_with(fetcher.clone());

        let config = resolver
            .parse_access_key("ssconf://example.com/conf#Dyn")
            .expect("parse");
        assert_eq!(resolver.resolve(&config).await.expect("first").first_hop, "1.2.3.4:1234");
        assert_eq!(resolver.resolve(&config).await.expect("second").first_hop, "5.6.7.8:1234");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_resolve_dynamic_keeps_fetch_error_identity() {
        let fetcher = ScriptedFetcher::with(vec![Err(ServerApiError::BadStatus {
            url: "https://example.com/conf".to_string(),
            status: 403,
        }
        .into())]);
        let resolver = resolver_with(fetcher);

        let config = resolver
            .parse_access_key("ssconf://example.com/conf")
            .expect("parse");
        let err = resolver.resolve(&config).await.unwrap_err();
        assert!(matches!(
            err,
            VpnError::ServerApi(ServerApiError::BadStatus { status: 403, .. })
        ));
    }
}
