//! Shadowsocks transport config parsing
//!
//! Turns an `ss://` key or a dynamic-key JSON document into a
//! [`TunnelConfig`]. This is a pure text transform: no I/O happens here.

use crate::error::{IntoVpnError, Result, ServerApiError, VpnError};
use crate::tunnel::TunnelConfig;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use url::{Host, Url};

/// Ciphers the tunnel backends accept
pub const SUPPORTED_CIPHERS: &[&str] = &[
    "chacha20-ietf-poly1305",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
];

/// Text to [`TunnelConfig`] transform shared by static and dynamic keys
pub trait TunnelConfigParser: Send + Sync {
    fn parse_tunnel_config(&self, text: &str) -> Result<TunnelConfig>;
}

/// Shadowsocks endpoint description, serialized into [`TunnelConfig::client`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksConfig {
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub method: String,
    /// Salt prefix used to disguise the first packet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl ShadowsocksConfig {
    fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(VpnError::invalid_config_msg("server host is empty"));
        }
        if self.server_port == 0 {
            return Err(VpnError::invalid_config_msg("server port cannot be zero"));
        }
        if !SUPPORTED_CIPHERS.contains(&self.method.as_str()) {
            return Err(VpnError::invalid_config_msg(format!(
                "unsupported cipher '{}'",
                self.method
            )));
        }
        Ok(())
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn first_hop(&self) -> String {
        if self.server.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.server, self.server_port)
        } else {
            format!("{}:{}", self.server, self.server_port)
        }
    }

    pub fn into_tunnel_config(self) -> Result<TunnelConfig> {
        self.validate()?;
        let first_hop = self.first_hop();
        let client = serde_json::to_string(&self).into_vpn_error("Failed to encode client config")?;
        Ok(TunnelConfig { client, first_hop })
    }
}

/// Error document served by dynamic key servers
#[derive(Debug, Deserialize)]
struct ErrorDocument {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Native parser for `ss://` keys and dynamic-key JSON bodies
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowsocksConfigParser;

impl TunnelConfigParser for ShadowsocksConfigParser {
    fn parse_tunnel_config(&self, text: &str) -> Result<TunnelConfig> {
        let text = text.trim();
        if text.starts_with('{') {
            parse_json_config(text)?.into_tunnel_config()
        } else if text.starts_with("ss://") {
            parse_ss_url(text)?.into_tunnel_config()
        } else {
            Err(VpnError::invalid_config_msg(
                "transport config is neither an ss:// URL nor a JSON document",
            ))
        }
    }
}

fn parse_json_config(text: &str) -> Result<ShadowsocksConfig> {
    if let Ok(doc) = serde_json::from_str::<ErrorDocument>(text) {
        return Err(ServerApiError::SessionProvider {
            message: doc.error.message,
        }
        .into());
    }

    serde_json::from_str(text)
        .map_err(|e| VpnError::invalid_config("invalid JSON transport config", e))
}

fn parse_ss_url(text: &str) -> Result<ShadowsocksConfig> {
    let url = Url::parse(text).map_err(|e| VpnError::invalid_config("invalid ss:// URL", e))?;

    if url.username().is_empty() {
        return parse_legacy_ss_url(text);
    }

    if url.query_pairs().any(|(key, _)| key == "plugin") {
        return Err(VpnError::invalid_config_msg("ss:// plugins are not supported"));
    }

    // A plain `method:password` user info is split by the URL parser.
    let raw_user_info = match url.password() {
        Some(password) => format!("{}:{}", url.username(), password),
        None => url.username().to_string(),
    };
    let user_info = urlencoding::decode(&raw_user_info)
        .map_err(|e| VpnError::invalid_config("invalid ss:// user info encoding", e))?;
    let credentials = if user_info.contains(':') {
        user_info.into_owned()
    } else {
        decode_base64(&user_info)
            .ok_or_else(|| VpnError::invalid_config_msg("ss:// user info is not valid base64"))?
    };
    let (method, password) = split_credentials(&credentials)?;

    let server = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(VpnError::invalid_config_msg("ss:// URL has no host")),
    };
    let server_port = url
        .port()
        .ok_or_else(|| VpnError::invalid_config_msg("ss:// URL has no port"))?;
    let prefix = url
        .query_pairs()
        .find(|(key, _)| key == "prefix")
        .map(|(_, value)| value.into_owned());

    Ok(ShadowsocksConfig {
        server,
        server_port,
        password,
        method,
        prefix,
    })
}

/// `ss://base64(method:password@host:port)`
fn parse_legacy_ss_url(text: &str) -> Result<ShadowsocksConfig> {
    let encoded = text
        .trim_start_matches("ss://")
        .split(['#', '?'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    let decoded = decode_base64(encoded)
        .ok_or_else(|| VpnError::invalid_config_msg("legacy ss:// body is not valid base64"))?;

    let (credentials, endpoint) = decoded
        .rsplit_once('@')
        .ok_or_else(|| VpnError::invalid_config_msg("legacy ss:// body has no '@'"))?;
    let (method, password) = split_credentials(credentials)?;

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| VpnError::invalid_config_msg("legacy ss:// body has no port"))?;
    let server_port = port
        .parse::<u16>()
        .map_err(|e| VpnError::invalid_config("invalid port in legacy ss:// body", e))?;
    let server = host.trim_start_matches('[').trim_end_matches(']').to_string();

    Ok(ShadowsocksConfig {
        server,
        server_port,
        password,
        method,
        prefix: None,
    })
}

fn split_credentials(credentials: &str) -> Result<(String, String)> {
    let (method, password) = credentials
        .split_once(':')
        .ok_or_else(|| VpnError::invalid_config_msg("credentials must be method:password"))?;
    Ok((method.to_ascii_lowercase(), password.to_string()))
}

/// Standard or URL-safe alphabet, padded or not
fn decode_base64(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_end_matches('=');
    let bytes = general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .ok()?;
    String::from_utf8(bytes).ok()
}
