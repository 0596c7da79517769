//! Error types and handling for the sstunnel client core

use std::time::Duration;
use thiserror::Error;

/// Error codes reported by the native tunnel backend.
///
/// The numeric values are the ones the platform backends emit, so a code
/// received over a bridge can be mapped back with [`BackendErrorCode::from_code`].
#[repr(i32)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorCode {
    #[error("no error")]
    NoError = 0,
    #[error("unexpected backend error")]
    Unexpected = 1,
    #[error("VPN permission not granted")]
    VpnPermissionNotGranted = 2,
    #[error("invalid server credentials")]
    InvalidServerCredentials = 3,
    #[error("UDP relay not enabled on server")]
    UdpRelayNotEnabled = 4,
    #[error("server unreachable")]
    ServerUnreachable = 5,
    #[error("VPN failed to start")]
    VpnStartFailure = 6,
    #[error("illegal server configuration")]
    IllegalServerConfiguration = 7,
    #[error("shadowsocks failed to start")]
    ShadowsocksStartFailure = 8,
    #[error("failed to configure system proxy")]
    ConfigureSystemProxyFailure = 9,
    #[error("no admin permissions")]
    NoAdminPermissions = 10,
    #[error("unsupported routing table")]
    UnsupportedRoutingTable = 11,
    #[error("system misconfigured")]
    SystemMisconfigured = 12,
}

impl BackendErrorCode {
    /// Numeric code as emitted by the platform backend
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw backend code, treating unknown values as `Unexpected`
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::NoError,
            2 => Self::VpnPermissionNotGranted,
            3 => Self::InvalidServerCredentials,
            4 => Self::UdpRelayNotEnabled,
            5 => Self::ServerUnreachable,
            6 => Self::VpnStartFailure,
            7 => Self::IllegalServerConfiguration,
            8 => Self::ShadowsocksStartFailure,
            9 => Self::ConfigureSystemProxyFailure,
            10 => Self::NoAdminPermissions,
            11 => Self::UnsupportedRoutingTable,
            12 => Self::SystemMisconfigured,
            _ => Self::Unexpected,
        }
    }
}

/// Failures while fetching a dynamic access key's transport config
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerApiError {
    /// The request never produced a response (DNS, connect, TLS, read)
    #[error("no response from {url}: {message}")]
    NoResponse { url: String, message: String },

    /// The server answered with a non-2xx status
    #[error("{url} responded with status {status}")]
    BadStatus { url: String, status: u16 },

    /// The config server answered with an explicit error document
    #[error("config server error: {message}")]
    SessionProvider { message: String },
}

/// Main error type for sstunnel operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Malformed access key
    #[error("Invalid service configuration: {message}")]
    InvalidServiceConfiguration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed config location embedded in a dynamic access key
    #[error("Server URL invalid: {0}")]
    ServerUrlInvalid(String),

    /// Dynamic config fetch errors
    #[error("Server API error: {0}")]
    ServerApi(#[from] ServerApiError),

    /// Errors reported by the tunnel backend
    #[error("Tunnel backend error: {0}")]
    Backend(#[from] BackendErrorCode),

    /// Timeout errors
    #[error("Operation timed out: {operation} after {}ms", .duration.as_millis())]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Settings file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    IllegalState(String),

    /// A connect attempt superseded by a disconnect
    #[error("Connection attempt cancelled: {0}")]
    Cancelled(String),

    /// Unknown server id
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for sstunnel operations
pub type Result<T> = std::result::Result<T, VpnError>;

impl VpnError {
    /// Build an `InvalidServiceConfiguration` wrapping an underlying cause
    pub fn invalid_config<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        VpnError::InvalidServiceConfiguration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build an `InvalidServiceConfiguration` with no underlying cause
    pub fn invalid_config_msg(message: impl Into<String>) -> Self {
        VpnError::InvalidServiceConfiguration {
            message: message.into(),
            source: None,
        }
    }

    /// Whether a reconnection episode may retry after this error.
    ///
    /// Only failures that can clear on their own qualify: a config server
    /// that did not answer, a timed out operation, or an unreachable server.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VpnError::ServerApi(ServerApiError::NoResponse { .. })
                | VpnError::Timeout { .. }
                | VpnError::Backend(BackendErrorCode::ServerUnreachable)
        )
    }

    /// The backend error code, if this error came from the backend
    pub fn backend_code(&self) -> Option<BackendErrorCode> {
        match self {
            VpnError::Backend(code) => Some(*code),
            _ => None,
        }
    }
}

/// Helper trait for converting errors to VpnError
pub trait IntoVpnError<T> {
    fn into_vpn_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoVpnError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_vpn_error(self, context: &str) -> Result<T> {
        self.map_err(|e| VpnError::Other(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<url::ParseError> for VpnError {
    fn from(err: url::ParseError) -> Self {
        VpnError::invalid_config("access key is not a valid URL", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = VpnError::Config("test config error".to_string());
        assert_eq!(err.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_timeout_display_names_operation_and_duration() {
        let err = VpnError::Timeout {
            operation: "connect".to_string(),
            duration: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "Operation timed out: connect after 50ms");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let vpn_err: VpnError = io_err.into();
        assert!(matches!(vpn_err, VpnError::Io(_)));
    }

    #[test]
    fn test_url_parse_error_wraps_cause() {
        let err: VpnError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, VpnError::InvalidServiceConfiguration { .. }));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_backend_code_round_trip() {
        for code in 0..=12 {
            assert_eq!(BackendErrorCode::from_code(code).code(), code);
        }
        assert_eq!(BackendErrorCode::from_code(99), BackendErrorCode::Unexpected);
    }

    #[test]
    fn test_transient_classification() {
        let no_response = VpnError::ServerApi(ServerApiError::NoResponse {
            url: "https://example.com".to_string(),
            message: "connection refused".to_string(),
        });
        let bad_status = VpnError::ServerApi(ServerApiError::BadStatus {
            url: "https://example.com".to_string(),
            status: 404,
        });
        assert!(no_response.is_transient());
        assert!(!bad_status.is_transient());
        assert!(!VpnError::Backend(BackendErrorCode::InvalidServerCredentials).is_transient());
    }

    #[test]
    fn test_into_vpn_error_trait() {
        let result: std::result::Result<(), &str> = Err("test error");
        let vpn_result = result.into_vpn_error("test context");
        assert!(vpn_result.is_err());
        assert!(vpn_result.unwrap_err().to_string().contains("test context"));
    }
}
