//! 传输层配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把连接池上限、各阶段超时、h2 参数与取消策略集中为一个不可变值，由
//!   [`HttpTransport`](crate::HttpTransport) 与 [`ConnectionPool`](crate::ConnectionPool) 共享；
//! - 同时支持代码构建（[`TransportConfigBuilder`]）与 TOML 反序列化
//!   （[`TransportConfig::from_toml_str`]），两条路径共用同一套校验。
//!
//! ## 契约（What）
//! - 所有上限必须为正数，h2 初始窗口必须位于 `[65_535, 2^31 - 1]`；
//! - TOML 中的时长一律以毫秒书写，字段名带 `_ms` 后缀；
//! - 每台主机的连接上限中，`host:port` 条目优先于裸 `host` 条目。

use crate::route::{ProxyConfig, Route, RouteError};
use flare_stream::{BridgeConfig, CancelPolicy};
use http::HeaderValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_CONNECTIONS_PER_ROUTE: usize = 20;
const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 256;
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TLS_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_H2_STREAMS_PER_CONNECTION: usize = 100;
const DEFAULT_MAX_SWALLOW_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// RFC 9113 规定的初始窗口下限与上限。
pub const MIN_H2_WINDOW_SIZE: u32 = 65_535;
pub const MAX_H2_WINDOW_SIZE: u32 = (1 << 31) - 1;

pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    ZeroLimit { field: &'static str },
    #[error("h2 initial window size {value} is outside [{MIN_H2_WINDOW_SIZE}, {MAX_H2_WINDOW_SIZE}]")]
    WindowOutOfRange { value: u32 },
    #[error("invalid proxy configuration: {source}")]
    Proxy {
        #[source]
        source: RouteError,
    },
    #[error("invalid proxy authorization header value")]
    ProxyAuthorization,
    #[error("failed to parse transport configuration: {source}")]
    Toml {
        #[source]
        source: toml::de::Error,
    },
}

/// HTTP 版本选择策略。
///
/// - `ForceH1`：ALPN 只提供 `http/1.1`，明文也走 HTTP/1.1；
/// - `ForceH2`：ALPN 只提供 `h2`，对端未选 `h2` 视为建连失败；明文走 h2c 先验知识；
/// - `Negotiate`：ALPN 依次提供 `h2`、`http/1.1`，按对端选择决定；明文走 HTTP/1.1。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpVersionPolicy {
    ForceH1,
    ForceH2,
    #[default]
    Negotiate,
}

impl HttpVersionPolicy {
    pub fn alpn_protocols(self) -> Vec<Vec<u8>> {
        match self {
            Self::ForceH1 => vec![ALPN_HTTP11.to_vec()],
            Self::ForceH2 => vec![ALPN_H2.to_vec()],
            Self::Negotiate => vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
        }
    }

    /// 连接池是否应先走 h2 路径（复用注册表中的多路复用连接）。
    pub const fn prefers_h2(self, secure: bool) -> bool {
        match self {
            Self::ForceH1 => false,
            Self::ForceH2 => true,
            Self::Negotiate => secure,
        }
    }
}

/// 不可变的传输配置。
#[derive(Clone, Debug)]
pub struct TransportConfig {
    max_connections_per_route: usize,
    max_connections_for_host: HashMap<String, usize>,
    max_total_connections: usize,
    max_idle_time: Duration,
    connect_timeout: Duration,
    tls_negotiation_timeout: Duration,
    acquire_timeout: Duration,
    request_timeout: Option<Duration>,
    h2_streams_per_connection: usize,
    h2_initial_window_size: u32,
    http_version_policy: HttpVersionPolicy,
    max_swallow_duration: Duration,
    cancel_policy: CancelPolicy,
    cleanup_interval: Duration,
    proxy: Option<ProxyConfig>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections_per_route: DEFAULT_MAX_CONNECTIONS_PER_ROUTE,
            max_connections_for_host: HashMap::new(),
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls_negotiation_timeout: DEFAULT_TLS_NEGOTIATION_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            request_timeout: None,
            h2_streams_per_connection: DEFAULT_H2_STREAMS_PER_CONNECTION,
            h2_initial_window_size: MIN_H2_WINDOW_SIZE,
            http_version_policy: HttpVersionPolicy::Negotiate,
            max_swallow_duration: DEFAULT_MAX_SWALLOW_DURATION,
            cancel_policy: CancelPolicy::Swallow,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            proxy: None,
            tls: None,
        }
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder {
            config: Self::default(),
        }
    }

    /// 从 TOML 文本解析配置，未出现的字段保持默认值。
    ///
    /// ```toml
    /// max_connections_per_route = 8
    /// acquire_timeout_ms = 500
    /// http_version_policy = "force_h1"
    /// cancel_policy = "close_immediately"
    ///
    /// [max_connections_for_host]
    /// "api.example.com:8443" = 2
    ///
    /// [proxy]
    /// uri = "http://proxy.internal:3128"
    /// no_proxy = ["localhost", "*.svc"]
    /// ```
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(raw).map_err(|source| ConfigError::Toml { source })?;
        file.into_builder()?.build()
    }

    pub const fn max_connections_per_route(&self) -> usize {
        self.max_connections_per_route
    }

    pub fn max_connections_for_host(&self) -> &HashMap<String, usize> {
        &self.max_connections_for_host
    }

    /// 某条路由实际生效的空闲池上限。
    pub fn max_connections_for(&self, route: &Route) -> usize {
        if self.max_connections_for_host.is_empty() {
            return self.max_connections_per_route;
        }
        let with_port = format!("{}:{}", route.host(), route.port());
        self.max_connections_for_host
            .get(&with_port)
            .or_else(|| self.max_connections_for_host.get(route.host()))
            .copied()
            .unwrap_or(self.max_connections_per_route)
    }

    pub const fn max_total_connections(&self) -> usize {
        self.max_total_connections
    }

    pub const fn max_idle_time(&self) -> Duration {
        self.max_idle_time
    }

    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub const fn tls_negotiation_timeout(&self) -> Duration {
        self.tls_negotiation_timeout
    }

    pub const fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub const fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub const fn h2_streams_per_connection(&self) -> usize {
        self.h2_streams_per_connection
    }

    pub const fn h2_initial_window_size(&self) -> u32 {
        self.h2_initial_window_size
    }

    pub const fn http_version_policy(&self) -> HttpVersionPolicy {
        self.http_version_policy
    }

    pub const fn max_swallow_duration(&self) -> Duration {
        self.max_swallow_duration
    }

    pub const fn cancel_policy(&self) -> CancelPolicy {
        self.cancel_policy
    }

    pub const fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn tls(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.tls.as_ref()
    }

    /// HTTP/1.1 响应体使用的背压桥参数。
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::new()
            .with_max_swallow_duration(self.max_swallow_duration)
            .with_cancel_policy(self.cancel_policy)
    }
}

/// [`TransportConfig`] 的建造器；`build` 时统一校验。
#[derive(Clone, Debug)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn max_connections_per_route(mut self, value: usize) -> Self {
        self.config.max_connections_per_route = value;
        self
    }

    /// 为 `host` 或 `host:port` 单独设置上限，键大小写不敏感。
    pub fn max_connections_for_host(mut self, host: &str, value: usize) -> Self {
        self.config
            .max_connections_for_host
            .insert(host.trim().to_ascii_lowercase(), value);
        self
    }

    pub fn max_total_connections(mut self, value: usize) -> Self {
        self.config.max_total_connections = value;
        self
    }

    pub fn max_idle_time(mut self, value: Duration) -> Self {
        self.config.max_idle_time = value;
        self
    }

    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.config.connect_timeout = value;
        self
    }

    pub fn tls_negotiation_timeout(mut self, value: Duration) -> Self {
        self.config.tls_negotiation_timeout = value;
        self
    }

    /// 等待全局连接许可的上限；`Duration::ZERO` 表示拿不到立即失败。
    pub fn acquire_timeout(mut self, value: Duration) -> Self {
        self.config.acquire_timeout = value;
        self
    }

    pub fn request_timeout(mut self, value: Option<Duration>) -> Self {
        self.config.request_timeout = value;
        self
    }

    pub fn h2_streams_per_connection(mut self, value: usize) -> Self {
        self.config.h2_streams_per_connection = value;
        self
    }

    pub fn h2_initial_window_size(mut self, value: u32) -> Self {
        self.config.h2_initial_window_size = value;
        self
    }

    pub fn http_version_policy(mut self, value: HttpVersionPolicy) -> Self {
        self.config.http_version_policy = value;
        self
    }

    pub fn max_swallow_duration(mut self, value: Duration) -> Self {
        self.config.max_swallow_duration = value;
        self
    }

    pub fn cancel_policy(mut self, value: CancelPolicy) -> Self {
        self.config.cancel_policy = value;
        self
    }

    pub fn cleanup_interval(mut self, value: Duration) -> Self {
        self.config.cleanup_interval = value;
        self
    }

    pub fn proxy(mut self, value: Option<ProxyConfig>) -> Self {
        self.config.proxy = value;
        self
    }

    /// 自定义 rustls 客户端配置；ALPN 列表会按版本策略覆盖。
    pub fn tls(mut self, value: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls = Some(value);
        self
    }

    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        let config = self.config;
        for (field, value) in [
            ("max_connections_per_route", config.max_connections_per_route),
            ("max_total_connections", config.max_total_connections),
            ("h2_streams_per_connection", config.h2_streams_per_connection),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field });
            }
        }
        if config.max_connections_for_host.values().any(|limit| *limit == 0) {
            return Err(ConfigError::ZeroLimit {
                field: "max_connections_for_host",
            });
        }
        if config.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroLimit {
                field: "cleanup_interval",
            });
        }
        if !(MIN_H2_WINDOW_SIZE..=MAX_H2_WINDOW_SIZE).contains(&config.h2_initial_window_size) {
            return Err(ConfigError::WindowOutOfRange {
                value: config.h2_initial_window_size,
            });
        }
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CancelPolicyName {
    Swallow,
    CloseImmediately,
}

impl From<CancelPolicyName> for CancelPolicy {
    fn from(value: CancelPolicyName) -> Self {
        match value {
            CancelPolicyName::Swallow => CancelPolicy::Swallow,
            CancelPolicyName::CloseImmediately => CancelPolicy::CloseImmediately,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProxyFile {
    uri: String,
    #[serde(default)]
    no_proxy: Vec<String>,
    authorization: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    max_connections_per_route: Option<usize>,
    max_connections_for_host: HashMap<String, usize>,
    max_total_connections: Option<usize>,
    max_idle_time_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    tls_negotiation_timeout_ms: Option<u64>,
    acquire_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    h2_streams_per_connection: Option<usize>,
    h2_initial_window_size: Option<u32>,
    http_version_policy: Option<HttpVersionPolicy>,
    max_swallow_duration_ms: Option<u64>,
    cancel_policy: Option<CancelPolicyName>,
    cleanup_interval_ms: Option<u64>,
    proxy: Option<ProxyFile>,
}

impl ConfigFile {
    fn into_builder(self) -> Result<TransportConfigBuilder, ConfigError> {
        let mut builder = TransportConfig::builder();
        if let Some(value) = self.max_connections_per_route {
            builder = builder.max_connections_per_route(value);
        }
        for (host, value) in &self.max_connections_for_host {
            builder = builder.max_connections_for_host(host, *value);
        }
        if let Some(value) = self.max_total_connections {
            builder = builder.max_total_connections(value);
        }
        if let Some(ms) = self.max_idle_time_ms {
            builder = builder.max_idle_time(Duration::from_millis(ms));
        }
        if let Some(ms) = self.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.tls_negotiation_timeout_ms {
            builder = builder.tls_negotiation_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.acquire_timeout_ms {
            builder = builder.acquire_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.request_timeout_ms {
            builder = builder.request_timeout(Some(Duration::from_millis(ms)));
        }
        if let Some(value) = self.h2_streams_per_connection {
            builder = builder.h2_streams_per_connection(value);
        }
        if let Some(value) = self.h2_initial_window_size {
            builder = builder.h2_initial_window_size(value);
        }
        if let Some(value) = self.http_version_policy {
            builder = builder.http_version_policy(value);
        }
        if let Some(ms) = self.max_swallow_duration_ms {
            builder = builder.max_swallow_duration(Duration::from_millis(ms));
        }
        if let Some(value) = self.cancel_policy {
            builder = builder.cancel_policy(value.into());
        }
        if let Some(ms) = self.cleanup_interval_ms {
            builder = builder.cleanup_interval(Duration::from_millis(ms));
        }
        if let Some(file) = self.proxy {
            let mut proxy = ProxyConfig::new(&file.uri)
                .map_err(|source| ConfigError::Proxy { source })?
                .with_no_proxy(file.no_proxy);
            if let Some(raw) = file.authorization {
                let value =
                    HeaderValue::from_str(&raw).map_err(|_| ConfigError::ProxyAuthorization)?;
                proxy = proxy.with_authorization(value);
            }
            builder = builder.proxy(Some(proxy));
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Scheme;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = TransportConfig::default();
        assert_eq!(config.max_connections_per_route(), 20);
        assert_eq!(config.max_total_connections(), 256);
        assert_eq!(config.max_idle_time(), Duration::from_secs(120));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.tls_negotiation_timeout(), Duration::from_secs(10));
        assert_eq!(config.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.h2_streams_per_connection(), 100);
        assert_eq!(config.h2_initial_window_size(), 65_535);
        assert_eq!(config.http_version_policy(), HttpVersionPolicy::Negotiate);
        assert_eq!(config.max_swallow_duration(), Duration::from_secs(10));
        assert_eq!(config.cancel_policy(), CancelPolicy::Swallow);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(30));
    }

    #[test]
    fn builder_rejects_invalid_limits() {
        assert!(matches!(
            TransportConfig::builder().max_total_connections(0).build(),
            Err(ConfigError::ZeroLimit {
                field: "max_total_connections"
            })
        ));
        assert!(matches!(
            TransportConfig::builder().h2_initial_window_size(1024).build(),
            Err(ConfigError::WindowOutOfRange { value: 1024 })
        ));
        assert!(matches!(
            TransportConfig::builder()
                .max_connections_for_host("a.example", 0)
                .build(),
            Err(ConfigError::ZeroLimit { .. })
        ));
    }

    #[test]
    fn host_and_port_entry_wins_over_bare_host() {
        let config = TransportConfig::builder()
            .max_connections_per_route(20)
            .max_connections_for_host("API.example.com", 5)
            .max_connections_for_host("api.example.com:8443", 2)
            .build()
            .expect("配置应合法");

        let default_port = Route::new(Scheme::Https, "api.example.com", 443).expect("路由应合法");
        let custom_port = Route::new(Scheme::Https, "api.example.com", 8443).expect("路由应合法");
        let other = Route::new(Scheme::Https, "other.example.com", 443).expect("路由应合法");

        assert_eq!(config.max_connections_for(&default_port), 5);
        assert_eq!(config.max_connections_for(&custom_port), 2);
        assert_eq!(config.max_connections_for(&other), 20);
    }

    #[test]
    fn toml_overrides_only_the_fields_it_names() {
        let config = TransportConfig::from_toml_str(
            r#"
            max_connections_per_route = 8
            acquire_timeout_ms = 500
            request_timeout_ms = 2500
            http_version_policy = "force_h1"
            cancel_policy = "close_immediately"

            [max_connections_for_host]
            "api.example.com:8443" = 2

            [proxy]
            uri = "http://proxy.internal:3128"
            no_proxy = ["localhost"]
            authorization = "Basic dXNlcjpwYXNz"
            "#,
        )
        .expect("TOML 配置应合法");

        assert_eq!(config.max_connections_per_route(), 8);
        assert_eq!(config.acquire_timeout(), Duration::from_millis(500));
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.http_version_policy(), HttpVersionPolicy::ForceH1);
        assert_eq!(config.cancel_policy(), CancelPolicy::CloseImmediately);
        assert_eq!(config.max_total_connections(), 256);
        let proxy = config.proxy().expect("应解析出代理");
        assert_eq!(proxy.hop().port(), 3128);
        assert!(proxy.hop().authorization().is_some());
        assert!(proxy.bypasses("localhost"));
    }

    #[test]
    fn toml_rejects_unknown_fields() {
        assert!(matches!(
            TransportConfig::from_toml_str("max_conections = 3"),
            Err(ConfigError::Toml { .. })
        ));
    }

    #[test]
    fn alpn_lists_follow_the_policy() {
        assert_eq!(
            HttpVersionPolicy::Negotiate.alpn_protocols(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert!(HttpVersionPolicy::Negotiate.prefers_h2(true));
        assert!(!HttpVersionPolicy::Negotiate.prefers_h2(false));
        assert!(HttpVersionPolicy::ForceH2.prefers_h2(false));
    }
}
