//! 连接目标（Route）与代理配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：连接池以 Route 为键聚合连接；路径、查询串与片段从不参与，
//!   保证 `https://a.example/x` 与 `https://a.example/y?z` 复用同一批连接；
//! - **契约 (What)**：scheme ∈ {http, https}，端口 ∈ [1, 65535]，主机名小写且非空；
//!   相等性与哈希只依赖 `(scheme, host, port, proxy)`；
//! - **风险 (Trade-offs)**：只支持 `http://` 代理，`https` 目标通过 `CONNECT` 隧道穿越代理。

use http::HeaderValue;
use http::uri::{InvalidUri, Uri};
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;
use thiserror::Error;

const HTTP_DEFAULT_PORT: u16 = 80;
const HTTPS_DEFAULT_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("uri `{uri}` has no scheme")]
    MissingScheme { uri: String },
    #[error("unsupported scheme `{scheme}`; expected http or https")]
    UnsupportedScheme { scheme: String },
    #[error("uri `{uri}` has no host")]
    MissingHost { uri: String },
    #[error("host `{host}` contains `:` but is not an IPv6 address")]
    InvalidHost { host: String },
    #[error("port 0 is not a valid connection target")]
    InvalidPort,
    #[error("invalid uri: {source}")]
    InvalidUri {
        #[source]
        source: InvalidUri,
    },
    #[error("unsupported proxy scheme `{scheme}`; only http proxies are supported")]
    UnsupportedProxyScheme { scheme: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => HTTP_DEFAULT_PORT,
            Self::Https => HTTPS_DEFAULT_PORT,
        }
    }

    fn parse(raw: &str) -> Result<Self, RouteError> {
        if raw.eq_ignore_ascii_case("http") {
            Ok(Self::Http)
        } else if raw.eq_ignore_ascii_case("https") {
            Ok(Self::Https)
        } else {
            Err(RouteError::UnsupportedScheme {
                scheme: raw.to_owned(),
            })
        }
    }
}

/// 经过代理时的下一跳。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyHop {
    host: Arc<str>,
    port: u16,
    authorization: Option<HeaderValue>,
}

impl ProxyHop {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// 原样写入 `Proxy-Authorization` 的头值。
    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }
}

/// HTTP 代理配置。
///
/// `no_proxy` 中的条目是精确主机名或 `*.suffix` / `.suffix` 通配，单独的 `*` 表示全部绕过；
/// 匹配大小写不敏感。
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    uri: Uri,
    hop: ProxyHop,
    no_proxy: Vec<String>,
}

impl ProxyConfig {
    pub fn new(uri: &str) -> Result<Self, RouteError> {
        let parsed: Uri = uri
            .parse()
            .map_err(|source| RouteError::InvalidUri { source })?;
        let scheme = parsed.scheme_str().ok_or_else(|| RouteError::MissingScheme {
            uri: uri.to_owned(),
        })?;
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(RouteError::UnsupportedProxyScheme {
                scheme: scheme.to_owned(),
            });
        }
        let host = normalized_host(&parsed, uri)?;
        let port = resolve_port(&parsed, Scheme::Http)?;
        Ok(Self {
            uri: parsed,
            hop: ProxyHop {
                host,
                port,
                authorization: None,
            },
            no_proxy: Vec::new(),
        })
    }

    pub fn with_no_proxy<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_proxy.extend(
            patterns
                .into_iter()
                .map(|pattern| pattern.into().trim().to_ascii_lowercase())
                .filter(|pattern| !pattern.is_empty()),
        );
        self
    }

    pub fn with_authorization(mut self, value: HeaderValue) -> Self {
        self.hop.authorization = Some(value);
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn hop(&self) -> &ProxyHop {
        &self.hop
    }

    pub fn no_proxy(&self) -> &[String] {
        &self.no_proxy
    }

    /// `host` 是否命中 `no_proxy`，命中时直连。
    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.no_proxy.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            if let Some(suffix) = pattern.strip_prefix("*.").or_else(|| pattern.strip_prefix('.')) {
                return host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix)
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.');
            }
            *pattern == host
        })
    }
}

/// 连接池键：`(scheme, host, port, proxy?)`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: Scheme,
    host: Arc<str>,
    port: u16,
    proxy: Option<ProxyHop>,
}

impl Route {
    /// 由已拆分的目标构造路由；未加方括号的 IPv6 字面量被规范化为 `[addr]` 形式。
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Result<Self, RouteError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(RouteError::MissingHost {
                uri: host.to_owned(),
            });
        }
        if port == 0 {
            return Err(RouteError::InvalidPort);
        }
        let host = if host.contains(':') && !host.starts_with('[') {
            let address: Ipv6Addr = host.parse().map_err(|_| RouteError::InvalidHost {
                host: host.to_owned(),
            })?;
            format!("[{address}]")
        } else {
            host.to_ascii_lowercase()
        };
        Ok(Self {
            scheme,
            host: Arc::from(host),
            port,
            proxy: None,
        })
    }

    /// 从目标 URI 解析路由；端口缺省时按 scheme 取 80/443。
    pub fn from_uri(uri: &Uri) -> Result<Self, RouteError> {
        let raw = uri.to_string();
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| RouteError::MissingScheme { uri: raw.clone() })?;
        let scheme = Scheme::parse(scheme)?;
        let host = normalized_host(uri, &raw)?;
        let port = resolve_port(uri, scheme)?;
        Ok(Self {
            scheme,
            host,
            port,
            proxy: None,
        })
    }

    /// 解析路由并按 `no_proxy` 规则决定是否经过代理。
    pub fn from_uri_with_proxy(uri: &Uri, proxy: Option<&ProxyConfig>) -> Result<Self, RouteError> {
        let route = Self::from_uri(uri)?;
        Ok(match proxy {
            Some(proxy) if !proxy.bypasses(route.host()) => route.with_proxy(proxy),
            _ => route,
        })
    }

    pub fn with_proxy(mut self, proxy: &ProxyConfig) -> Self {
        self.proxy = Some(proxy.hop.clone());
        self
    }

    pub fn without_proxy(mut self) -> Self {
        self.proxy = None;
        self
    }

    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&ProxyHop> {
        self.proxy.as_ref()
    }

    pub const fn is_secure(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }

    pub const fn uses_default_port(&self) -> bool {
        self.port == self.scheme.default_port()
    }

    /// TCP 实际要连接的 `(host, port)`：经过代理时为代理地址，否则为源站。
    pub fn connect_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some(hop) => (strip_brackets(&hop.host), hop.port),
            None => (strip_brackets(&self.host), self.port),
        }
    }

    /// `Host` 头与 h2 `:authority` 使用的形式，默认端口省略。
    pub fn authority(&self) -> String {
        if self.uses_default_port() {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// TLS SNI 与证书校验使用的主机名（IPv6 去掉方括号）。
    pub fn tls_host(&self) -> &str {
        strip_brackets(&self.host)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)?;
        if let Some(hop) = &self.proxy {
            write!(f, " via {}:{}", hop.host, hop.port)?;
        }
        Ok(())
    }
}

fn normalized_host(uri: &Uri, raw: &str) -> Result<Arc<str>, RouteError> {
    match uri.host().map(str::trim) {
        Some(host) if !host.is_empty() => Ok(Arc::from(host.to_ascii_lowercase())),
        _ => Err(RouteError::MissingHost {
            uri: raw.to_owned(),
        }),
    }
}

fn resolve_port(uri: &Uri, scheme: Scheme) -> Result<u16, RouteError> {
    match uri.port_u16() {
        Some(0) => Err(RouteError::InvalidPort),
        Some(port) => Ok(port),
        None => Ok(scheme.default_port()),
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host)
}
