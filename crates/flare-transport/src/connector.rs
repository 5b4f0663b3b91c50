//! 建连：DNS 解析、TCP、代理隧道、TLS 与 ALPN。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把“从路由到可用字节流”的全部步骤集中在一处，连接池只关心结果是 HTTP/1.1
//!   还是 h2，不必了解代理与 TLS 细节；
//! - 每个步骤都有独立的截止时间与错误码，失败时可以直接定位是 DNS、TCP、隧道还是握手。
//!
//! ## 逻辑（How）
//! 1. 解析 `connect_target()`（代理或源站），按顺序逐个地址尝试，每次受 `connect_timeout` 约束；
//! 2. 通过 `socket2::SockRef` 打开 TCP keep-alive，并关闭 Nagle；
//! 3. `https` 经代理时先发送 `CONNECT` 建立隧道，任何非 2xx 回复都视为建连失败；
//! 4. `https` 执行 TLS 握手（受 `tls_negotiation_timeout` 约束），依据 ALPN 结果选择协议；
//!    明文路由只有 `ForceH2` 时走 h2c 先验知识。
//!
//! ## 契约（What）
//! - 返回的 [`Established`] 已完成 TLS，但尚未进行 h2 握手；
//! - `ForceH2` 而对端未选择 `h2` 时返回 `ConnectFailure`。
//!
//! ## 风险（Trade-offs）
//! - 地址逐个串行尝试，未实现 Happy Eyeballs；双栈环境下 IPv6 不通时首包延迟可能
//!   接近一个 `connect_timeout`。

use crate::config::{ALPN_H2, HttpVersionPolicy, TransportConfig};
use crate::connection::http1::parse_response_head;
use crate::error::{
    ALPN, CONFIGURE, CONNECT, PROXY_TUNNEL, RESOLVE, TLS_HANDSHAKE, TransportError, connect_error,
    protocol_error,
};
use crate::io::MaybeTlsStream;
use crate::route::Route;
use crate::util::{run_io_with_deadline, run_with_deadline};
use bytes::BytesMut;
use rustls_pki_types::ServerName;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

const MAX_TUNNEL_RESPONSE: usize = 16 * 1024;

/// 建连结果：协议已确定的字节流。
#[derive(Debug)]
pub(crate) enum Established {
    Http1(MaybeTlsStream),
    Http2(MaybeTlsStream),
}

/// 构造客户端 TLS 配置：显式选择 aws-lc-rs 提供方，ALPN 列表由版本策略决定。
pub(crate) fn client_tls_config(
    config: &TransportConfig,
) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let mut tls = match config.tls() {
        Some(custom) => (**custom).clone(),
        None => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::aws_lc_rs::default_provider(),
            ))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth()
        }
    };
    tls.alpn_protocols = config.http_version_policy().alpn_protocols();
    Ok(Arc::new(tls))
}

#[derive(Clone)]
pub(crate) struct Connector {
    tls: TlsConnector,
    policy: HttpVersionPolicy,
    connect_timeout: Duration,
    tls_timeout: Duration,
}

impl Connector {
    pub(crate) fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            tls: TlsConnector::from(client_tls_config(config)?),
            policy: config.http_version_policy(),
            connect_timeout: config.connect_timeout(),
            tls_timeout: config.tls_negotiation_timeout(),
        })
    }

    pub(crate) async fn connect(&self, route: &Route) -> Result<Established, TransportError> {
        let (host, port) = route.connect_target();
        let tcp = self.connect_tcp(host, port).await?;
        configure(&tcp)?;

        if !route.is_secure() {
            return match self.policy {
                HttpVersionPolicy::ForceH2 if route.proxy().is_some() => Err(connect_error(
                    ALPN,
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        "cleartext h2 cannot be forwarded through an http proxy",
                    ),
                )),
                HttpVersionPolicy::ForceH2 => Ok(Established::Http2(MaybeTlsStream::Plain(tcp))),
                _ => Ok(Established::Http1(MaybeTlsStream::Plain(tcp))),
            };
        }

        let tcp = if route.proxy().is_some() {
            self.tunnel(tcp, route).await?
        } else {
            tcp
        };
        let stream = self.handshake_tls(tcp, route).await?;
        let negotiated_h2 = stream.alpn() == Some(ALPN_H2);
        trace!(
            route = %route,
            alpn = ?stream.alpn().map(String::from_utf8_lossy),
            "tls handshake finished"
        );
        match (self.policy, negotiated_h2) {
            (_, true) => Ok(Established::Http2(stream)),
            (HttpVersionPolicy::ForceH2, false) => Err(connect_error(
                ALPN,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "peer did not select h2 during ALPN",
                ),
            )),
            (_, false) => Ok(Established::Http1(stream)),
        }
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let addrs: Vec<SocketAddr> = run_io_with_deadline(
            self.connect_timeout,
            RESOLVE,
            tokio::net::lookup_host((host, port)),
            connect_error,
        )
        .await?
        .collect();
        if addrs.is_empty() {
            return Err(connect_error(
                RESOLVE,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {host}"),
                ),
            ));
        }

        let mut last_error = None;
        for addr in addrs {
            match run_io_with_deadline(
                self.connect_timeout,
                CONNECT,
                TcpStream::connect(addr),
                connect_error,
            )
            .await
            {
                Ok(stream) => {
                    debug!(%addr, "tcp connected");
                    return Ok(stream);
                }
                Err(error) => {
                    debug!(%addr, %error, "tcp connect attempt failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            connect_error(CONNECT, io::Error::from(io::ErrorKind::NotConnected))
        }))
    }

    /// 通过 `CONNECT` 在代理上打开到源站的隧道。
    async fn tunnel(&self, mut tcp: TcpStream, route: &Route) -> Result<TcpStream, TransportError> {
        let authority = format!("{}:{}", route.host(), route.port());
        let mut request = BytesMut::with_capacity(256);
        request.extend_from_slice(format!("CONNECT {authority} HTTP/1.1\r\nhost: {authority}\r\n").as_bytes());
        if let Some(authorization) = route.proxy().and_then(|hop| hop.authorization()) {
            request.extend_from_slice(b"proxy-authorization: ");
            request.extend_from_slice(authorization.as_bytes());
            request.extend_from_slice(b"\r\n");
        }
        request.extend_from_slice(b"\r\n");

        run_with_deadline(Some(self.connect_timeout), PROXY_TUNNEL, async {
            tcp.write_all(&request)
                .await
                .map_err(|error| connect_error(PROXY_TUNNEL, error))?;
            let mut buf = BytesMut::with_capacity(1024);
            loop {
                if let Some((consumed, head)) = parse_response_head(&buf, PROXY_TUNNEL)? {
                    if !head.status.is_success() {
                        return Err(connect_error(
                            PROXY_TUNNEL,
                            io::Error::new(
                                io::ErrorKind::ConnectionRefused,
                                format!("proxy answered CONNECT with {}", head.status),
                            ),
                        ));
                    }
                    if consumed != buf.len() {
                        return Err(protocol_error(
                            PROXY_TUNNEL,
                            "proxy sent data before the tunnel was established",
                        ));
                    }
                    debug!(route = %route, "proxy tunnel established");
                    return Ok(());
                }
                if buf.len() >= MAX_TUNNEL_RESPONSE {
                    return Err(protocol_error(PROXY_TUNNEL, "proxy response head too large"));
                }
                let read = tcp
                    .read_buf(&mut buf)
                    .await
                    .map_err(|error| connect_error(PROXY_TUNNEL, error))?;
                if read == 0 {
                    return Err(connect_error(
                        PROXY_TUNNEL,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "proxy closed the connection during CONNECT",
                        ),
                    ));
                }
            }
        })
        .await?;
        Ok(tcp)
    }

    async fn handshake_tls(
        &self,
        tcp: TcpStream,
        route: &Route,
    ) -> Result<MaybeTlsStream, TransportError> {
        let server_name = ServerName::try_from(route.tls_host().to_owned())
            .map_err(|error| connect_error(TLS_HANDSHAKE, io::Error::new(io::ErrorKind::InvalidInput, error)))?;
        let stream = run_io_with_deadline(
            self.tls_timeout,
            TLS_HANDSHAKE,
            self.tls.connect(server_name, tcp),
            connect_error,
        )
        .await?;
        Ok(MaybeTlsStream::Tls(Box::new(stream)))
    }
}

fn configure(stream: &TcpStream) -> Result<(), TransportError> {
    stream
        .set_nodelay(true)
        .map_err(|error| connect_error(CONFIGURE, error))?;
    SockRef::from(stream)
        .set_keepalive(true)
        .map_err(|error| connect_error(CONFIGURE, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::route::{ProxyConfig, Scheme};
    use tokio::net::TcpListener;

    fn connector(policy: HttpVersionPolicy) -> Connector {
        let config = TransportConfig::builder()
            .http_version_policy(policy)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .expect("配置应合法");
        Connector::new(&config).expect("TLS 配置应可构造")
    }

    #[test]
    fn alpn_list_follows_the_policy() {
        let config = TransportConfig::builder()
            .http_version_policy(HttpVersionPolicy::ForceH1)
            .build()
            .expect("配置应合法");
        let tls = client_tls_config(&config).expect("TLS 配置应可构造");
        assert_eq!(tls.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn cleartext_routes_pick_the_protocol_from_the_policy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定监听端口");
        let port = listener.local_addr().expect("读取监听地址").port();
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由应合法");

        let h1 = connector(HttpVersionPolicy::Negotiate)
            .connect(&route)
            .await
            .expect("明文建连");
        assert!(matches!(h1, Established::Http1(_)));

        let h2c = connector(HttpVersionPolicy::ForceH2)
            .connect(&route)
            .await
            .expect("h2c 建连");
        assert!(matches!(h2c, Established::Http2(_)));
    }

    #[tokio::test]
    async fn refused_port_is_a_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定监听端口");
        let port = listener.local_addr().expect("读取监听地址").port();
        drop(listener);
        let route = Route::new(Scheme::Http, "127.0.0.1", port).expect("路由应合法");
        let error = connector(HttpVersionPolicy::Negotiate)
            .connect(&route)
            .await
            .expect_err("端口已关闭");
        assert_eq!(error.kind(), ErrorKind::ConnectFailure);
        assert_eq!(error.code(), "flare.transport.tcp.connect_failed");
    }

    #[tokio::test]
    async fn rejected_tunnel_is_a_connect_failure() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定代理端口");
        let proxy_port = proxy_listener.local_addr().expect("读取代理地址").port();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = proxy_listener.accept().await.expect("接受代理连接");
            let mut buf = vec![0u8; 1024];
            let read = socket.read(&mut buf).await.expect("读取 CONNECT 请求");
            let request = String::from_utf8_lossy(&buf[..read]).to_string();
            socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\ncontent-length: 0\r\n\r\n")
                .await
                .expect("写出拒绝响应");
            request
        });

        let proxy_config =
            ProxyConfig::new(&format!("http://127.0.0.1:{proxy_port}")).expect("代理应合法");
        let route = Route::new(Scheme::Https, "origin.example", 443)
            .expect("路由应合法")
            .with_proxy(&proxy_config);
        let error = connector(HttpVersionPolicy::Negotiate)
            .connect(&route)
            .await
            .expect_err("代理拒绝隧道");
        assert_eq!(error.kind(), ErrorKind::ConnectFailure);
        assert_eq!(error.code(), "flare.transport.proxy.tunnel_failed");

        let request = proxy.await.expect("代理任务应完成");
        assert!(request.starts_with("CONNECT origin.example:443 HTTP/1.1\r\n"));
    }
}
