//! `net.tcp` 目标地址。
//!
//! 前导中的 `via` 是完整 URI，建连只需要其中的主机与端口；省略端口时使用 808。

use std::fmt;

use crate::error::AddressError;

/// `net.tcp` 方案的默认端口。
pub const DEFAULT_NET_TCP_PORT: u16 = 808;

const SCHEME: &str = "net.tcp://";

/// 从 `net.tcp://host[:port]/path` 中解析出的建连目标。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TcpEndpoint {
    host: String,
    port: u16,
}

impl TcpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 解析 `via`；方案名大小写不敏感，IPv6 主机需使用方括号。
    pub fn parse(via: &str) -> Result<Self, AddressError> {
        let rest = via
            .get(..SCHEME.len())
            .filter(|scheme| scheme.eq_ignore_ascii_case(SCHEME))
            .map(|_| &via[SCHEME.len()..])
            .ok_or_else(|| AddressError::UnsupportedScheme(via.to_owned()))?;
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| AddressError::MissingHost(via.to_owned()))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(AddressError::MissingHost(via.to_owned()));
        }
        let port = match port {
            None => DEFAULT_NET_TCP_PORT,
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidPort(via.to_owned()))?,
        };
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `tokio::net::lookup_host` 接受的 `host:port` 形式。
    pub(crate) fn lookup_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}", self.lookup_target())
    }
}
