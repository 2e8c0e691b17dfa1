//! Proxy configuration derived from the authenticated token

use qp_protocol::TokenInfo;

/// One proxy definition: where the relay's public port is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy identifier, matched against `new_conn.proxy_name`
    pub name: String,
    /// Proxy protocol, e.g. "tcp"
    pub proxy_type: String,
    /// Address of the local service
    pub local_ip: String,
    /// Port of the local service
    pub local_port: u16,
    /// Public port on the relay
    pub remote_port: u16,
}

impl ProxyConfig {
    /// Build the proxy granted by a token.
    ///
    /// The relay names the proxy after its protocol type.
    pub fn from_token_info(info: &TokenInfo) -> Self {
        Self {
            name: info.protocol_type.clone(),
            proxy_type: info.protocol_type.clone(),
            local_ip: info.local_ip.clone(),
            local_port: info.local_port,
            remote_port: info.remote_port,
        }
    }

    /// Socket address of the local service, suitable for `TcpStream::connect`
    pub fn local_addr(&self) -> String {
        if self.local_ip.contains(':') && !self.local_ip.starts_with('[') {
            format!("[{}]:{}", self.local_ip, self.local_port)
        } else {
            format!("{}:{}", self.local_ip, self.local_port)
        }
    }
}
