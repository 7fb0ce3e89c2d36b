//! PROXY protocol (HAProxy v1/v2) support for TCP, TLS and WebSocket listeners.
//!
//! When a listener has PROXY protocol enabled, the real client address is
//! carried in a header prepended to the TCP stream by an upstream load
//! balancer rather than being the socket's peer address. We parse that
//! header before handing the stream to the MQTT connection handler so the
//! rest of the broker (flapping detection, ACL, logging) sees the real
//! client, not the proxy's address.

use std::net::SocketAddr;
use std::time::Duration;

use ppp::v1;
use ppp::v2::{self, Command};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::config::ProxyProtocolConfig;

/// Information recovered from a PROXY protocol header.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    /// The real client address, as reported by the proxy.
    pub source_addr: SocketAddr,
    /// The proxy's own address for this connection (v2 destination).
    pub dest_addr: Option<SocketAddr>,
    /// TLS SNI server name, when the proxy terminated TLS and forwarded a
    /// PP2_TYPE_SSL/PP2_SUBTYPE_SSL_SNI TLV.
    pub tls_server_name: Option<String>,
    /// Client certificate common name, when the proxy terminated TLS with
    /// client cert verification and forwarded a PP2_TYPE_SSL_CN TLV.
    pub tls_client_cn: Option<String>,
}

/// Errors encountered while reading a PROXY protocol header.
#[derive(Debug)]
pub enum ProxyError {
    /// Header read timed out.
    Timeout,
    /// Underlying IO error.
    Io(std::io::Error),
    /// Header bytes did not parse as a v1 or v2 PROXY header.
    Malformed(String),
    /// Proxy sent LOCAL (health check) - caller should proceed without ProxyInfo.
    Local,
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Timeout => write!(f, "timed out reading PROXY protocol header"),
            ProxyError::Io(e) => write!(f, "IO error reading PROXY protocol header: {}", e),
            ProxyError::Malformed(msg) => write!(f, "malformed PROXY protocol header: {}", msg),
            ProxyError::Local => write!(f, "PROXY protocol LOCAL command (health check)"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e)
    }
}

/// Read and parse a PROXY protocol header from `stream`, returning the
/// recovered [`ProxyInfo`]. The stream is left positioned just after the
/// header so the caller can continue reading the MQTT byte stream normally.
///
/// `config.timeout` bounds how long we wait for the header to arrive; a
/// misbehaving or absent proxy should not hang the accept loop forever.
pub async fn read_proxy_header<S>(
    stream: &mut S,
    config: &ProxyProtocolConfig,
) -> Result<ProxyInfo, ProxyError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    timeout(config.timeout, read_header_inner(stream, config.tls_termination))
        .await
        .map_err(|_| ProxyError::Timeout)?
}

async fn read_header_inner<S>(
    stream: &mut S,
    trust_tls_termination: bool,
) -> Result<ProxyInfo, ProxyError>
where
    S: AsyncReadExt + Unpin,
{
    // Peek enough bytes to distinguish v1 (starts with "PROXY ") from v2
    // (starts with the 12-byte binary signature), then parse incrementally
    // since we can't peek on a generic AsyncRead without a BufReader.
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);

        if buf.len() == v2::PROTOCOL_PREFIX.len() && buf == v2::PROTOCOL_PREFIX {
            return read_v2(stream, buf, trust_tls_termination).await;
        }

        if buf.starts_with(b"PROXY ") && buf.ends_with(b"\r\n") {
            return parse_v1(&buf);
        }

        if buf.len() > 536 {
            return Err(ProxyError::Malformed(
                "header exceeded maximum size without terminator".to_string(),
            ));
        }
    }
}

fn parse_v1(buf: &[u8]) -> Result<ProxyInfo, ProxyError> {
    let text = std::str::from_utf8(buf)
        .map_err(|e| ProxyError::Malformed(format!("non-utf8 v1 header: {}", e)))?;
    let header =
        v1::Header::try_from(text).map_err(|e| ProxyError::Malformed(format!("{:?}", e)))?;

    let addresses = header.addresses;
    match addresses {
        v1::Addresses::Tcp4(a) => Ok(ProxyInfo {
            source_addr: SocketAddr::new(a.source_address.into(), a.source_port),
            dest_addr: Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
            tls_server_name: None,
            tls_client_cn: None,
        }),
        v1::Addresses::Tcp6(a) => Ok(ProxyInfo {
            source_addr: SocketAddr::new(a.source_address.into(), a.source_port),
            dest_addr: Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
            tls_server_name: None,
            tls_client_cn: None,
        }),
        v1::Addresses::Unknown => Err(ProxyError::Local),
    }
}

async fn read_v2<S>(
    stream: &mut S,
    mut buf: Vec<u8>,
    trust_tls_termination: bool,
) -> Result<ProxyInfo, ProxyError>
where
    S: AsyncReadExt + Unpin,
{
    // 12-byte sig + ver/cmd (1) + fam/proto (1) + len (2)
    let mut header_rest = [0u8; 4];
    stream.read_exact(&mut header_rest).await?;
    buf.extend_from_slice(&header_rest);
    let declared_len = u16::from_be_bytes([header_rest[2], header_rest[3]]) as usize;

    let mut body = vec![0u8; declared_len];
    stream.read_exact(&mut body).await?;
    buf.extend_from_slice(&body);

    let parsed = v2::Header::try_from(buf.as_slice())
        .map_err(|e| ProxyError::Malformed(format!("{:?}", e)))?;

    if parsed.command == Command::Local {
        return Err(ProxyError::Local);
    }

    let (source_addr, dest_addr) = match parsed.addresses {
        v2::Addresses::IPv4(a) => (
            SocketAddr::new(a.source_address.into(), a.source_port),
            Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
        ),
        v2::Addresses::IPv6(a) => (
            SocketAddr::new(a.source_address.into(), a.source_port),
            Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
        ),
        _ => {
            return Err(ProxyError::Malformed(
                "unsupported address family in v2 header".to_string(),
            ))
        }
    };

    let mut tls_server_name = None;
    let mut tls_client_cn = None;

    if trust_tls_termination {
        for tlv in parsed.tlvs() {
            let Ok(tlv) = tlv else { continue };
            if tlv.kind == v2::Type::SSL {
                if let Ok(ssl) = v2::ssl::SSL::try_from(tlv) {
                    for sub_tlv in ssl.tlvs() {
                        let Ok(sub_tlv) = sub_tlv else { continue };
                        match sub_tlv.kind {
                            v2::Type::SSL_SNI => {
                                tls_server_name = std::str::from_utf8(sub_tlv.value)
                                    .ok()
                                    .map(|s| s.to_string());
                            }
                            v2::Type::SSL_CN => {
                                tls_client_cn = std::str::from_utf8(sub_tlv.value)
                                    .ok()
                                    .map(|s| s.to_string());
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    Ok(ProxyInfo {
        source_addr,
        dest_addr,
        tls_server_name,
        tls_client_cn,
    })
}
