//! `tcp://host:port` endpoint strings as carried in HELLO.

use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint {0:?}, expected tcp://host:port")]
pub struct EndpointError(pub String);

pub fn format_endpoint(addr: SocketAddr) -> String {
    format!("tcp://{}", addr)
}

/// Split into host and port. The host is returned as written.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, u16), EndpointError> {
    let err = || EndpointError(endpoint.to_string());
    let rest = endpoint.strip_prefix("tcp://").ok_or_else(err)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(err)?;
    if host.is_empty() {
        return Err(err());
    }
    let port = port.parse::<u16>().map_err(|_| err())?;
    Ok((host, port))
}

/// The file service of a peer lives on the same host as its mailbox.
pub fn file_service_endpoint(peer_endpoint: &str, port: u16) -> Result<String, EndpointError> {
    let (host, _) = parse_endpoint(peer_endpoint)?;
    Ok(format!("tcp://{}:{}", host, port))
}
