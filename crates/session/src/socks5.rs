//! SOCKS5 framing (RFC 1928, CONNECT only, NO AUTH) as pure functions over
//! an already-received buffer. `Session` reads one buffer per record via
//! `TcpConnection::receive_next()` and hands it here; each record is
//! expected to arrive whole in a single buffer (no reassembly across
//! fragmented handshake records).

use relaycraft_core::Endpoint;
use thiserror::Error;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const METHOD_NO_AUTH: u8 = 0x00;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("greeting buffer too short")]
    TruncatedGreeting,
    #[error("unsupported SOCKS version {0:#x}")]
    UnsupportedVersion(u8),
    #[error("client does not offer NO AUTH")]
    NoAcceptableMethods,
    #[error("request buffer too short")]
    TruncatedRequest,
    #[error("unsupported SOCKS5 command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#x}")]
    UnsupportedAddressType(u8),
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
}

/// A parsed `CONNECT` request's destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Parse `VER | NMETHODS | METHODS`, requiring NO AUTH among the offered
/// methods. The reply to send back is a separate step (`no_auth_reply`) so
/// callers can write it with their own error handling.
pub fn parse_greeting(buf: &[u8]) -> Result<(), Socks5Error> {
    if buf.len() < 2 {
        return Err(Socks5Error::TruncatedGreeting);
    }
    if buf[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }
    let nmethods = buf[1] as usize;
    let methods = buf
        .get(2..2 + nmethods)
        .ok_or(Socks5Error::TruncatedGreeting)?;
    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(Socks5Error::NoAcceptableMethods);
    }
    Ok(())
}

/// `VER | METHOD` reply selecting NO AUTH.
pub fn no_auth_reply() -> [u8; 2] {
    [VERSION, METHOD_NO_AUTH]
}

/// `VER | METHOD` reply rejecting the client (no acceptable method).
pub fn no_acceptable_methods_reply() -> [u8; 2] {
    [VERSION, 0xFF]
}

/// Parse `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`, accepting only
/// `CONNECT`.
pub fn parse_connect_request(buf: &[u8]) -> Result<ConnectRequest, Socks5Error> {
    if buf.len() < 4 {
        return Err(Socks5Error::TruncatedRequest);
    }
    if buf[0] != VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }
    if buf[1] != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(buf[1]));
    }

    let mut offset = 4;
    let host = match buf[3] {
        ATYP_IPV4 => {
            let addr = buf.get(offset..offset + 4).ok_or(Socks5Error::TruncatedRequest)?;
            offset += 4;
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        ATYP_DOMAIN => {
            let len = *buf.get(offset).ok_or(Socks5Error::TruncatedRequest)? as usize;
            offset += 1;
            let domain = buf
                .get(offset..offset + len)
                .ok_or(Socks5Error::TruncatedRequest)?;
            offset += len;
            String::from_utf8(domain.to_vec()).map_err(|_| Socks5Error::InvalidDomain)?
        }
        ATYP_IPV6 => {
            let addr = buf.get(offset..offset + 16).ok_or(Socks5Error::TruncatedRequest)?;
            offset += 16;
            let parts: Vec<String> = (0..8)
                .map(|i| format!("{:x}", u16::from_be_bytes([addr[i * 2], addr[i * 2 + 1]])))
                .collect();
            parts.join(":")
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let port_bytes = buf
        .get(offset..offset + 2)
        .ok_or(Socks5Error::TruncatedRequest)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    Ok(ConnectRequest { host, port })
}

/// Compose `VER | REP=0 | RSV | ATYP | BND.ADDR | BND.PORT` carrying the
/// endpoint the peer actually connected to, encoding it as IPv4, IPv6, or
/// (for a hostname the peer resolved itself) a domain name.
pub fn success_reply(endpoint: &Endpoint) -> Vec<u8> {
    let mut out = vec![VERSION, 0x00, 0x00];
    if let Ok(ip) = endpoint.address.parse::<std::net::Ipv4Addr>() {
        out.push(ATYP_IPV4);
        out.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = endpoint.address.parse::<std::net::Ipv6Addr>() {
        out.push(ATYP_IPV6);
        out.extend_from_slice(&ip.octets());
    } else {
        out.push(ATYP_DOMAIN);
        let bytes = endpoint.address.as_bytes();
        out.push(bytes.len().min(255) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(255)]);
    }
    out.extend_from_slice(&endpoint.port.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_requires_no_auth_method() {
        assert!(parse_greeting(&[0x05, 0x01, 0x00]).is_ok());
        assert_eq!(
            parse_greeting(&[0x05, 0x01, 0x02]),
            Err(Socks5Error::NoAcceptableMethods)
        );
    }

    #[test]
    fn greeting_rejects_unsupported_version() {
        assert_eq!(
            parse_greeting(&[0x04, 0x01, 0x00]),
            Err(Socks5Error::UnsupportedVersion(0x04))
        );
    }

    #[test]
    fn connect_request_parses_ipv4() {
        let buf = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xbb];
        let req = parse_connect_request(&buf).unwrap();
        assert_eq!(req.host, "93.184.216.34");
        assert_eq!(req.port, 443);
    }

    #[test]
    fn connect_request_parses_domain() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&80u16.to_be_bytes());
        let req = parse_connect_request(&buf).unwrap();
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 80);
    }

    #[test]
    fn connect_request_rejects_non_connect_command() {
        let buf = [0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            parse_connect_request(&buf),
            Err(Socks5Error::UnsupportedCommand(0x02))
        );
    }

    #[test]
    fn success_reply_encodes_ipv4_endpoint() {
        let reply = success_reply(&Endpoint::new("93.184.216.34", 443));
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xbb]);
    }

    #[test]
    fn success_reply_encodes_domain_endpoint() {
        let reply = success_reply(&Endpoint::new("example.com", 80));
        assert_eq!(reply[0..4], [0x05, 0x00, 0x00, 0x03]);
        assert_eq!(reply[4], 11);
        assert_eq!(&reply[5..16], b"example.com");
        assert_eq!(&reply[16..18], &80u16.to_be_bytes());
    }
}
