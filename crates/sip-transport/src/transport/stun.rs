//! Minimal STUN (RFC 5389) binding support for UDP keep-alive and NAT discovery.
//!
//! Only Binding requests and success responses are handled. A request is
//! answered with XOR-MAPPED-ADDRESS; a response yields the mapped address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::RngCore;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

/// Leading bytes `0x00 0x01`
pub fn is_binding_request(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[0] == 0 && buf[1] == 1
}

/// Leading bytes `0x01 0x01`
pub fn is_binding_response(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[0] == 1 && buf[1] == 1
}

pub fn random_transaction_id() -> [u8; 12] {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn header(msg_type: u16, body_len: usize, transaction_id: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&msg_type.to_be_bytes());
    out.extend_from_slice(&(body_len as u16).to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(transaction_id);
    out
}

pub fn binding_request(transaction_id: [u8; 12]) -> Vec<u8> {
    header(BINDING_REQUEST, 0, &transaction_id)
}

/// Success response to `request` carrying the address it came from
pub fn binding_response(request: &[u8], mapped: SocketAddr) -> Option<Vec<u8>> {
    if !is_binding_request(request) {
        return None;
    }
    let transaction_id = &request[8..HEADER_LEN];
    let cookie = MAGIC_COOKIE.to_be_bytes();

    let mut value = vec![0u8, 0];
    value.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    match mapped.ip() {
        IpAddr::V4(ip) => {
            value[1] = FAMILY_V4;
            value.extend(ip.octets().iter().zip(cookie.iter()).map(|(a, b)| a ^ b));
        }
        IpAddr::V6(ip) => {
            value[1] = FAMILY_V6;
            let key: Vec<u8> = cookie.iter().chain(transaction_id.iter()).copied().collect();
            value.extend(ip.octets().iter().zip(key.iter()).map(|(a, b)| a ^ b));
        }
    }

    let mut out = header(BINDING_SUCCESS, 4 + value.len(), transaction_id);
    out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(&value);
    Some(out)
}

/// Mapped address from a binding success response.
/// XOR-MAPPED-ADDRESS is preferred over the legacy MAPPED-ADDRESS.
pub fn mapped_address(response: &[u8]) -> Option<SocketAddr> {
    if !is_binding_response(response) {
        return None;
    }
    let body_len = u16::from_be_bytes([response[2], response[3]]) as usize;
    let body = response.get(HEADER_LEN..HEADER_LEN + body_len)?;
    let transaction_id = &response[8..HEADER_LEN];

    let mut plain = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body.get(offset + 4..offset + 4 + attr_len)?;
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(transaction_id)),
            ATTR_MAPPED_ADDRESS => plain = decode_address(value, None),
            _ => {}
        }
        // attributes are padded to 4 bytes
        offset += 4 + attr_len.div_ceil(4) * 4;
    }
    plain
}

fn decode_address(value: &[u8], xor_with: Option<&[u8]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let ip = match value[1] {
        FAMILY_V4 => {
            let raw: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            let octets = match xor_with {
                Some(_) => std::array::from_fn(|i| raw[i] ^ cookie[i]),
                None => raw,
            };
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            let raw: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            let octets = match xor_with {
                Some(transaction_id) => {
                    let key: Vec<u8> = cookie.iter().chain(transaction_id.iter()).copied().collect();
                    std::array::from_fn(|i| raw[i] ^ key[i])
                }
                None => raw,
            };
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_answered_with_xor_mapped_address() {
        let request = binding_request(random_transaction_id());
        assert!(is_binding_request(&request));
        assert!(!is_binding_response(&request));

        let peer: SocketAddr = "203.0.113.9:41000".parse().unwrap();
        let response = binding_response(&request, peer).unwrap();
        assert!(is_binding_response(&response));
        assert_eq!(&response[8..20], &request[8..20]);
        assert_eq!(mapped_address(&response), Some(peer));
    }

    #[test]
    fn test_v6_mapping() {
        let request = binding_request([7u8; 12]);
        let peer: SocketAddr = "[2001:db8::42]:5062".parse().unwrap();
        let response = binding_response(&request, peer).unwrap();
        assert_eq!(mapped_address(&response), Some(peer));
    }

    #[test]
    fn test_plain_mapped_address() {
        let mut response = header(BINDING_SUCCESS, 12, &[1u8; 12]);
        response.extend_from_slice(&[0x00, 0x01, 0x00, 0x08, 0x00, 0x01, 0x13, 0xc4, 192, 0, 2, 1]);
        assert_eq!(mapped_address(&response), Some("192.0.2.1:5060".parse().unwrap()));
    }

    #[test]
    fn test_sip_is_not_stun() {
        assert!(!is_binding_request(b"OPTIONS sip:a@b SIP/2.0\r\n\r\n"));
        assert!(mapped_address(b"short").is_none());
    }
}
