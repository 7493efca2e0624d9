//! # Tuple
//!
//! A [`Tuple`] names one end of a SIP hop: IP address, port, transport type,
//! and for secure transports the TLS domain the peer is expected to present.
//! It also carries two bits of routing state that the transport layer patches
//! in once it has chosen where a message goes:
//!
//! - the key of the [`Transport`](crate::Transport) instance that owns the binding
//! - the identifier of the stream connection to reuse
//!
//! ## Equality, ordering and hashing
//!
//! Two tuples are equal when address, port and transport type match. For
//! `TLS`/`DTLS` the target domain must match too, because several secure
//! transports can share one bind address while serving different identities.
//! The transport key and connection id never take part in comparisons.
//!
//! Ordering is `(transport type, address family, address bytes, port)`, with the
//! target domain as a final tie-break for secure types. IPv6 sorts before IPv4.
//!
//! The hash covers address, port and transport type only. The target domain is
//! left out even though secure equality uses it: tuples that differ only by
//! domain collide in a hash map but are still told apart by `Eq`.
//!
//! ```
//! use voxstack_sip_transport::{Tuple, TransportType};
//!
//! let a: Tuple = Tuple::new("127.0.0.1:5060".parse().unwrap(), TransportType::Udp);
//! let b: Tuple = Tuple::new("127.5.5.5:5060".parse().unwrap(), TransportType::Udp);
//! assert!(a.is_loopback());
//! assert!(a.is_equal_with_mask(&b, 8, false, false));
//! assert_ne!(a, b);
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::TransportError;

/// Identifies a registered transport inside the selector. 0 means unbound.
pub type TransportKey = u32;

/// Identifies a stream connection inside its transport. 0 means none.
pub type ConnectionId = u64;

/// Transport protocols. The declaration order is the ordering used by
/// [`Tuple`] and by the selector's maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TransportType {
    #[default]
    Unknown,
    Tls,
    Tcp,
    Udp,
    Dtls,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Unknown => "UNKNOWN",
            TransportType::Tls => "TLS",
            TransportType::Tcp => "TCP",
            TransportType::Udp => "UDP",
            TransportType::Dtls => "DTLS",
        }
    }

    /// TLS or DTLS
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportType::Tls | TransportType::Dtls)
    }

    /// Stream transports: the kernel does retransmission for us
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportType::Tcp | TransportType::Tls)
    }

    pub fn is_stream_oriented(&self) -> bool {
        self.is_reliable()
    }

    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            5061
        } else {
            5060
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            TransportType::Unknown => 0,
            TransportType::Tls => 1,
            TransportType::Tcp => 2,
            TransportType::Udp => 3,
            TransportType::Dtls => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => TransportType::Unknown,
            1 => TransportType::Tls,
            2 => TransportType::Tcp,
            3 => TransportType::Udp,
            4 => TransportType::Dtls,
            _ => return None,
        })
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportType::Udp),
            "TCP" => Ok(TransportType::Tcp),
            "TLS" => Ok(TransportType::Tls),
            "DTLS" => Ok(TransportType::Dtls),
            _ => Err(TransportError::UnknownTransportType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V6,
    V4,
}

impl IpVersion {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// The wildcard address of this family
    pub fn any(&self) -> IpAddr {
        match self {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpVersion::V4 => "V4",
            IpVersion::V6 => "V6",
        })
    }
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// An endpoint plus transport binding. See the [module docs](self).
#[derive(Debug, Clone)]
pub struct Tuple {
    addr: SocketAddr,
    transport_type: TransportType,
    target_domain: String,
    transport_key: TransportKey,
    connection_id: ConnectionId,
    only_use_existing_connection: bool,
}

impl Tuple {
    pub fn new(addr: SocketAddr, transport_type: TransportType) -> Self {
        Tuple {
            addr,
            transport_type,
            target_domain: String::new(),
            transport_key: 0,
            connection_id: 0,
            only_use_existing_connection: false,
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16, transport_type: TransportType) -> Self {
        Tuple::new(SocketAddr::new(ip, port), transport_type)
    }

    /// Parses a textual IP literal (no host names)
    pub fn parse(ip: &str, port: u16, transport_type: TransportType) -> Result<Self, TransportError> {
        let ip: IpAddr = ip
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| TransportError::InvalidAddress(ip.to_string()))?;
        Ok(Tuple::from_ip(ip, port, transport_type))
    }

    /// The wildcard address for `version` with the given port and type
    pub fn any(version: IpVersion, port: u16, transport_type: TransportType) -> Self {
        Tuple::from_ip(version.any(), port, transport_type)
    }

    pub fn with_target_domain(mut self, domain: impl Into<String>) -> Self {
        self.target_domain = domain.into();
        self
    }

    pub fn with_transport_key(mut self, key: TransportKey) -> Self {
        self.transport_key = key;
        self
    }

    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = id;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn ip_version(&self) -> IpVersion {
        IpVersion::of(&self.addr.ip())
    }

    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn target_domain(&self) -> &str {
        &self.target_domain
    }

    pub fn transport_key(&self) -> TransportKey {
        self.transport_key
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn only_use_existing_connection(&self) -> bool {
        self.only_use_existing_connection
    }

    pub fn set_only_use_existing_connection(&mut self, only: bool) {
        self.only_use_existing_connection = only;
    }

    /// Patched in by the selector once the bound port is known
    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }

    /// Patched in by the selector once a transport has been chosen
    pub fn set_transport_key(&mut self, key: TransportKey) {
        self.transport_key = key;
    }

    pub fn set_connection_id(&mut self, id: ConnectionId) {
        self.connection_id = id;
    }

    pub fn set_transport_type(&mut self, transport_type: TransportType) {
        self.transport_type = transport_type;
    }

    pub fn set_target_domain(&mut self, domain: impl Into<String>) {
        self.target_domain = domain.into();
    }

    pub fn is_any_interface(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    /// 127.0.0.0/8 or ::1
    pub fn is_loopback(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(v4) => v4.octets()[0] == 127,
            IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
        }
    }

    /// RFC 1918 ranges for IPv4, unique-local fc00::/7 for IPv6
    pub fn is_private_address(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                o[0] == 10 || (o[0] == 172 && (o[1] & 0xf0) == 16) || (o[0] == 192 && o[1] == 168)
            }
            IpAddr::V6(v6) => (v6.octets()[0] & 0xfe) == 0xfc,
        }
    }

    /// Compares the leading `mask_bits` of the two addresses, optionally
    /// ignoring port and transport type. Different address families never match.
    pub fn is_equal_with_mask(
        &self,
        other: &Tuple,
        mask_bits: u32,
        ignore_port: bool,
        ignore_transport: bool,
    ) -> bool {
        if self.ip_version() != other.ip_version() {
            return false;
        }
        if !ignore_port && self.port() != other.port() {
            return false;
        }
        if !ignore_transport && self.transport_type != other.transport_type {
            return false;
        }
        let a = ip_bytes(&self.ip());
        let b = ip_bytes(&other.ip());
        let mask_bits = (mask_bits as usize).min(a.len() * 8);
        let full = mask_bits / 8;
        if a[..full] != b[..full] {
            return false;
        }
        let rem = mask_bits % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (a[full] & mask) == (b[full] & mask)
    }

    /// Compact opaque identifier of this flow (RFC 5626 style), hex encoded.
    /// Decodes back with [`Tuple::from_flow_token`].
    pub fn flow_token(&self) -> String {
        let mut raw = Vec::with_capacity(32);
        raw.extend_from_slice(&self.transport_key.to_be_bytes());
        raw.extend_from_slice(&self.connection_id.to_be_bytes());
        raw.push(self.transport_type.to_u8());
        raw.push(if self.is_v4() { 4 } else { 6 });
        raw.extend_from_slice(&ip_bytes(&self.ip()));
        raw.extend_from_slice(&self.port().to_be_bytes());
        raw.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_flow_token(token: &str) -> Option<Tuple> {
        if token.len() % 2 != 0 {
            return None;
        }
        let raw: Vec<u8> = (0..token.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(token.get(i..i + 2)?, 16).ok())
            .collect::<Option<_>>()?;
        if raw.len() < 14 {
            return None;
        }
        let key = u32::from_be_bytes(raw[0..4].try_into().ok()?);
        let conn = u64::from_be_bytes(raw[4..12].try_into().ok()?);
        let transport_type = TransportType::from_u8(raw[12])?;
        let (ip, rest) = match raw[13] {
            4 if raw.len() == 14 + 4 + 2 => {
                let octets: [u8; 4] = raw[14..18].try_into().ok()?;
                (IpAddr::from(octets), &raw[18..])
            }
            6 if raw.len() == 14 + 16 + 2 => {
                let octets: [u8; 16] = raw[14..30].try_into().ok()?;
                (IpAddr::from(octets), &raw[30..])
            }
            _ => return None,
        };
        let port = u16::from_be_bytes(rest.try_into().ok()?);
        Some(
            Tuple::from_ip(ip, port, transport_type)
                .with_transport_key(key)
                .with_connection_id(conn),
        )
    }

    fn secure_domain_cmp(&self, other: &Tuple) -> Ordering {
        if self.transport_type.is_secure() {
            self.target_domain.cmp(&other.target_domain)
        } else {
            Ordering::Equal
        }
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Tuple {}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.transport_type
            .cmp(&other.transport_type)
            .then_with(|| self.ip_version().cmp(&other.ip_version()))
            .then_with(|| ip_bytes(&self.ip()).cmp(&ip_bytes(&other.ip())))
            .then_with(|| self.port().cmp(&other.port()))
            .then_with(|| self.secure_domain_cmp(other))
    }
}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.ip().hash(state);
        self.addr.port().hash(state);
        self.transport_type.hash(state);
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ {} {} {}",
            self.ip_version(),
            self.addr,
            self.transport_type
        )?;
        if !self.target_domain.is_empty() {
            write!(f, " target domain={}", self.target_domain)?;
        }
        if self.transport_key != 0 {
            write!(f, " key={}", self.transport_key)?;
        }
        if self.connection_id != 0 {
            write!(f, " connection={}", self.connection_id)?;
        }
        f.write_str(" ]")
    }
}

/// Key of the any-interface map: a transport bound to the wildcard address
/// matches any local address of its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyInterfaceKey {
    pub transport_type: TransportType,
    pub port: u16,
    pub ip_version: IpVersion,
}

impl From<&Tuple> for AnyInterfaceKey {
    fn from(t: &Tuple) -> Self {
        AnyInterfaceKey {
            transport_type: t.transport_type(),
            port: t.port(),
            ip_version: t.ip_version(),
        }
    }
}

/// Key of the any-port map: a specific interface, port ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyPortKey {
    pub transport_type: TransportType,
    pub ip: IpAddr,
}

impl From<&Tuple> for AnyPortKey {
    fn from(t: &Tuple) -> Self {
        AnyPortKey {
            transport_type: t.transport_type(),
            ip: t.ip(),
        }
    }
}

/// Key of the any-port, any-interface map: only type and family matter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnyPortAnyInterfaceKey {
    pub transport_type: TransportType,
    pub ip_version: IpVersion,
}

impl From<&Tuple> for AnyPortAnyInterfaceKey {
    fn from(t: &Tuple) -> Self {
        AnyPortAnyInterfaceKey {
            transport_type: t.transport_type(),
            ip_version: t.ip_version(),
        }
    }
}

/// Key of the secure transport map
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TlsTransportKey {
    pub domain: String,
    pub transport_type: TransportType,
    pub ip_version: IpVersion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn t(addr: &str, tt: TransportType) -> Tuple {
        Tuple::new(addr.parse().unwrap(), tt)
    }

    fn hash_of(t: &Tuple) -> u64 {
        let mut h = DefaultHasher::new();
        t.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_domain_ignored_for_plain_transports() {
        let a = t("10.0.0.1:5060", TransportType::Udp).with_target_domain("a.com");
        let b = t("10.0.0.1:5060", TransportType::Udp).with_target_domain("b.com");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_domain_matters_for_secure_transports() {
        let a = t("10.0.0.1:5061", TransportType::Tls).with_target_domain("a.com");
        let b = t("10.0.0.1:5061", TransportType::Tls).with_target_domain("b.com");
        assert_ne!(a, b);
        // hash deliberately ignores the domain
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a, a.clone().with_transport_key(7).with_connection_id(3));
    }

    #[test]
    fn test_ordering_type_first_then_v6_before_v4() {
        let tls = t("10.0.0.1:1", TransportType::Tls);
        let udp = t("1.0.0.1:1", TransportType::Udp);
        assert!(tls < udp);
        let v6 = t("[::2]:5060", TransportType::Udp);
        let v4 = t("1.1.1.1:5060", TransportType::Udp);
        assert!(v6 < v4);
        assert!(t("1.1.1.1:5060", TransportType::Udp) < t("1.1.1.1:5061", TransportType::Udp));
    }

    #[test]
    fn test_loopback_mask() {
        let a = t("127.0.0.1:5060", TransportType::Udp);
        assert!(a.is_equal_with_mask(&t("127.5.5.5:5060", TransportType::Udp), 8, false, false));
        assert!(!a.is_equal_with_mask(&t("10.0.0.1:5060", TransportType::Udp), 8, false, false));
        assert!(!a.is_equal_with_mask(&t("127.5.5.5:5070", TransportType::Udp), 8, false, false));
        assert!(a.is_equal_with_mask(&t("127.5.5.5:5070", TransportType::Udp), 8, true, false));
        assert!(!a.is_equal_with_mask(&t("127.5.5.5:5060", TransportType::Tcp), 8, false, false));
        assert!(a.is_equal_with_mask(&t("127.5.5.5:5060", TransportType::Tcp), 8, false, true));
        assert!(!a.is_equal_with_mask(&t("[::1]:5060", TransportType::Udp), 8, false, false));
        // partial-octet mask
        let p = t("192.168.17.1:1", TransportType::Udp);
        assert!(p.is_equal_with_mask(&t("192.168.31.9:1", TransportType::Udp), 20, false, false));
        assert!(!p.is_equal_with_mask(&t("192.168.32.9:1", TransportType::Udp), 20, false, false));
    }

    #[test]
    fn test_address_classes() {
        assert!(t("127.0.0.1:0", TransportType::Udp).is_loopback());
        assert!(t("[::1]:0", TransportType::Udp).is_loopback());
        assert!(t("0.0.0.0:5060", TransportType::Udp).is_any_interface());
        assert!(t("[::]:5060", TransportType::Udp).is_any_interface());
        assert!(t("172.20.1.1:0", TransportType::Udp).is_private_address());
        assert!(!t("172.32.1.1:0", TransportType::Udp).is_private_address());
        assert!(t("[fd00::1]:0", TransportType::Udp).is_private_address());
        assert!(!t("8.8.8.8:0", TransportType::Udp).is_private_address());
    }

    #[test]
    fn test_flow_token_roundtrip() {
        let tuple = t("[2001:db8::7]:5071", TransportType::Tls)
            .with_transport_key(12)
            .with_connection_id(99);
        let decoded = Tuple::from_flow_token(&tuple.flow_token()).unwrap();
        assert_eq!(decoded, tuple);
        assert_eq!(decoded.transport_key(), 12);
        assert_eq!(decoded.connection_id(), 99);
        assert!(Tuple::from_flow_token("zz").is_none());
        assert!(Tuple::from_flow_token("").is_none());
    }

    #[test]
    fn test_display() {
        let tuple = t("10.1.1.1:5060", TransportType::Udp).with_transport_key(2);
        assert_eq!(tuple.to_string(), "[ V4 10.1.1.1:5060 UDP key=2 ]");
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        fn any_type() -> impl Strategy<Value = TransportType> {
            prop_oneof![
                Just(TransportType::Udp),
                Just(TransportType::Tcp),
                Just(TransportType::Tls),
                Just(TransportType::Dtls),
            ]
        }

        proptest! {
            #[test]
            fn ordering_agrees_with_equality_and_hash(
                a in any::<[u8; 4]>(), pa in any::<u16>(), ta in any_type(),
                b in any::<[u8; 4]>(), pb in any::<u16>(), tb in any_type(),
            ) {
                let x = Tuple::from_ip(IpAddr::from(a), pa, ta);
                let y = Tuple::from_ip(IpAddr::from(b), pb, tb);
                prop_assert_eq!(x.cmp(&y), y.cmp(&x).reverse());
                prop_assert_eq!(x == y, x.cmp(&y) == Ordering::Equal);
                if x == y {
                    prop_assert_eq!(hash_of(&x), hash_of(&y));
                }
            }

            #[test]
            fn flow_token_decodes_to_same_flow(
                a in any::<[u8; 16]>(), port in any::<u16>(), t in any_type(),
                key in any::<u32>(), conn in any::<u64>(),
            ) {
                let tuple = Tuple::from_ip(IpAddr::from(a), port, t)
                    .with_transport_key(key)
                    .with_connection_id(conn);
                let decoded = Tuple::from_flow_token(&tuple.flow_token()).unwrap();
                prop_assert_eq!(decoded.socket_addr(), tuple.socket_addr());
                prop_assert_eq!(decoded.transport_type(), t);
                prop_assert_eq!(decoded.transport_key(), key);
                prop_assert_eq!(decoded.connection_id(), conn);
            }
        }
    }
}
