use nom::combinator::all_consuming;
use nom::sequence::pair;

use super::common::{hostport, params};
use crate::error::{Error, Result};
use crate::types::param::Params;
use crate::types::uri::{Scheme, Uri};

/// Parses a URI. `sip`/`sips` URIs are decomposed; any other scheme keeps
/// everything after the colon in `host`.
pub fn parse_uri(input: &str) -> Result<Uri> {
    let input = input.trim();
    let colon = input
        .find(':')
        .ok_or_else(|| Error::InvalidUri(format!("no scheme in '{}'", input)))?;
    let scheme_str = &input[..colon];
    if scheme_str.is_empty() || !scheme_str.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return Err(Error::InvalidUri(format!("bad scheme in '{}'", input)));
    }
    let body = &input[colon + 1..];
    let scheme = match scheme_str.to_ascii_lowercase().as_str() {
        "sip" => Scheme::Sip,
        "sips" => Scheme::Sips,
        "tel" => Scheme::Tel,
        other => Scheme::Other(other.to_string()),
    };

    match scheme {
        Scheme::Sip | Scheme::Sips => parse_sip_body(scheme, body, input),
        _ => Ok(Uri {
            scheme,
            user: None,
            host: body.to_string(),
            port: None,
            params: Params::new(),
            headers: None,
        }),
    }
}

fn parse_sip_body(scheme: Scheme, body: &str, whole: &str) -> Result<Uri> {
    let (main, headers) = match body.split_once('?') {
        Some((main, headers)) => (main, Some(headers.to_string())),
        None => (body, None),
    };
    let (user, host_part) = match main.rfind('@') {
        Some(at) => (Some(main[..at].to_string()), &main[at + 1..]),
        None => (None, main),
    };
    if user.as_deref() == Some("") {
        return Err(Error::InvalidUri(format!("empty user in '{}'", whole)));
    }

    let (_, ((host, port), params)) = all_consuming(pair(hostport, params))(host_part)
        .map_err(|_| Error::InvalidUri(whole.to_string()))?;

    Ok(Uri {
        scheme,
        user,
        host: host.to_string(),
        port,
        params,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_sip_uri() {
        let uri = parse_uri("sip:alice:secret@atlanta.com:5070;transport=tcp;lr?subject=hi").unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("alice:secret"));
        assert_eq!(uri.host, "atlanta.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.transport_param(), Some("tcp"));
        assert!(uri.params.contains("lr"));
        assert_eq!(uri.headers.as_deref(), Some("subject=hi"));
    }

    #[test]
    fn test_parse_sips_ipv6_and_roundtrip() {
        let uri = parse_uri("sips:[2001:db8::10]:5061").unwrap();
        assert!(uri.is_secure());
        assert_eq!(uri.host, "2001:db8::10");
        assert_eq!(uri.to_string(), "sips:[2001:db8::10]:5061");
    }

    #[test]
    fn test_non_sip_scheme_kept_opaque() {
        let uri = parse_uri("tel:+1-201-555-0123").unwrap();
        assert_eq!(uri.scheme, Scheme::Tel);
        assert_eq!(uri.host, "+1-201-555-0123");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_uri("nocolon").is_err());
        assert!(parse_uri("sip:host with space").is_err());
        assert!(parse_uri("sip:@host").is_err());
    }
}
