use nom::{
    character::complete::{char, space0, space1},
    combinator::all_consuming,
    sequence::tuple,
};
use tracing::trace;

use super::common::{hostport, params, quoted_string, split_header_list, token};
use super::uri::parse_uri;
use super::ParseResult;
use crate::error::{Error, Result};
use crate::types::address::NameAddr;
use crate::types::cseq::CSeq;
use crate::types::header::{Header, HeaderName};
use crate::types::method::Method;
use crate::types::param::Params;
use crate::types::via::Via;

fn via_value(input: &str) -> ParseResult<Via> {
    let (input, (name, _, _, _, version, _, _, _, transport)) = tuple((
        token,
        space0,
        char('/'),
        space0,
        token,
        space0,
        char('/'),
        space0,
        token,
    ))(input)?;
    let (input, _) = space1(input)?;
    let (input, (host, port)) = hostport(input)?;
    let (input, params) = params(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        Via {
            protocol: format!("{}/{}", name.to_ascii_uppercase(), version),
            transport: transport.to_ascii_uppercase(),
            sent_host: host.to_string(),
            sent_port: port,
            params,
        },
    ))
}

pub fn parse_via(value: &str) -> Result<Via> {
    all_consuming(via_value)(value.trim())
        .map(|(_, via)| via)
        .map_err(|e| Error::header("Via", format!("{}: {:?}", value, e)))
}

fn parse_header_params(input: &str, header: &'static str) -> Result<Params> {
    all_consuming(params)(input.trim())
        .map(|(_, p)| p)
        .map_err(|_| Error::header(header, format!("bad parameters '{}'", input)))
}

/// Parses `["display"] <uri>;params`, `display <uri>;params` or `uri;params`
pub fn parse_name_addr(value: &str, header: &'static str) -> Result<NameAddr> {
    let value = value.trim();
    let mut display_name = None;
    let mut rest = value;

    if rest.starts_with('"') {
        let (after, quoted) = quoted_string(rest)
            .map_err(|_| Error::header(header, "unterminated display name"))?;
        display_name = Some(quoted[1..quoted.len() - 1].to_string());
        rest = after.trim_start();
    }

    if let Some(lt) = rest.find('<') {
        if display_name.is_none() {
            let name = rest[..lt].trim();
            if !name.is_empty() {
                display_name = Some(name.to_string());
            }
        }
        let gt = rest[lt..]
            .find('>')
            .map(|i| i + lt)
            .ok_or_else(|| Error::header(header, "missing '>'"))?;
        let uri = parse_uri(&rest[lt + 1..gt])?;
        let params = parse_header_params(&rest[gt + 1..], header)?;
        return Ok(NameAddr {
            display_name,
            uri,
            params,
        });
    }

    if display_name.is_some() {
        return Err(Error::header(header, "display name without <uri>"));
    }

    // addr-spec form: parameters after the first ';' belong to the header
    let (uri_part, params_part) = match rest.find(';') {
        Some(semi) => (&rest[..semi], &rest[semi..]),
        None => (rest, ""),
    };
    Ok(NameAddr {
        display_name: None,
        uri: parse_uri(uri_part)?,
        params: parse_header_params(params_part, header)?,
    })
}

pub fn parse_cseq(value: &str) -> Result<CSeq> {
    let mut parts = value.split_whitespace();
    let seq = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| Error::header("CSeq", format!("bad sequence in '{}'", value)))?;
    let method: Method = parts
        .next()
        .ok_or_else(|| Error::header("CSeq", "missing method"))?
        .parse()
        .map_err(|_| Error::header("CSeq", format!("bad method in '{}'", value)))?;
    if parts.next().is_some() {
        return Err(Error::header("CSeq", format!("trailing data in '{}'", value)));
    }
    Ok(CSeq::new(seq, method))
}

fn leading_number(value: &str) -> Option<u32> {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn parse_list(value: &str, header: &'static str) -> Result<Vec<NameAddr>> {
    split_header_list(value)
        .into_iter()
        .map(|v| parse_name_addr(v, header))
        .collect()
}

/// Turns one wire header line into typed headers.
///
/// Comma-separated lists (Via, Contact, Route, Record-Route) expand into one
/// [`Header`] per value. Failures on the headers the transaction layer
/// depends on are errors; failures on the others downgrade the line to
/// [`Header::Other`].
pub fn parse_header(name: &str, value: &str) -> Result<Vec<Header>> {
    let value = value.trim();
    let typed = match HeaderName::from_wire(name) {
        Some(typed) => typed,
        None => return Ok(vec![Header::Other(name.to_string(), value.to_string())]),
    };

    match typed {
        HeaderName::Via => split_header_list(value)
            .into_iter()
            .map(|v| parse_via(v).map(Header::Via))
            .collect::<Result<Vec<_>>>(),
        HeaderName::From => parse_name_addr(value, "From").map(|a| vec![Header::From(a)]),
        HeaderName::To => parse_name_addr(value, "To").map(|a| vec![Header::To(a)]),
        HeaderName::CallId => {
            if value.is_empty() || value.chars().any(|c| c.is_whitespace()) {
                Err(Error::header("Call-ID", format!("bad value '{}'", value)))
            } else {
                Ok(vec![Header::CallId(value.to_string())])
            }
        }
        HeaderName::CSeq => parse_cseq(value).map(|c| vec![Header::CSeq(c)]),
        // handled by the message parser
        HeaderName::ContentLength => Ok(Vec::new()),
        _ => {
            let lenient = match typed {
                HeaderName::Contact if value == "*" => None,
                HeaderName::Contact => parse_list(value, "Contact")
                    .ok()
                    .map(|l| l.into_iter().map(Header::Contact).collect()),
                HeaderName::Route => parse_list(value, "Route")
                    .ok()
                    .map(|l| l.into_iter().map(Header::Route).collect()),
                HeaderName::RecordRoute => parse_list(value, "Record-Route")
                    .ok()
                    .map(|l| l.into_iter().map(Header::RecordRoute).collect()),
                HeaderName::ReferredBy => parse_name_addr(value, "Referred-By")
                    .ok()
                    .map(|a| vec![Header::ReferredBy(a)]),
                HeaderName::MaxForwards => value.parse().ok().map(|n| vec![Header::MaxForwards(n)]),
                HeaderName::RetryAfter => leading_number(value).map(|n| vec![Header::RetryAfter(n)]),
                _ => None,
            };
            Ok(lenient.unwrap_or_else(|| {
                trace!(header = name, value, "keeping header untyped");
                vec![Header::Other(typed.as_str().to_string(), value.to_string())]
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_via_with_params() {
        let via = parse_via("SIP/2.0/udp pc33.atlanta.com:5066 ;branch=z9hG4bK776;rport").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.sent_host, "pc33.atlanta.com");
        assert_eq!(via.sent_port, Some(5066));
        assert_eq!(via.branch(), Some("z9hG4bK776"));
        assert_eq!(via.rport(), Some(None));
    }

    #[test]
    fn test_parse_via_ipv6() {
        let via = parse_via("SIP/2.0/TCP [2001:db8::9]:5060;branch=z9hG4bKx;received=2001:db8::1").unwrap();
        assert_eq!(via.sent_host, "2001:db8::9");
        assert_eq!(via.received(), Some("2001:db8::1"));
    }

    #[test]
    fn test_via_list_expands() {
        let headers = parse_header(
            "v",
            "SIP/2.0/UDP a.com;branch=z9hG4bK1, SIP/2.0/UDP b.com:5070;branch=z9hG4bK2",
        )
        .unwrap();
        assert_eq!(headers.len(), 2);
        assert!(matches!(&headers[1], Header::Via(v) if v.sent_host == "b.com"));
    }

    #[test]
    fn test_name_addr_forms() {
        let a = parse_name_addr("\"Bob B\" <sip:bob@biloxi.com>;tag=a6c85cf", "To").unwrap();
        assert_eq!(a.display_name.as_deref(), Some("Bob B"));
        assert_eq!(a.tag(), Some("a6c85cf"));

        let b = parse_name_addr("Alice <sip:alice@atlanta.com;transport=tcp>", "From").unwrap();
        assert_eq!(b.display_name.as_deref(), Some("Alice"));
        assert_eq!(b.uri.transport_param(), Some("tcp"));
        assert!(b.params.is_empty());

        let c = parse_name_addr("sip:carol@chicago.com;tag=887s", "From").unwrap();
        assert_eq!(c.tag(), Some("887s"));
        assert!(c.uri.params.is_empty());
    }

    #[test]
    fn test_cseq_and_bad_cseq() {
        let c = parse_cseq("4711 INVITE").unwrap();
        assert_eq!(c.seq, 4711);
        assert_eq!(c.method, Method::Invite);
        assert!(parse_cseq("abc INVITE").is_err());
        assert!(parse_cseq("1").is_err());
    }

    #[test]
    fn test_lenient_headers_fall_back_to_other() {
        let h = parse_header("Contact", "*").unwrap();
        assert_eq!(h, vec![Header::Other("Contact".into(), "*".into())]);
        let h = parse_header("Retry-After", "120 (maintenance);duration=60").unwrap();
        assert_eq!(h, vec![Header::RetryAfter(120)]);
        let h = parse_header("X-Custom", " hello ").unwrap();
        assert_eq!(h, vec![Header::Other("X-Custom".into(), "hello".into())]);
    }
}
