use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_till, take_while1},
    character::complete::{char, digit1, space0},
    combinator::{map, map_res, opt, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
};

use super::ParseResult;
use crate::types::method::is_token_byte;
use crate::types::param::{Param, Params};

/// RFC 3261 `token`
pub fn token(input: &str) -> ParseResult<&str> {
    take_while1(|c: char| c.is_ascii() && is_token_byte(c as u8))(input)
}

/// `SIP/2.0`
pub fn sip_version(input: &str) -> ParseResult<&str> {
    recognize(tuple((tag_no_case("SIP/"), digit1, char('.'), digit1)))(input)
}

/// `"..."` including the quotes, honouring backslash escapes
pub fn quoted_string(input: &str) -> ParseResult<&str> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'"') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        )));
    }
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok((&input[i + 1..], &input[..i + 1])),
            _ => i += 1,
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

/// Host name, IPv4 literal, or bracketed IPv6 literal (brackets stripped)
pub fn host(input: &str) -> ParseResult<&str> {
    alt((
        delimited(char('['), take_while1(|c: char| c != ']'), char(']')),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'),
    ))(input)
}

pub fn port(input: &str) -> ParseResult<u16> {
    map_res(digit1, |s: &str| s.parse::<u16>())(input)
}

pub fn hostport(input: &str) -> ParseResult<(&str, Option<u16>)> {
    pair(host, opt(preceded(char(':'), port)))(input)
}

fn param_value(input: &str) -> ParseResult<&str> {
    alt((
        quoted_string,
        take_while1(|c: char| !matches!(c, ';' | ',' | ' ' | '\t' | '?' | '>')),
    ))(input)
}

fn param(input: &str) -> ParseResult<Param> {
    map(
        pair(
            token,
            opt(preceded(tuple((space0, char('='), space0)), param_value)),
        ),
        |(name, value): (&str, Option<&str>)| Param::new(name, value.map(str::to_string)),
    )(input)
}

/// Zero or more `;name[=value]` parameters
pub fn params(input: &str) -> ParseResult<Params> {
    map(
        many0(preceded(tuple((space0, char(';'), space0)), param)),
        |list| list.into_iter().collect(),
    )(input)
}

/// Everything up to the end of input, trimmed of trailing whitespace
pub fn rest_of_line(input: &str) -> ParseResult<&str> {
    map(take_till(|c| c == '\r' || c == '\n'), str::trim_end)(input)
}

/// Splits a comma-separated header value, ignoring commas inside quotes
/// and angle brackets.
pub fn split_header_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}
