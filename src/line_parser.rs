//! Parses one kernel packet-filter drop-log line into a validated [`Event`].
//!
//! Pure, synchronous, and dependency-free beyond `sha2`/`chrono`: no I/O
//! happens here. [`LogTailer`](crate::log_tailer) hands raw lines to
//! [`parse`], and the [`PolicyEngine`](crate::policy) consumes the result.

use std::collections::HashMap;
use std::fmt;

use chrono::Datelike;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Direction is fully determined by which of IN/OUT carry a non-empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Some(Direction::Forward),
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed, validated 6-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    fn from_tokens(tokens: &[&str]) -> Option<MacAddr> {
        if tokens.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, tok) in tokens.iter().enumerate() {
            bytes[i] = u8::from_str_radix(tok, 16).ok()?;
        }
        Some(MacAddr(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

/// The eleven TCP flag barewords the kernel emits inline in the log text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub ack: bool,
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub ece: bool,
    pub ect: bool,
    pub cwr: bool,
    pub ce: bool,
    pub df: bool,
}

const FLAG_NAMES: [(&str, fn(&mut TcpFlags)); 11] = [
    ("ACK", |f| f.ack = true),
    ("FIN", |f| f.fin = true),
    ("SYN", |f| f.syn = true),
    ("RST", |f| f.rst = true),
    ("PSH", |f| f.psh = true),
    ("URG", |f| f.urg = true),
    ("ECE", |f| f.ece = true),
    ("ECT", |f| f.ect = true),
    ("CWR", |f| f.cwr = true),
    ("CE", |f| f.ce = true),
    ("DF", |f| f.df = true),
];

/// A single validated drop-log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub line: String,
    pub hash: String,
    pub timestamp: i64,
    pub hostname: String,
    pub log_statement: String,
    pub direction: Direction,
    pub r#in: Option<String>,
    pub out: Option<String>,
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src: String,
    pub dst: String,
    pub spt: u16,
    pub dpt: u16,
    pub proto: String,
    pub l3_len: Option<u32>,
    pub tos: Option<u32>,
    pub prec: Option<u32>,
    pub ttl: Option<u32>,
    pub id: Option<u32>,
    pub l4_len: Option<u32>,
    pub window: Option<u32>,
    pub res: Option<u32>,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    MissingIn,
    MissingKernelMarker,
    BadTimestamp,
    BadMac,
    SelfLoop,
    MissingRequiredParameter(&'static str),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorKind::MissingIn => write!(f, "missing ' IN=' marker"),
            ParseErrorKind::MissingKernelMarker => write!(f, "missing ' kernel: ' marker"),
            ParseErrorKind::BadTimestamp => write!(f, "unparsable timestamp"),
            ParseErrorKind::BadMac => write!(f, "malformed MAC address field"),
            ParseErrorKind::SelfLoop => write!(f, "IN and OUT interfaces are identical"),
            ParseErrorKind::MissingRequiredParameter(name) => {
                write!(f, "missing required parameter: {}", name)
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {line}")]
pub struct ParseError {
    pub line: String,
    pub kind: ParseErrorKind,
}

impl ParseError {
    fn new(line: &str, kind: ParseErrorKind) -> ParseError {
        ParseError {
            line: line.to_owned(),
            kind,
        }
    }
}

/// Find ` NAME=VALUE`, where VALUE is a (possibly empty) run of non-whitespace.
fn find_param<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!(" {}=", name);
    let idx = line.find(&marker)?;
    let rest = &line[idx + marker.len()..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn parse_int_param(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(secs);
    }
    let year = chrono::Utc::now().year();
    let with_year = format!("{} {}", year, raw);
    let parsed = chrono::NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S").ok()?;
    Some(parsed.and_utc().timestamp())
}

/// Parse a raw log line with no protocol-number-to-name mapping available.
pub fn parse(raw: &str) -> Result<Event, ParseError> {
    parse_with_protocols(raw, None)
}

/// Parse a raw log line, mapping a numeric PROTO token through `protocols`
/// (as produced by [`crate::adapters::protocols`]) when possible.
pub fn parse_with_protocols(
    raw: &str,
    protocols: Option<&HashMap<String, String>>,
) -> Result<Event, ParseError> {
    let line = raw.trim().to_string();

    if !line.contains(" IN=") {
        return Err(ParseError::new(&line, ParseErrorKind::MissingIn));
    }

    let (pre_in, _) = line.split_once(" IN=").expect("checked above");
    if !pre_in.contains(" kernel: ") {
        return Err(ParseError::new(&line, ParseErrorKind::MissingKernelMarker));
    }

    let (front, log_statement) = pre_in.split_once(" kernel: ").expect("checked above");
    let log_statement = log_statement.trim().to_string();

    let mut front_words: Vec<&str> = front.trim().split_whitespace().collect();
    let hostname = front_words
        .pop()
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::BadTimestamp))?
        .to_string();
    let raw_timestamp = front_words.join(" ");
    let timestamp = parse_timestamp(&raw_timestamp)
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::BadTimestamp))?;

    let mut flags = TcpFlags::default();
    for (name, setter) in FLAG_NAMES.iter() {
        let token_re = format!(" {}", name);
        if line.contains(&token_re)
            && line
                .split_whitespace()
                .any(|word| word == *name)
        {
            setter(&mut flags);
        }
    }

    let in_val = find_param(&line, "IN").map(|s| s.to_string());
    let out_val = find_param(&line, "OUT").map(|s| s.to_string());

    let mac_field = find_param(&line, "MAC")
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::MissingRequiredParameter("MAC")))?;
    let mac_tokens: Vec<&str> = mac_field.split(':').collect();
    if mac_tokens.len() < 12 {
        return Err(ParseError::new(&line, ParseErrorKind::BadMac));
    }
    let dst_mac = MacAddr::from_tokens(&mac_tokens[0..6])
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::BadMac))?;
    let src_mac = MacAddr::from_tokens(&mac_tokens[6..12])
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::BadMac))?;

    let src = find_param(&line, "SRC")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::MissingRequiredParameter("SRC")))?
        .to_string();
    let dst = find_param(&line, "DST")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::MissingRequiredParameter("DST")))?
        .to_string();

    let mut proto = find_param(&line, "PROTO")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::new(&line, ParseErrorKind::MissingRequiredParameter("PROTO")))?
        .to_string();
    if let (Some(table), true) = (protocols, proto.chars().all(|c| c.is_ascii_digit())) {
        if let Some(name) = table.get(&proto) {
            proto = name.clone();
        }
    }

    let tos = find_param(&line, "TOS").and_then(parse_int_param);
    let prec = find_param(&line, "PREC").and_then(parse_int_param);
    let ttl = find_param(&line, "TTL").and_then(parse_int_param);
    let id = find_param(&line, "ID").and_then(parse_int_param);
    let l3_len = find_param(&line, "LEN").and_then(parse_int_param);
    let l4_len = find_param(&line, "L4_LEN").and_then(parse_int_param);
    let window = find_param(&line, "WINDOW").and_then(parse_int_param);
    let res = find_param(&line, "RES").and_then(parse_int_param);

    let is_tcp_or_udp = proto.eq_ignore_ascii_case("tcp") || proto.eq_ignore_ascii_case("udp");
    let spt = find_param(&line, "SPT").and_then(parse_int_param);
    let dpt = find_param(&line, "DPT").and_then(parse_int_param);
    let (spt, dpt) = if is_tcp_or_udp {
        (
            spt.ok_or_else(|| {
                ParseError::new(&line, ParseErrorKind::MissingRequiredParameter("SPT"))
            })? as u16,
            dpt.ok_or_else(|| {
                ParseError::new(&line, ParseErrorKind::MissingRequiredParameter("DPT"))
            })? as u16,
        )
    } else {
        (spt.unwrap_or(0) as u16, dpt.unwrap_or(0) as u16)
    };

    let in_present = in_val.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
    let out_present = out_val.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
    let direction = match (in_present, out_present) {
        (true, false) => Direction::Inbound,
        (false, true) => Direction::Outbound,
        (false, false) => Direction::Forward,
        (true, true) => {
            if in_val == out_val {
                return Err(ParseError::new(&line, ParseErrorKind::SelfLoop));
            }
            Direction::Forward
        }
    };

    let hash = format!("{:x}", Sha256::digest(line.as_bytes()));

    Ok(Event {
        line,
        hash,
        timestamp,
        hostname,
        log_statement,
        direction,
        r#in: in_val.filter(|s| !s.is_empty()),
        out: out_val.filter(|s| !s.is_empty()),
        src_mac,
        dst_mac,
        src,
        dst,
        spt,
        dpt,
        proto,
        l3_len,
        tos,
        prec,
        ttl,
        id,
        l4_len,
        window,
        res,
        flags,
    })
}
