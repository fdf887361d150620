//! Pure wire codec for SOCKS4/4A, SOCKS5, and HTTP/1.1 CONNECT.
//!
//! Encoding and decoding only — no I/O, no state beyond the incremental
//! HTTP response parser. All multi-byte integers are big-endian.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::net::Ipv4Addr;

pub const SOCKS4_VERSION: u8 = 4;
/// Reply packets carry VN = 0, not 4.
pub const SOCKS4_REPLY_VERSION: u8 = 0;
pub const SOCKS4_GRANTED: u8 = 90;
pub const SOCKS4_REJECTED: u8 = 91;
pub const SOCKS4_NO_IDENTD: u8 = 92;
pub const SOCKS4_IDENTD_MISMATCH: u8 = 93;

pub const SOCKS5_VERSION: u8 = 5;
pub const SOCKS5_METHOD_NO_AUTH: u8 = 0;
pub const SOCKS5_METHOD_USERPASS: u8 = 2;
pub const SOCKS5_NO_ACCEPTABLE_METHOD: u8 = 0xFF;
pub const SOCKS5_SUCCEEDED: u8 = 0;
pub const SOCKS5_ATYP_IPV4: u8 = 1;
pub const SOCKS5_ATYP_NAME: u8 = 3;
/// Username/password sub-negotiation version (RFC 1929).
pub const SOCKS5_USERPASS_VERSION: u8 = 1;

/// SOCKS4A sentinel: a DSTIP of 0.0.0.1 tells the proxy a hostname
/// follows after the user-id field.
pub const SOCKS4A_SENTINEL: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

/// Command field shared by SOCKS4 and SOCKS5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect = 1,
    Bind = 2,
}

impl SocksCommand {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(SocksCommand::Connect),
            2 => Some(SocksCommand::Bind),
            _ => None,
        }
    }
}

// ─── SOCKS4 / SOCKS4A ────────────────────────────────────────────────

/// `VN CD DSTPORT DSTIP USERID\0`.
pub fn socks4_request(cmd: SocksCommand, ip: Ipv4Addr, port: u16, userid: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + userid.len());
    buf.push(SOCKS4_VERSION);
    buf.push(cmd as u8);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&ip.octets());
    buf.extend_from_slice(userid.as_bytes());
    buf.push(0);
    buf
}

/// SOCKS4A variant: sentinel DSTIP plus `HOSTNAME\0` after the user-id.
pub fn socks4a_request(cmd: SocksCommand, hostname: &str, port: u16, userid: &str) -> Vec<u8> {
    let mut buf = socks4_request(cmd, SOCKS4A_SENTINEL, port, userid);
    buf.extend_from_slice(hostname.as_bytes());
    buf.push(0);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub cmd: SocksCommand,
    pub port: u16,
    pub ip: Ipv4Addr,
    pub userid: String,
    /// Present only for SOCKS4A requests (sentinel DSTIP).
    pub hostname: Option<String>,
}

/// Decodes a complete SOCKS4/4A request. `None` if malformed.
pub fn parse_socks4_request(buf: &[u8]) -> Option<Socks4Request> {
    if buf.len() < 9 || buf[0] != SOCKS4_VERSION {
        return None;
    }
    let cmd = SocksCommand::from_byte(buf[1])?;
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    let rest = &buf[8..];
    let nul = rest.iter().position(|&b| b == 0)?;
    let userid = String::from_utf8(rest[..nul].to_vec()).ok()?;
    let hostname = if ip == SOCKS4A_SENTINEL {
        let rest = &rest[nul + 1..];
        let nul = rest.iter().position(|&b| b == 0)?;
        Some(String::from_utf8(rest[..nul].to_vec()).ok()?)
    } else {
        None
    };
    Some(Socks4Request {
        cmd,
        port,
        ip,
        userid,
        hostname,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks4Reply {
    pub status: u8,
    pub port: u16,
    pub ip: Ipv4Addr,
}

/// SOCKS4 replies are exactly 8 bytes.
pub const SOCKS4_REPLY_LEN: usize = 8;

pub fn socks4_reply(status: u8, ip: Ipv4Addr, port: u16) -> [u8; SOCKS4_REPLY_LEN] {
    let p = port.to_be_bytes();
    let o = ip.octets();
    [SOCKS4_REPLY_VERSION, status, p[0], p[1], o[0], o[1], o[2], o[3]]
}

/// Decodes the 8-byte reply. `None` if the version byte is wrong.
pub fn parse_socks4_reply(buf: &[u8]) -> Option<Socks4Reply> {
    if buf.len() != SOCKS4_REPLY_LEN || buf[0] != SOCKS4_REPLY_VERSION {
        return None;
    }
    Some(Socks4Reply {
        status: buf[1],
        port: u16::from_be_bytes([buf[2], buf[3]]),
        ip: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
    })
}

// ─── SOCKS5 ──────────────────────────────────────────────────────────

/// Method-selection message. Username/password is offered first when
/// credentials are configured, no-auth always.
pub fn socks5_method_request(has_credentials: bool) -> Vec<u8> {
    if has_credentials {
        vec![SOCKS5_VERSION, 2, SOCKS5_METHOD_USERPASS, SOCKS5_METHOD_NO_AUTH]
    } else {
        vec![SOCKS5_VERSION, 1, SOCKS5_METHOD_NO_AUTH]
    }
}

/// Method-selection replies are exactly 2 bytes; the version byte is not
/// checked (some servers echo garbage there).
pub const SOCKS5_METHOD_REPLY_LEN: usize = 2;

pub fn parse_socks5_method_choice(buf: &[u8]) -> Option<u8> {
    if buf.len() != SOCKS5_METHOD_REPLY_LEN {
        return None;
    }
    Some(buf[1])
}

/// RFC 1929 username/password login. Both fields are truncated to the
/// 255-byte wire limit.
pub fn socks5_login_request(username: &str, password: &str) -> Vec<u8> {
    let user = &username.as_bytes()[..username.len().min(255)];
    let pass = &password.as_bytes()[..password.len().min(255)];
    let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
    buf.push(SOCKS5_USERPASS_VERSION);
    buf.push(user.len() as u8);
    buf.extend_from_slice(user);
    buf.push(pass.len() as u8);
    buf.extend_from_slice(pass);
    buf
}

/// Login replies are exactly 2 bytes; status 0 means accepted.
pub const SOCKS5_LOGIN_REPLY_LEN: usize = 2;

pub fn parse_socks5_login_status(buf: &[u8]) -> Option<u8> {
    if buf.len() != SOCKS5_LOGIN_REPLY_LEN {
        return None;
    }
    Some(buf[1])
}

/// Address carried in a SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Addr {
    Ip(Ipv4Addr),
    Name(String),
}

/// `VER CMD RSV ATYP ADDR PORT`.
pub fn socks5_request(cmd: SocksCommand, addr: &Socks5Addr, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(SOCKS5_VERSION);
    buf.push(cmd as u8);
    buf.push(0);
    match addr {
        Socks5Addr::Ip(ip) => {
            buf.push(SOCKS5_ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Socks5Addr::Name(name) => {
            let name = &name.as_bytes()[..name.len().min(255)];
            buf.push(SOCKS5_ATYP_NAME);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub cmd: SocksCommand,
    pub addr: Socks5Addr,
    pub port: u16,
}

/// Decodes a complete SOCKS5 request. `None` if malformed.
pub fn parse_socks5_request(buf: &[u8]) -> Option<Socks5Request> {
    if buf.len() < 7 || buf[0] != SOCKS5_VERSION {
        return None;
    }
    let cmd = SocksCommand::from_byte(buf[1])?;
    let (addr, rest) = match buf[3] {
        SOCKS5_ATYP_IPV4 => {
            if buf.len() < 10 {
                return None;
            }
            (Socks5Addr::Ip(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7])), &buf[8..])
        }
        SOCKS5_ATYP_NAME => {
            let len = buf[4] as usize;
            if buf.len() < 7 + len {
                return None;
            }
            let name = String::from_utf8(buf[5..5 + len].to_vec()).ok()?;
            (Socks5Addr::Name(name), &buf[5 + len..])
        }
        _ => return None,
    };
    if rest.len() != 2 {
        return None;
    }
    Some(Socks5Request {
        cmd,
        addr,
        port: u16::from_be_bytes([rest[0], rest[1]]),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks5Reply {
    pub status: u8,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Replies are accepted only in the 10-byte IPv4 form.
pub const SOCKS5_REPLY_LEN: usize = 10;

pub fn socks5_reply(status: u8, ip: Ipv4Addr, port: u16) -> [u8; SOCKS5_REPLY_LEN] {
    let o = ip.octets();
    let p = port.to_be_bytes();
    [SOCKS5_VERSION, status, 0, SOCKS5_ATYP_IPV4, o[0], o[1], o[2], o[3], p[0], p[1]]
}

/// Decodes the 10-byte reply. `None` unless VER = 5 and ATYP = IPv4.
pub fn parse_socks5_reply(buf: &[u8]) -> Option<Socks5Reply> {
    if buf.len() != SOCKS5_REPLY_LEN
        || buf[0] != SOCKS5_VERSION
        || buf[3] != SOCKS5_ATYP_IPV4
    {
        return None;
    }
    Some(Socks5Reply {
        status: buf[1],
        ip: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
        port: u16::from_be_bytes([buf[8], buf[9]]),
    })
}

// ─── HTTP/1.1 CONNECT ────────────────────────────────────────────────

/// Builds the CONNECT request. With credentials, both `Authorization`
/// and `Proxy-Authorization` carry the Basic token (some proxies read
/// one, some the other).
pub fn http_connect_request(
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> String {
    let mut req = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(user) = username {
        let token = BASE64.encode(format!("{}:{}", user, password.unwrap_or("")));
        req.push_str(&format!("Authorization: Basic {}\r\n", token));
        req.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    req.push_str("\r\n");
    req
}

/// Guard against a proxy streaming an unbounded status line at us.
const HTTP_MAX_FIRST_LINE: usize = 4096;

/// Incremental HTTP response-header parser. Fed one byte at a time so
/// the caller never reads past the header terminator into the tunnel.
#[derive(Debug, Default)]
pub struct HttpReplyParser {
    first_line: String,
    first_line_done: bool,
    /// How much of `\r\n\r\n` the trailing bytes match.
    terminator_run: u8,
}

impl HttpReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte; returns `true` once the blank line ending the
    /// headers has been consumed. Further bytes are ignored.
    pub fn push_byte(&mut self, b: u8) -> bool {
        if self.terminator_run == 4 {
            return true;
        }
        if !self.first_line_done {
            if b == b'\r' || b == b'\n' {
                self.first_line_done = true;
            } else if self.first_line.len() < HTTP_MAX_FIRST_LINE {
                self.first_line.push(b as char);
            }
        }
        let expected = [b'\r', b'\n', b'\r', b'\n'][self.terminator_run as usize];
        if b == expected {
            self.terminator_run += 1;
        } else if b == b'\r' {
            self.terminator_run = 1;
        } else {
            self.terminator_run = 0;
        }
        self.terminator_run == 4
    }

    /// The status line exactly as received (no CRLF).
    pub fn status_line(&self) -> &str {
        &self.first_line
    }

    /// Tunnelling succeeds iff this is an HTTP response with a 2xx code.
    pub fn is_success(&self) -> bool {
        if !self.first_line.starts_with("HTTP/") {
            return false;
        }
        self.first_line
            .split_whitespace()
            .nth(1)
            .is_some_and(|code| code.starts_with('2'))
    }
}
