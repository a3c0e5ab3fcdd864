//! HTTP proxy request state machine.
//!
//! `CONNECT host:port` becomes a transparent pipe. Any other method must carry
//! an absolute URL; the request is rewritten to origin form and replayed
//! upstream as the first payload of the tunnel.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proxy::{Handshake, Negotiated, Progress};
use crate::vless::Destination;

/// Reply sent to a CONNECT request before the tunnel is opened.
pub const CONNECT_REPLY: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Largest request head buffered while looking for the blank line.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpState {
    AwaitHeaders,
    Dispatched,
}

/// HTTP proxy request parser.
#[derive(Debug)]
pub struct HttpHandshake {
    state: HttpState,
    buf: BytesMut,
}

impl Default for HttpHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHandshake {
    pub fn new() -> Self {
        Self {
            state: HttpState::AwaitHeaders,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn state(&self) -> HttpState {
        self.state
    }

    fn dispatch(&mut self, head_end: usize) -> Result<Progress> {
        let head = self.buf.split_to(head_end);
        let body = self.buf.split().freeze();
        // Head without the trailing blank line.
        let head = &head[..head_end - HEAD_DELIMITER.len()];

        let mut lines = head.split(|b| *b == b'\n').map(trim_cr);
        let request_line = lines.next().unwrap_or_default();
        let request_line = std::str::from_utf8(request_line)
            .map_err(|_| Error::malformed("request line is not UTF-8"))?;

        let mut tokens = request_line.split(' ').filter(|t| !t.is_empty());
        let (method, target) = match (tokens.next(), tokens.next()) {
            (Some(method), Some(target)) => (method, target),
            _ => {
                return Err(Error::malformed(format!(
                    "bad request line: {:?}",
                    request_line
                )))
            }
        };

        let mut progress = Progress::default();
        self.state = HttpState::Dispatched;

        if method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = split_host_port(target, 443)?;
            progress.replies.push(Bytes::from_static(CONNECT_REPLY));
            progress.negotiated = Some(Negotiated {
                destination: Destination::new(host, port),
                initial_data: body,
            });
            return Ok(progress);
        }

        let url = AbsoluteUrl::parse(target)?;
        let mut request = BytesMut::with_capacity(head.len() + body.len());
        request.extend_from_slice(method.as_bytes());
        request.extend_from_slice(b" ");
        request.extend_from_slice(url.path.as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\n");

        for line in lines {
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let Some((name, _)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("proxy-connection") {
                continue;
            }
            request.extend_from_slice(line.as_bytes());
            request.extend_from_slice(b"\r\n");
        }
        request.extend_from_slice(b"\r\n");
        request.extend_from_slice(&body);

        progress.negotiated = Some(Negotiated {
            destination: Destination::new(url.host, url.port),
            initial_data: request.freeze(),
        });
        Ok(progress)
    }
}

impl Handshake for HttpHandshake {
    fn feed(&mut self, data: &[u8]) -> Result<Progress> {
        if self.state == HttpState::Dispatched {
            return Err(Error::malformed("HTTP request already dispatched"));
        }
        self.buf.extend_from_slice(data);

        match find_head_end(&self.buf) {
            Some(end) => self.dispatch(end),
            None if self.buf.len() > MAX_HEAD_BYTES => {
                Err(Error::malformed("HTTP request head too large"))
            }
            None => Ok(Progress::default()),
        }
    }
}

/// Offset just past the first `\r\n\r\n`.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_DELIMITER.len())
        .position(|w| w == HEAD_DELIMITER)
        .map(|i| i + HEAD_DELIMITER.len())
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Split `host[:port]` or `[v6]:port`, applying `default_port` when absent.
fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let bad_port = || Error::malformed(format!("bad port in {:?}", authority));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::malformed(format!("unterminated IPv6 host: {:?}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad_port())?,
            None if tail.is_empty() => default_port,
            None => return Err(bad_port()),
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 literal has several colons and no port.
    if authority.matches(':').count() > 1 {
        return Ok((authority.to_string(), default_port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().map_err(|_| bad_port())?),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(Error::malformed("empty host"));
    }
    Ok((host.to_string(), port))
}

/// The parts of an absolute-form request target needed for forwarding.
#[derive(Debug, PartialEq, Eq)]
struct AbsoluteUrl {
    host: String,
    port: u16,
    /// Origin-form target: path plus query, verbatim
    path: String,
}

impl AbsoluteUrl {
    fn parse(target: &str) -> Result<Self> {
        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| Error::malformed(format!("target is not an absolute URL: {:?}", target)))?;
        let default_port = if scheme.eq_ignore_ascii_case("https") {
            443
        } else if scheme.eq_ignore_ascii_case("http") {
            80
        } else {
            return Err(Error::malformed(format!("unsupported scheme: {:?}", scheme)));
        };

        let split = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(split);
        // Drop userinfo.
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        let (host, port) = split_host_port(authority, default_port)?;

        let tail = tail.split('#').next().unwrap_or_default();
        let path = if tail.starts_with('/') {
            tail.to_string()
        } else {
            format!("/{}", tail)
        };

        Ok(Self { host, port, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate(input: &[u8]) -> (Progress, HttpHandshake) {
        let mut hs = HttpHandshake::new();
        let progress = hs.feed(input).unwrap();
        (progress, hs)
    }

    #[test]
    fn test_connect() {
        let (progress, hs) = negotiate(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        assert_eq!(hs.state(), HttpState::Dispatched);
        assert_eq!(progress.replies, vec![Bytes::from_static(CONNECT_REPLY)]);

        let negotiated = progress.negotiated.unwrap();
        assert_eq!(negotiated.destination, Destination::new("example.com", 443));
        assert!(negotiated.initial_data.is_empty());
    }

    #[test]
    fn test_connect_default_port_and_early_bytes() {
        let (progress, _) = negotiate(b"CONNECT example.com HTTP/1.1\r\nHost: x\r\n\r\n\x16\x03\x01");
        let negotiated = progress.negotiated.unwrap();
        assert_eq!(negotiated.destination.port, 443);
        assert_eq!(&negotiated.initial_data[..], b"\x16\x03\x01");
    }

    #[test]
    fn test_connect_ipv6() {
        let (progress, _) = negotiate(b"CONNECT [2001:db8::1]:8443 HTTP/1.1\r\n\r\n");
        let negotiated = progress.negotiated.unwrap();
        assert_eq!(negotiated.destination, Destination::new("2001:db8::1", 8443));
    }

    #[test]
    fn test_plain_get_rewrite() {
        let (progress, _) = negotiate(
            b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        );
        assert!(progress.replies.is_empty());

        let negotiated = progress.negotiated.unwrap();
        assert_eq!(negotiated.destination, Destination::new("example.com", 80));

        let request = std::str::from_utf8(&negotiated.initial_data).unwrap();
        assert!(request.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com\r\n"));
        assert!(!request.to_ascii_lowercase().contains("proxy-connection"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_plain_post_keeps_body() {
        let (progress, _) = negotiate(
            b"POST https://api.example.com:8443 HTTP/1.0\r\nContent-Length: 4\r\nbroken line\r\n\r\nabcd",
        );
        let negotiated = progress.negotiated.unwrap();
        assert_eq!(negotiated.destination, Destination::new("api.example.com", 8443));
        assert_eq!(
            &negotiated.initial_data[..],
            b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd"
        );
    }

    #[test]
    fn test_query_passes_through_verbatim() {
        let url = AbsoluteUrl::parse("http://user@host:81?q=%2F&x=a%20b#frag").unwrap();
        assert_eq!(url.host, "host");
        assert_eq!(url.port, 81);
        assert_eq!(url.path, "/?q=%2F&x=a%20b");
    }

    #[test]
    fn test_headers_split_across_reads() {
        let mut hs = HttpHandshake::new();
        let progress = hs.feed(b"CONNECT example.com:443 HTTP/1.1\r\n").unwrap();
        assert!(progress.negotiated.is_none());
        let progress = hs.feed(b"\r").unwrap();
        assert!(progress.negotiated.is_none());
        let progress = hs.feed(b"\n").unwrap();
        assert!(progress.negotiated.is_some());
    }

    #[test]
    fn test_malformed_request_line() {
        let mut hs = HttpHandshake::new();
        assert!(matches!(
            hs.feed(b"GARBAGE\r\n\r\n"),
            Err(Error::MalformedRequest(_))
        ));

        let mut hs = HttpHandshake::new();
        assert!(matches!(
            hs.feed(b"GET /relative HTTP/1.1\r\n\r\n"),
            Err(Error::MalformedRequest(_))
        ));

        let mut hs = HttpHandshake::new();
        assert!(hs.feed(b"CONNECT host:notaport HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_head_too_large() {
        let mut hs = HttpHandshake::new();
        let filler = vec![b'A'; MAX_HEAD_BYTES + 1];
        assert!(matches!(hs.feed(&filler), Err(Error::MalformedRequest(_))));
    }
}
