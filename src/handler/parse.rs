//! Pure, I/O-free parsing of request lines, headers, and `CONNECT` targets.
//! Kept separate from the socket state machine so the parsing rules can be
//! tested directly against byte slices.

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub struct RequestLine<'a> {
    pub method: &'a str,
    pub target: &'a str,
    #[allow(dead_code)]
    pub version: &'a str,
}

/// Parses the first line of a request out of `buf`. Returns the parsed line
/// and the byte offset just past its terminating CRLF.
pub fn parse_request_line(buf: &[u8]) -> Option<(RequestLine<'_>, usize)> {
    let line_end = find(buf, b"\r\n")?;
    let line = std::str::from_utf8(&buf[..line_end]).ok()?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return None;
    }
    Some((
        RequestLine {
            method,
            target,
            version,
        },
        line_end + 2,
    ))
}

/// Finds a header by case-insensitive name among the CRLF-delimited lines in
/// `buf`. Only interprets enough of the buffer to find the header; does not
/// require a complete, well-formed header block.
pub fn find_header<'a>(buf: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(buf).ok()?;
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Splits a `Host:` header value into a lowercased host and an explicit port
/// if one was given.
pub fn split_host_port(host_header: &str) -> (String, Option<u16>) {
    let host = host_header.trim();
    if host.starts_with('[') {
        // IPv6 literal; port, if present, follows "]:".
        if let Some(close) = host.find(']') {
            let (literal, rest) = host.split_at(close + 1);
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
            return (literal.to_ascii_lowercase(), port);
        }
        return (host.to_ascii_lowercase(), None);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (h.to_ascii_lowercase(), port.parse().ok())
        }
        _ => (host.to_ascii_lowercase(), None),
    }
}

/// Parses a `CONNECT` target of the form `host:port`.
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_ascii_lowercase(), port))
}

/// Extracts the status line (everything before the first CRLF) from a raw
/// upstream response, for the `UPSTREAM_STATUS` event.
pub fn status_line_of(response: &[u8]) -> String {
    match find(response, b"\r\n") {
        Some(idx) => String::from_utf8_lossy(&response[..idx]).into_owned(),
        None => String::from_utf8_lossy(response).into_owned(),
    }
}
