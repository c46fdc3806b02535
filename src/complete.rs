//! Stock completion predicates.
//!
//! A completion predicate looks at the bytes accumulated so far and returns
//! the length of the complete message at their start, or 0 when more bytes
//! are needed. Protocol layers above this crate normally supply their own
//! (e.g. a BER length decoder); these cover HTTP and raw streams.

/// Every non-empty read is a message.
pub fn raw(buf: &[u8]) -> usize {
    buf.len()
}

/// An HTTP header block, up to and including the blank line.
pub fn http_head(buf: &[u8]) -> usize {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map_or(0, |pos| pos + 4)
}

/// A full HTTP/1.x message: header block plus a body delimited by
/// `Content-Length` or chunked transfer coding. A message with neither has no
/// body.
pub fn http(buf: &[u8]) -> usize {
    let head = http_head(buf);
    if head == 0 {
        return 0;
    }

    let mut content_length = None;
    let mut chunked = false;
    for line in buf[..head].split(|&b| b == b'\n').skip(1) {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
    }

    if chunked {
        return chunked_end(buf, head);
    }
    // A length past `usize::MAX` never completes; `max_message_bytes` ends
    // the read instead.
    match content_length.map(|len| head.checked_add(len)) {
        Some(Some(end)) if buf.len() >= end => end,
        Some(_) => 0,
        None => head,
    }
}

// End of a chunked body starting at `pos`, or 0 if it is not all here yet.
fn chunked_end(buf: &[u8], mut pos: usize) -> usize {
    loop {
        let Some(line_end) = find_crlf(buf, pos) else {
            return 0;
        };
        let size_field = &buf[pos..line_end];
        let size_text = std::str::from_utf8(size_field).unwrap_or_default();
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_text, 16) else {
            // Malformed size line; hand over what we have so the protocol
            // layer can report it.
            return line_end + 2;
        };
        pos = line_end + 2;

        if size == 0 {
            // Optional trailers, then an empty line.
            loop {
                let Some(trailer_end) = find_crlf(buf, pos) else {
                    return 0;
                };
                if trailer_end == pos {
                    return pos + 2;
                }
                pos = trailer_end + 2;
            }
        }

        pos = match size.checked_add(2).and_then(|len| pos.checked_add(len)) {
            Some(end) if end <= buf.len() => end,
            _ => return 0,
        };
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|pos| from + pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_takes_everything() {
        assert_eq!(raw(b""), 0);
        assert_eq!(raw(b"abc"), 3);
    }

    #[test]
    fn head_ends_at_blank_line() {
        assert_eq!(http_head(b"HTTP/1.1 200 OK\r\nServer: x\r\n"), 0);
        let head = b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n";
        assert_eq!(http_head(head), head.len());
        let mut with_body = head.to_vec();
        with_body.extend_from_slice(b"body");
        assert_eq!(http_head(&with_body), head.len());
    }

    #[test]
    fn content_length_body() {
        let msg = b"POST /sru HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(http(&msg[..msg.len() - 1]), 0);
        assert_eq!(http(msg), msg.len());

        let mut pipelined = msg.to_vec();
        pipelined.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(http(&pipelined), msg.len());
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let msg = b"HTTP/1.0 200 OK\r\ncontent-LENGTH:  2 \r\n\r\nok";
        assert_eq!(http(msg), msg.len());
    }

    #[test]
    fn no_length_means_no_body() {
        let msg = b"GET /index.html HTTP/1.1\r\nHost: example.org\r\n\r\n";
        assert_eq!(http(msg), msg.len());
    }

    #[test]
    fn chunked_body_with_trailers() {
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n\
                    4\r\nWiki\r\n6;ext=1\r\npedia \r\n0\r\nExpires: never\r\n\r\n";
        for cut in 0..msg.len() {
            assert_eq!(http(&msg[..cut]), 0, "complete after {cut} bytes");
        }
        assert_eq!(http(msg), msg.len());
    }

    #[test]
    fn huge_content_length_stays_incomplete() {
        let msg = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nx";
        assert_eq!(http(msg), 0);
    }

    #[test]
    fn huge_chunk_size_stays_incomplete() {
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nx";
        assert_eq!(http(msg), 0);
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffffe\r\nx";
        assert_eq!(http(msg), 0);
    }

    #[test]
    fn chunked_must_be_the_last_coding() {
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked, gzip\r\n\r\n";
        assert_eq!(http(msg), msg.len());
    }
}
