//! Response head reader used in front of the body readers.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::Framing;

/// Upper bound on a status line plus header section.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on header count.
pub const MAX_HEADERS: usize = 100;

/// Parsed status line and header section of an HTTP/1.x response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1.
    pub version: u8,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    /// Read exactly the head from `reader`, leaving the body bytes buffered.
    pub async fn read<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut head = Vec::with_capacity(1024);
        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response head was complete",
                ));
            }

            let before = head.len();
            let take = available.len().min(MAX_HEAD_BYTES - before);
            head.extend_from_slice(&available[..take]);

            match Self::parse(&head)? {
                Some((len, parsed)) => {
                    reader.consume(len - before);
                    return Ok(parsed);
                }
                None if head.len() >= MAX_HEAD_BYTES => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "response head exceeds size limit",
                    ));
                }
                None => reader.consume(take),
            }
        }
    }

    /// Parse a complete head from `buf`; `None` while incomplete.
    pub fn parse(buf: &[u8]) -> io::Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };

        let status = response
            .code
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing status code"))?;
        let head = ResponseHead {
            status,
            version: response.version.unwrap_or(1),
            reason: response.reason.unwrap_or_default().to_string(),
            headers: response
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        };
        Ok(Some((len, head)))
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    fn header_tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Body framing for this response to a request with `method`.
    pub fn framing(&self, method: &str) -> io::Result<Framing> {
        if method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(Framing::ContentLength(0));
        }

        if let Some(last) = self.header_tokens("transfer-encoding").last() {
            return Ok(if last.eq_ignore_ascii_case("chunked") {
                Framing::Chunked
            } else {
                Framing::CloseDelimited
            });
        }

        let mut length = None;
        for value in self.header_tokens("content-length") {
            let parsed: u64 = value.parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length")
            })?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "conflicting Content-Length values",
                    ))
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length.map_or(Framing::CloseDelimited, Framing::ContentLength))
    }

    /// Whether the server allows reusing the connection after this response.
    pub fn keep_alive(&self) -> bool {
        let mut close = false;
        let mut keep_alive = false;
        for token in self.header_tokens("connection") {
            close |= token.eq_ignore_ascii_case("close");
            keep_alive |= token.eq_ignore_ascii_case("keep-alive");
        }
        if close {
            return false;
        }
        self.version >= 1 || keep_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    fn head(raw: &str) -> ResponseHead {
        ResponseHead::parse(raw.as_bytes()).unwrap().unwrap().1
    }

    #[tokio::test]
    async fn read_stops_at_end_of_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody".to_vec();
        // A tiny buffer forces several fill rounds.
        let mut reader = BufReader::with_capacity(5, &raw[..]);

        let parsed = ResponseHead::read(&mut reader).await.unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.reason, "OK");
        assert_eq!(parsed.header("content-length"), Some("4"));

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "body");
    }

    #[tokio::test]
    async fn truncated_head_is_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Len";
        let mut reader = BufReader::new(&raw[..]);
        let err = ResponseHead::read(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        let mut reader = BufReader::new(&raw[..]);
        let err = ResponseHead::read(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn framing_rules() {
        let chunked = head("HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 9\r\n\r\n");
        assert_eq!(chunked.framing("GET").unwrap(), Framing::Chunked);

        let length = head("HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n");
        assert_eq!(length.framing("GET").unwrap(), Framing::ContentLength(42));
        assert_eq!(length.framing("HEAD").unwrap(), Framing::ContentLength(0));

        let no_content = head("HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(no_content.framing("GET").unwrap(), Framing::ContentLength(0));

        let until_close = head("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(until_close.framing("GET").unwrap(), Framing::CloseDelimited);

        let conflicting = head("HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n");
        assert!(conflicting.framing("GET").is_err());

        let bogus = head("HTTP/1.1 200 OK\r\nContent-Length: ten\r\n\r\n");
        assert!(bogus.framing("GET").is_err());
    }

    #[test]
    fn keep_alive_rules() {
        assert!(head("HTTP/1.1 200 OK\r\n\r\n").keep_alive());
        assert!(!head("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!head("HTTP/1.0 200 OK\r\n\r\n").keep_alive());
        assert!(head("HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\n\r\n").keep_alive());
    }
}
