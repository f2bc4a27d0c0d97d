//! `Transfer-Encoding: chunked` in both directions.

use crate::{
    http::types::hex_to_usize,
    server::transport::{Connection, Line},
};
use std::io;

/// Failures while decoding a chunked body.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ChunkError {
    #[error("chunk of {got} bytes exceeds {limit}")]
    TooLarge { limit: usize, got: usize },
    #[error("body of {0} bytes exceeds the limit")]
    BodyTooLarge(usize),
    #[error("malformed chunk framing")]
    Malformed,
    /// Peer closed between or inside chunks.
    #[error("connection closed inside chunked body")]
    Eof,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for ChunkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ChunkError::Eof,
            _ => ChunkError::Io(err),
        }
    }
}

/// Caps applied while decoding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkLimits {
    pub(crate) max_chunk: usize,
    pub(crate) max_total: usize,
    pub(crate) line_size: usize,
}

/// Decodes a chunked body from `conn` into `out`, consuming the trailer.
pub(crate) fn read_chunked(
    conn: &mut Connection,
    limits: ChunkLimits,
    out: &mut Vec<u8>,
) -> Result<(), ChunkError> {
    loop {
        let line = match conn.read_line(limits.line_size)? {
            Line::Complete(line) => line,
            Line::TooLong => return Err(ChunkError::Malformed),
            Line::Eof => return Err(ChunkError::Eof),
        };

        // "1a;name=value"
        let size_field = match memchr::memchr(b';', &line) {
            Some(i) => &line[..i],
            None => &line[..],
        };
        let size = hex_to_usize(size_field.trim_ascii()).ok_or(ChunkError::Malformed)?;

        if size == 0 {
            loop {
                match conn.read_line(limits.line_size)? {
                    Line::Complete(trailer) if trailer.is_empty() => return Ok(()),
                    Line::Complete(_) => continue,
                    Line::TooLong => return Err(ChunkError::Malformed),
                    Line::Eof => return Ok(()),
                }
            }
        }

        if size > limits.max_chunk {
            return Err(ChunkError::TooLarge {
                limit: limits.max_chunk,
                got: size,
            });
        }
        let total = out.len().saturating_add(size);
        if total > limits.max_total {
            return Err(ChunkError::BodyTooLarge(total));
        }

        conn.read_exact_into(size, out)?;

        match conn.read_line(limits.line_size)? {
            Line::Complete(rest) if rest.is_empty() => {}
            Line::Eof => return Err(ChunkError::Eof),
            _ => return Err(ChunkError::Malformed),
        }
    }
}

/// Frames `body` as chunks of at most `chunk_size` bytes followed by the
/// terminating zero chunk. A `chunk_size` of `0` sends one chunk.
///
/// ```
/// assert_eq!(
///     pool_httpd::chunked::encode(b"hello world", 5),
///     b"5\r\nhello\r\n5\r\n worl\r\n1\r\nd\r\n0\r\n\r\n"
/// );
/// ```
pub fn encode(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let step = match chunk_size {
        0 => body.len().max(1),
        n => n,
    };
    let mut out = Vec::with_capacity(body.len() + (body.len() / step + 1) * 12 + 5);
    for chunk in body.chunks(step) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;
    use std::io::Write;

    const LIMITS: ChunkLimits = ChunkLimits {
        max_chunk: 16,
        max_total: 40,
        line_size: 64,
    };

    fn decode(wire: &[u8]) -> Result<Vec<u8>, ChunkError> {
        let (mut conn, mut peer) = socket_pair();
        peer.write_all(wire).unwrap();
        drop(peer);

        let mut out = Vec::new();
        read_chunked(&mut conn, LIMITS, &mut out).map(|()| out)
    }

    #[test]
    fn decodes() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[u8]); 4] = [
            (b"5\r\nhello\r\n0\r\n\r\n",                         b"hello"),
            (b"3;ext=1\r\nabc\r\nA\r\n0123456789\r\n0\r\n\r\n", b"abc0123456789"),
            (b"0\r\nX-Trailer: yes\r\n\r\n",                     b""),
            (b"2\r\nok\r\n0\r\n",                                b"ok"),
        ];

        for (wire, body) in cases {
            assert_eq!(decode(wire).unwrap(), body, "{:?}", String::from_utf8_lossy(wire));
        }
    }

    #[test]
    fn rejects() {
        assert!(matches!(
            decode(b"11\r\n").unwrap_err(),
            ChunkError::TooLarge { limit: 16, got: 17 }
        ));
        assert!(matches!(
            decode(b"10\r\n0123456789abcdef\r\n10\r\n0123456789abcdef\r\n10\r\n").unwrap_err(),
            ChunkError::BodyTooLarge(48)
        ));
        assert!(matches!(decode(b"zz\r\n").unwrap_err(), ChunkError::Malformed));
        assert!(matches!(decode(b"3\r\nabcX\r\n").unwrap_err(), ChunkError::Malformed));
        assert!(matches!(decode(b"5\r\nhel").unwrap_err(), ChunkError::Eof));
        assert!(matches!(decode(b"").unwrap_err(), ChunkError::Eof));
    }

    #[test]
    fn encode_then_decode_large_body() {
        let body: Vec<u8> = (0..=255u8).cycle().take(37).collect();
        let wire = encode(&body, 7);
        assert_eq!(decode(&wire).unwrap(), body);
        assert_eq!(encode(b"", 4), b"0\r\n\r\n");
        assert_eq!(encode(b"abc", 0), b"3\r\nabc\r\n0\r\n\r\n");
    }
}
