//! `Transfer-Encoding: chunked` decoder.
//!
//! A byte-at-a-time state machine over the buffered reader for the framing
//! lines, and bulk copies for chunk data:
//!
//! ```text
//! Size ──hex──▶ Size ──';' / SP / HT──▶ Extension ──CR──▶ SizeLf ──LF──▶ Data ──▶ DataCr ──▶ DataLf ──▶ Size
//!   │                                                            └─(size 0)─▶ Trailer ◀──▶ TrailerLf ──empty line──▶ Done
//!   └─CR──▶ SizeLf
//! ```

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

use crate::body::BodyBase;
use crate::error::FramingError;
use crate::pool::Lease;

/// Hex digits accepted in one chunk-size line; 16 digits cover `u64`.
pub const MAX_CHUNK_SIZE_DIGITS: usize = 16;

/// Chunk extension bytes skipped per size line.
pub const MAX_CHUNK_EXTENSION_BYTES: usize = 4 * 1024;

/// Total trailer bytes accepted after the terminal chunk.
pub const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// Marks a non-hex byte in [`HEX_VALUES`].
const NOT_HEX: u8 = 16;

static HEX_VALUES: [u8; 256] = hex_table();

const fn hex_table() -> [u8; 256] {
    let mut table = [NOT_HEX; 256];
    let mut i = 0;
    while i < 10 {
        table[b'0' as usize + i] = i as u8;
        i += 1;
    }
    let mut i = 0;
    while i < 6 {
        table[b'a' as usize + i] = 10 + i as u8;
        table[b'A' as usize + i] = 10 + i as u8;
        i += 1;
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size { value: u64, digits: usize },
    Extension { size: u64, len: usize },
    SizeLf { size: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { line: usize, total: usize },
    TrailerLf { line: usize, total: usize },
    Done,
}

impl State {
    const START: State = State::Size { value: 0, digits: 0 };

    /// Feed one framing byte.
    fn step(self, byte: u8) -> Result<State, FramingError> {
        let next = match self {
            State::Size { value, digits } => {
                let digit = HEX_VALUES[byte as usize];
                if digit != NOT_HEX {
                    if digits == MAX_CHUNK_SIZE_DIGITS {
                        return Err(FramingError::ChunkSizeTooLong);
                    }
                    let value = value
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(u64::from(digit)))
                        .ok_or(FramingError::ChunkSizeOverflow)?;
                    State::Size {
                        value,
                        digits: digits + 1,
                    }
                } else {
                    match byte {
                        b'\r' | b';' | b' ' | b'\t' if digits == 0 => {
                            return Err(FramingError::EmptyChunkSize)
                        }
                        b'\r' => State::SizeLf { size: value },
                        b';' | b' ' | b'\t' => State::Extension {
                            size: value,
                            len: 0,
                        },
                        byte => return Err(FramingError::InvalidChunkSize { byte }),
                    }
                }
            }
            State::Extension { size, len } => match byte {
                b'\r' => State::SizeLf { size },
                _ if len >= MAX_CHUNK_EXTENSION_BYTES => {
                    return Err(FramingError::ChunkSizeTooLong)
                }
                _ => State::Extension { size, len: len + 1 },
            },
            State::SizeLf { size } => match byte {
                b'\n' if size == 0 => State::Trailer { line: 0, total: 0 },
                b'\n' => State::Data { remaining: size },
                found => return Err(FramingError::MissingCrlf { found }),
            },
            State::DataCr => match byte {
                b'\r' => State::DataLf,
                found => return Err(FramingError::MissingCrlf { found }),
            },
            State::DataLf => match byte {
                b'\n' => State::START,
                found => return Err(FramingError::MissingCrlf { found }),
            },
            State::Trailer { line, total } => match byte {
                b'\r' => State::TrailerLf { line, total },
                _ if total >= MAX_TRAILER_BYTES => return Err(FramingError::TrailerTooLarge),
                _ => State::Trailer {
                    line: line + 1,
                    total: total + 1,
                },
            },
            State::TrailerLf { line, total } => match byte {
                b'\n' if line == 0 => State::Done,
                b'\n' => State::Trailer { line: 0, total },
                found => return Err(FramingError::MissingCrlf { found }),
            },
            State::Data { .. } | State::Done => self,
        };
        Ok(next)
    }

    fn wants_bytes(&self) -> bool {
        !matches!(self, State::Data { .. } | State::Done)
    }
}

/// Run framing bytes through the state machine until data or the end is reached.
///
/// Returns how many bytes of `bytes` were consumed.
fn advance(state: &mut State, bytes: &[u8]) -> Result<usize, FramingError> {
    for (i, &byte) in bytes.iter().enumerate() {
        *state = state.step(byte)?;
        if !state.wants_bytes() {
            return Ok(i + 1);
        }
    }
    Ok(bytes.len())
}

/// Decodes a chunked body, releasing the connection after the terminal chunk.
pub struct ChunkedBody {
    base: BodyBase,
    state: State,
}

impl ChunkedBody {
    pub fn new(reader: BufReader<Lease>, force_close: bool) -> Self {
        Self {
            base: BodyBase::new(reader, force_close),
            state: State::START,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.base.is_finished()
    }

    pub fn lease(&self) -> &Lease {
        self.base.lease()
    }
}

impl AsyncRead for ChunkedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(settled) = this.base.poll_settled() {
            return settled;
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.state {
                State::Done => {
                    this.base.finish();
                    return Poll::Ready(Ok(()));
                }
                State::Data { remaining } => {
                    let want = remaining.min(buf.remaining() as u64) as usize;
                    let read = match ready!(Pin::new(&mut this.base.reader).poll_fill_buf(cx)) {
                        Ok([]) => Err(FramingError::UnexpectedEof { remaining }.into()),
                        Ok(available) => {
                            let n = available.len().min(want);
                            buf.put_slice(&available[..n]);
                            Ok(n)
                        }
                        Err(e) => Err(e),
                    };
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => return Poll::Ready(Err(this.base.fail(e))),
                    };
                    Pin::new(&mut this.base.reader).consume(n);

                    let remaining = remaining - n as u64;
                    this.state = if remaining == 0 {
                        State::DataCr
                    } else {
                        State::Data { remaining }
                    };
                    return Poll::Ready(Ok(()));
                }
                _ => {
                    let scanned = match ready!(Pin::new(&mut this.base.reader).poll_fill_buf(cx)) {
                        Ok([]) => Err(FramingError::UnexpectedEof { remaining: 0 }.into()),
                        Ok(available) => advance(&mut this.state, available).map_err(io::Error::from),
                        Err(e) => Err(e),
                    };
                    match scanned {
                        Ok(n) => Pin::new(&mut this.base.reader).consume(n),
                        Err(e) => return Poll::Ready(Err(this.base.fail(e))),
                    }
                }
            }
        }
    }
}
