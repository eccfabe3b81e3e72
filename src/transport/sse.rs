//! Server-sent events framing (bytes -> `data:` payloads).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{stream, StreamExt};

use crate::drivers::ProviderKind;
use crate::{BoxStream, Error, Result};

const DONE_SIGNAL: &str = "[DONE]";

/// Split an SSE byte stream into the `data` payload of each event.
///
/// Events are separated by a blank line; multi-line `data` fields are joined
/// with `\n`; `event:`, `id:` and comment lines are ignored. The stream ends
/// at EOF or at a `[DONE]` payload. A trailing event without a terminating
/// blank line is still delivered.
///
/// Bytes are buffered until a frame is complete, so a character split across
/// two reads decodes intact. A frame that is not valid UTF-8 ends the stream
/// with a provider error.
pub fn sse_data(kind: ProviderKind, input: BoxStream<'static, Bytes>) -> BoxStream<'static, String> {
    let s = stream::unfold(
        (input, BytesMut::new(), false, false),
        move |(mut input, mut buf, mut eof, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(frame) = split_frame(&mut buf) {
                    match frame_data(kind, &frame) {
                        Ok(Some(data)) if data.trim() == DONE_SIGNAL => return None,
                        Ok(Some(data)) => return Some((Ok(data), (input, buf, eof, false))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (input, buf, eof, true))),
                    }
                }
                if eof {
                    let tail = buf.split();
                    return match frame_data(kind, &tail) {
                        Ok(Some(data)) if data.trim() != DONE_SIGNAL => {
                            Some((Ok(data), (input, buf, eof, false)))
                        }
                        Ok(_) => None,
                        Err(e) => Some((Err(e), (input, buf, eof, true))),
                    };
                }
                match input.next().await {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        normalize_crlf(&mut buf);
                    }
                    Some(Err(e)) => return Some((Err(e), (input, buf, true, true))),
                    None => eof = true,
                }
            }
        },
    );
    Box::pin(s)
}

/// Take the next complete frame (without its blank-line terminator).
fn split_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    let idx = buf.windows(2).position(|w| w == b"\n\n")?;
    let frame = buf.split_to(idx);
    buf.advance(2);
    Some(frame)
}

/// Rewrite `\r\n` as `\n`. A `\r` at the very end is kept until its `\n`
/// arrives.
fn normalize_crlf(buf: &mut BytesMut) {
    if !buf.contains(&b'\r') {
        return;
    }
    let mut out = BytesMut::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\r' && buf.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.put_u8(buf[i]);
        i += 1;
    }
    *buf = out;
}

fn frame_data(kind: ProviderKind, frame: &[u8]) -> Result<Option<String>> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| Error::provider(kind, None, format!("event stream is not valid UTF-8: {}", e)))?;
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if lines.is_empty() {
        Ok(None)
    } else {
        Ok(Some(lines.join("\n")))
    }
}
