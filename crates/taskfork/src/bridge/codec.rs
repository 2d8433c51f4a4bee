//! Binary frame codecs for the control socket.
//!
//! Big-endian `i32` id, then a direction-specific body. Works with
//! `FramedRead`/`FramedWrite` on the worker and with the blocking adapter in
//! [`super::blocking`] on the controller, so both sides share one framing.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Command, END_OF_SUBMISSIONS, Reply, RequestId, SHUTDOWN_QUERY};

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024 * 1024;

const ID_LEN: usize = 4;
const LEN_LEN: usize = 4;
const FLAG_LEN: usize = 1;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn peek_i32(src: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

fn payload_len(raw: i32) -> io::Result<usize> {
    let len = usize::try_from(raw).map_err(|_| invalid(format!("negative payload length {raw}")))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(invalid(format!(
            "payload length {len} exceeds limit of {MAX_PAYLOAD_LEN} bytes"
        )));
    }
    Ok(len)
}

fn check_outgoing(payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds frame limit", payload.len()),
        ));
    }
    Ok(())
}

fn put_payload(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(LEN_LEN + payload.len());
    // Callers run check_outgoing first, so the length fits in an i32.
    dst.put_i32(payload.len() as i32);
    dst.put_slice(payload);
}

/// Splits a length-prefixed payload starting at `header` bytes into `src`.
/// Returns `None` (after reserving space) until the whole frame is buffered.
fn take_payload(src: &mut BytesMut, header: usize) -> io::Result<Option<Bytes>> {
    if src.len() < header + LEN_LEN {
        return Ok(None);
    }
    let len = payload_len(peek_i32(src, header))?;
    let frame_len = header + LEN_LEN + len;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }
    src.advance(header + LEN_LEN);
    Ok(Some(src.split_to(len).freeze()))
}

/// Controller → worker frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ID_LEN {
            return Ok(None);
        }
        match peek_i32(src, 0) {
            END_OF_SUBMISSIONS => {
                src.advance(ID_LEN);
                Ok(Some(Command::EndOfSubmissions))
            }
            SHUTDOWN_QUERY => {
                src.advance(ID_LEN);
                Ok(Some(Command::DenyShutdown))
            }
            raw => {
                let id = RequestId::new(raw)
                    .ok_or_else(|| invalid(format!("unknown control signal {raw}")))?;
                Ok(take_payload(src, ID_LEN)?.map(|payload| Command::Run { id, payload }))
            }
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Command::Run { id, payload } => {
                check_outgoing(&payload)?;
                dst.reserve(ID_LEN);
                dst.put_i32(id.get());
                put_payload(&payload, dst);
                tracing::trace!(%id, payload_bytes = payload.len(), "Encoding submission");
            }
            Command::EndOfSubmissions => dst.put_i32(END_OF_SUBMISSIONS),
            Command::DenyShutdown => dst.put_i32(SHUTDOWN_QUERY),
        }
        Ok(())
    }
}

/// Worker → controller frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ID_LEN {
            return Ok(None);
        }
        let raw = match peek_i32(src, 0) {
            END_OF_SUBMISSIONS => {
                src.advance(ID_LEN);
                return Ok(Some(Reply::ShutdownAck));
            }
            SHUTDOWN_QUERY => {
                src.advance(ID_LEN);
                return Ok(Some(Reply::ShutdownQuery));
            }
            raw => raw,
        };
        let id =
            RequestId::new(raw).ok_or_else(|| invalid(format!("unknown control signal {raw}")))?;
        if src.len() < ID_LEN + FLAG_LEN {
            return Ok(None);
        }
        // Any non-zero flag means success.
        if src[ID_LEN] == 0 {
            src.advance(ID_LEN + FLAG_LEN);
            return Ok(Some(Reply::Failure { id }));
        }
        Ok(take_payload(src, ID_LEN + FLAG_LEN)?.map(|payload| Reply::Success { id, payload }))
    }
}

impl Encoder<Reply> for ReplyCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Reply::Success { id, payload } => {
                check_outgoing(&payload)?;
                dst.reserve(ID_LEN + FLAG_LEN);
                dst.put_i32(id.get());
                dst.put_u8(1);
                put_payload(&payload, dst);
            }
            Reply::Failure { id } => {
                dst.reserve(ID_LEN + FLAG_LEN);
                dst.put_i32(id.get());
                dst.put_u8(0);
            }
            Reply::ShutdownAck => dst.put_i32(END_OF_SUBMISSIONS),
            Reply::ShutdownQuery => dst.put_i32(SHUTDOWN_QUERY),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(buf: &[u8]) -> String {
        buf.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn id(raw: i32) -> RequestId {
        RequestId::new(raw).unwrap()
    }

    #[test]
    fn run_frame_layout() {
        let mut buf = BytesMut::new();
        CommandCodec
            .encode(
                Command::Run {
                    id: id(7),
                    payload: Bytes::from_static(&[0x0a, 0x0b]),
                },
                &mut buf,
            )
            .unwrap();
        insta::assert_snapshot!(hex(&buf), @"00000007000000020a0b");
    }

    #[test]
    fn control_frames_have_no_body() {
        let mut buf = BytesMut::new();
        CommandCodec.encode(Command::EndOfSubmissions, &mut buf).unwrap();
        CommandCodec.encode(Command::DenyShutdown, &mut buf).unwrap();
        ReplyCodec.encode(Reply::ShutdownAck, &mut buf).unwrap();
        ReplyCodec.encode(Reply::ShutdownQuery, &mut buf).unwrap();
        insta::assert_snapshot!(hex(&buf), @"fffffffffffffffefffffffffffffffe");
    }

    #[test]
    fn success_and_failure_layout() {
        let mut buf = BytesMut::new();
        ReplyCodec
            .encode(
                Reply::Success {
                    id: id(3),
                    payload: Bytes::from_static(b"hi"),
                },
                &mut buf,
            )
            .unwrap();
        ReplyCodec.encode(Reply::Failure { id: id(5) }, &mut buf).unwrap();
        insta::assert_snapshot!(hex(&buf), @"00000003010000000268690000000500");
    }

    #[test]
    fn partial_run_frame_waits_for_payload() {
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0, 0, 0, 3, b'a'][..]);
        assert!(CommandCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9, "incomplete frame must not be consumed");

        buf.extend_from_slice(b"bc");
        let frame = CommandCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Command::Run {
                id: id(1),
                payload: Bytes::from_static(b"abc"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        ReplyCodec.encode(Reply::Failure { id: id(2) }, &mut buf).unwrap();
        ReplyCodec
            .encode(
                Reply::Success {
                    id: id(1),
                    payload: Bytes::new(),
                },
                &mut buf,
            )
            .unwrap();
        ReplyCodec.encode(Reply::ShutdownAck, &mut buf).unwrap();

        assert_eq!(
            ReplyCodec.decode(&mut buf).unwrap(),
            Some(Reply::Failure { id: id(2) })
        );
        assert_eq!(
            ReplyCodec.decode(&mut buf).unwrap(),
            Some(Reply::Success {
                id: id(1),
                payload: Bytes::new(),
            })
        );
        assert_eq!(ReplyCodec.decode(&mut buf).unwrap(), Some(Reply::ShutdownAck));
        assert_eq!(ReplyCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn reply_waits_for_success_flag() {
        let mut buf = BytesMut::from(&[0, 0, 0, 9][..]);
        assert!(ReplyCodec.decode(&mut buf).unwrap().is_none());
        buf.put_u8(0);
        assert_eq!(
            ReplyCodec.decode(&mut buf).unwrap(),
            Some(Reply::Failure { id: id(9) })
        );
    }

    #[test]
    fn negative_length_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(-5);
        let err = CommandCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_control_signal_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_i32(-3);
        assert_eq!(
            CommandCodec.decode(&mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
        let mut buf = BytesMut::new();
        buf.put_i32(-42);
        assert_eq!(
            ReplyCodec.decode(&mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_u8(1);
        buf.put_i32(i32::MAX);
        assert_eq!(
            ReplyCodec.decode(&mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
