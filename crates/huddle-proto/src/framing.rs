//! Splitting transport reads into frames.
//!
//! Legacy clients write one command per socket write and never send a
//! terminator; newer clients terminate every command with `\n`. Both are
//! handled by [`FrameSplitter::push_read`]:
//!
//! - every `\n`-terminated segment is a frame (`\r\n` is accepted too)
//! - an unterminated tail is a frame when the read did not fill the caller's
//!   buffer, because a short read means the peer stopped writing
//! - when the read did fill the buffer, the tail is held back until more bytes
//!   arrive, up to `max_frame_len`
//!
//! Empty segments are dropped.

use bytes::{Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Stateful splitter for one connection's inbound byte stream.
#[derive(Debug)]
pub struct FrameSplitter {
    pending: BytesMut,
    max_frame_len: usize,
}

impl FrameSplitter {
    /// Create a splitter that rejects frames longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { pending: BytesMut::new(), max_frame_len }
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one transport read and append the frames it completes to
    /// `frames`.
    ///
    /// `buffer_filled` must be true when the read filled the caller's buffer
    /// completely, meaning more bytes of the same frame may follow.
    ///
    /// # Errors
    ///
    /// `ProtocolError::FrameTooLarge` if a frame exceeds `max_frame_len`. The
    /// connection should be dropped; the splitter is left empty. Frames that
    /// precede the oversized one in the same read are still in `frames`.
    pub fn push_read(
        &mut self,
        chunk: &[u8],
        buffer_filled: bool,
        frames: &mut Vec<Bytes>,
    ) -> Result<()> {
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut segment = self.pending.split_to(pos + 1);
            segment.truncate(pos);
            if segment.last() == Some(&b'\r') {
                segment.truncate(pos - 1);
            }
            self.accept(segment, frames)?;
        }

        if !self.pending.is_empty() {
            if buffer_filled {
                if self.pending.len() > self.max_frame_len {
                    let size = self.pending.len();
                    self.pending.clear();
                    return Err(ProtocolError::FrameTooLarge { size, max: self.max_frame_len });
                }
            } else {
                let tail = self.pending.split();
                self.accept(tail, frames)?;
            }
        }

        Ok(())
    }

    fn accept(&mut self, segment: BytesMut, frames: &mut Vec<Bytes>) -> Result<()> {
        if segment.is_empty() {
            return Ok(());
        }

        if segment.len() > self.max_frame_len {
            self.pending.clear();
            return Err(ProtocolError::FrameTooLarge {
                size: segment.len(),
                max: self.max_frame_len,
            });
        }

        frames.push(segment.freeze());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Push one read and return the frames as text.
    fn push(splitter: &mut FrameSplitter, chunk: &[u8], filled: bool) -> Vec<String> {
        let mut frames = Vec::new();
        splitter.push_read(chunk, filled, &mut frames).unwrap();
        frames.iter().map(|f| String::from_utf8(f.to_vec()).unwrap()).collect()
    }

    #[test]
    fn unterminated_short_read_is_one_frame() {
        let mut splitter = FrameSplitter::new(1024);
        assert_eq!(push(&mut splitter, b"CONNECT alice", false), vec!["CONNECT alice"]);
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn coalesced_commands_are_split() {
        let mut splitter = FrameSplitter::new(1024);
        let frames = push(&mut splitter, b"CONNECT alice\r\nMSG hi\nDISCONNECT\n", false);
        assert_eq!(frames, vec!["CONNECT alice", "MSG hi", "DISCONNECT"]);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let mut splitter = FrameSplitter::new(1024);
        assert_eq!(push(&mut splitter, b"\n\r\nMSG a\n\n", false), vec!["MSG a"]);
    }

    #[test]
    fn full_read_holds_tail_until_terminator() {
        let mut splitter = FrameSplitter::new(1024);

        assert_eq!(push(&mut splitter, b"MSG first\nMSG sec", true), vec!["MSG first"]);
        assert_eq!(splitter.pending_len(), "MSG sec".len());

        assert_eq!(push(&mut splitter, b"ond\n", false), vec!["MSG second"]);
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn held_tail_over_limit_is_rejected() {
        let mut splitter = FrameSplitter::new(8);
        let mut frames = Vec::new();
        let err = splitter.push_read(b"MSG 0123456789", true, &mut frames).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge { size: 14, max: 8 });
        assert!(frames.is_empty());
        assert_eq!(splitter.pending_len(), 0);
    }

    #[test]
    fn terminated_frame_over_limit_is_rejected() {
        let mut splitter = FrameSplitter::new(8);
        let mut frames = Vec::new();
        let err = splitter.push_read(b"MSG 0123456789\n", false, &mut frames).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 14, max: 8 }));
    }

    #[test]
    fn frames_before_an_oversized_one_are_kept() {
        let mut splitter = FrameSplitter::new(8);
        let mut frames = Vec::new();

        let err = splitter.push_read(b"MSG hi\nMSG 0123456789\nMSG lost\n", false, &mut frames);
        assert!(matches!(err, Err(ProtocolError::FrameTooLarge { size: 14, max: 8 })));
        assert_eq!(frames, vec![Bytes::from_static(b"MSG hi")]);
        assert_eq!(splitter.pending_len(), 0);
    }
}
