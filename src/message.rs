//! Control-message frames.
//!
//! External coordination (the broker and its clients) talks in fixed
//! 256-byte frames pushed whole into a pipe.  A large payload is split into
//! parts; `sender_id` and `message_id` together identify the message the
//! parts reassemble into.  The frame layout is part of the compatibility
//! surface:
//!
//! ```text
//! offset 0:  sender_id   u32
//! offset 4:  message_id  u32
//! offset 8:  part_no     u16   (< num_parts)
//! offset 10: num_parts   u16
//! offset 12: payload     [u8; 244]  (NUL-padded)
//! ```

use crate::{
    error::{BadMessagePartNumberSnafu, Result},
    os::process_id,
};

/// Total size of one frame on the wire.
pub const MESSAGE_SIZE: usize = 256;

/// Bytes of payload carried by a single frame.
pub const PAYLOAD_SIZE: usize = MESSAGE_SIZE - 2 * 4 - 2 * 2;

// POSIX guarantees PIPE_BUF is at least 512 bytes; staying below that floor
// is what makes whole-frame pipe writes atomic on every platform.
const _: () = assert!(MESSAGE_SIZE < 512);

const SENDER_ID_OFFSET: usize = 0;
const MESSAGE_ID_OFFSET: usize = 4;
const PART_NO_OFFSET: usize = 8;
const NUM_PARTS_OFFSET: usize = 10;
const PAYLOAD_OFFSET: usize = 12;

/// One frame of a (possibly multi-part) control message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MessageFrame {
    /// The sender's ID; by convention the sending process's PID.
    pub sender_id: u32,
    /// Identifies the message within the sender.
    pub message_id: u32,
    /// Which part of the message this frame carries.  Always less than
    /// `num_parts`.
    pub part_no: u16,
    /// Total number of parts making up the message.
    pub num_parts: u16,
    /// Payload bytes, NUL-padded to the fixed width.
    pub payload: [u8; PAYLOAD_SIZE],
}

impl MessageFrame {
    /// Builds a frame carrying `content`, stamped with this process's ID.
    ///
    /// Content longer than [`PAYLOAD_SIZE`] is truncated; shorter content is
    /// padded with NUL bytes.
    ///
    /// # Errors
    ///
    /// `BadMessagePartNumber` when `part_no >= num_parts`.
    pub fn new(message_id: u32, part_no: u16, num_parts: u16, content: &[u8]) -> Result<Self> {
        if part_no >= num_parts {
            return BadMessagePartNumberSnafu { part_no, num_parts }.fail();
        }

        let mut payload = [0u8; PAYLOAD_SIZE];
        let len = content.len().min(PAYLOAD_SIZE);
        payload[..len].copy_from_slice(&content[..len]);

        Ok(MessageFrame {
            sender_id: process_id(),
            message_id,
            part_no,
            num_parts,
            payload,
        })
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[SENDER_ID_OFFSET..SENDER_ID_OFFSET + 4].copy_from_slice(&self.sender_id.to_le_bytes());
        buf[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 4]
            .copy_from_slice(&self.message_id.to_le_bytes());
        buf[PART_NO_OFFSET..PART_NO_OFFSET + 2].copy_from_slice(&self.part_no.to_le_bytes());
        buf[NUM_PARTS_OFFSET..NUM_PARTS_OFFSET + 2].copy_from_slice(&self.num_parts.to_le_bytes());
        buf[PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
        buf
    }

    /// Decodes a received frame.
    ///
    /// # Errors
    ///
    /// `BadMessagePartNumber` when the frame's part number is not less than
    /// its part count.
    pub fn decode(buf: &[u8; MESSAGE_SIZE]) -> Result<Self> {
        let part_no = u16::from_le_bytes(
            buf[PART_NO_OFFSET..PART_NO_OFFSET + 2]
                .try_into()
                .expect("slice length is 2"),
        );
        let num_parts = u16::from_le_bytes(
            buf[NUM_PARTS_OFFSET..NUM_PARTS_OFFSET + 2]
                .try_into()
                .expect("slice length is 2"),
        );
        if part_no >= num_parts {
            return BadMessagePartNumberSnafu { part_no, num_parts }.fail();
        }

        Ok(MessageFrame {
            sender_id: u32::from_le_bytes(
                buf[SENDER_ID_OFFSET..SENDER_ID_OFFSET + 4]
                    .try_into()
                    .expect("slice length is 4"),
            ),
            message_id: u32::from_le_bytes(
                buf[MESSAGE_ID_OFFSET..MESSAGE_ID_OFFSET + 4]
                    .try_into()
                    .expect("slice length is 4"),
            ),
            part_no,
            num_parts,
            payload: buf[PAYLOAD_OFFSET..]
                .try_into()
                .expect("payload length matches"),
        })
    }

    /// The payload with trailing NUL padding stripped.
    pub fn content(&self) -> &[u8] {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        &self.payload[..end]
    }
}

impl std::fmt::Debug for MessageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFrame")
            .field("sender_id", &self.sender_id)
            .field("message_id", &self.message_id)
            .field("part_no", &self.part_no)
            .field("num_parts", &self.num_parts)
            .field("content_len", &self.content().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_fixed() {
        assert_eq!(MESSAGE_SIZE, 256);
        assert_eq!(PAYLOAD_SIZE, 244);
        assert_eq!(PAYLOAD_OFFSET, 12);
    }

    #[test]
    fn frames_round_trip() {
        let frame = MessageFrame::new(42, 1, 3, b"hello broker").expect("frame should build");
        let decoded = MessageFrame::decode(&frame.encode()).expect("frame should decode");
        assert_eq!(decoded, frame);
        assert_eq!(decoded.content(), b"hello broker");
        assert_eq!(decoded.sender_id, process_id());
    }

    #[test]
    fn short_content_is_nul_padded() {
        let frame = MessageFrame::new(1, 0, 1, b"abc").expect("frame should build");
        assert_eq!(&frame.payload[..3], b"abc");
        assert!(frame.payload[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn long_content_is_truncated() {
        let long = vec![0x41u8; PAYLOAD_SIZE + 50];
        let frame = MessageFrame::new(1, 0, 1, &long).expect("frame should build");
        assert_eq!(frame.content().len(), PAYLOAD_SIZE);
    }

    #[test]
    fn part_number_must_be_in_range() {
        let error = MessageFrame::new(1, 2, 2, b"x").expect_err("part 2 of 2 is out of range");
        assert!(matches!(
            error,
            crate::StoreError::BadMessagePartNumber {
                part_no: 2,
                num_parts: 2
            }
        ));

        let mut bytes = MessageFrame::new(1, 0, 1, b"x")
            .expect("frame should build")
            .encode();
        bytes[NUM_PARTS_OFFSET] = 0;
        assert!(MessageFrame::decode(&bytes).is_err());
    }
}
