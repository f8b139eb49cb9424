//! Wire format shared by the controller and the agent.
//!
//! Every transaction starts with a three byte header sent by the controller: one byte
//! [FrameType], followed by the payload length in big endian. For [FrameType::Read] and
//! [FrameType::Reread] the length bytes are ignored by the agent, which instead answers with the
//! length of the packet it's going to deliver.
use macro_bits::serializable_enum;

/// Size of the frame type field.
pub const FRAME_TYPE_SIZE: usize = 1;
/// Size of the big endian length field.
pub const FRAME_LENGTH_SIZE: usize = 2;
/// Size of the complete header.
pub const FRAME_HEADER_SIZE: usize = FRAME_TYPE_SIZE + FRAME_LENGTH_SIZE;
/// The largest payload, that can be described by the length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// The type code in the first byte of a header.
    ///
    /// These values must be kept in sync with the agent.
    pub enum FrameType: u8 {
        Nack => 0x00,
        Ack => 0x01,
        Write => 0x02,
        Read => 0x03,
        Reread => 0x04
    }
}

/// A decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub length: u16,
}
impl FrameHeader {
    pub const fn new(frame_type: FrameType, length: u16) -> Self {
        Self { frame_type, length }
    }
    /// A read request. The length is left zeroed, since it's supplied by the agent.
    pub const fn read(reread: bool) -> Self {
        Self::new(
            if reread {
                FrameType::Reread
            } else {
                FrameType::Read
            },
            0,
        )
    }
    /// Serialize the header for transmission.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let [length_hi, length_lo] = self.length.to_be_bytes();
        [self.frame_type.into_bits(), length_hi, length_lo]
    }
    /// Deserialize a header.
    pub fn parse(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            frame_type: FrameType::from_bits(bytes[0]),
            length: length_from_bytes([bytes[1], bytes[2]]),
        }
    }
}

/// Assemble the length, as it is sent by the agent.
pub const fn length_from_bytes(bytes: [u8; FRAME_LENGTH_SIZE]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// Check whether the byte sent by the agent after a write is an ACK.
///
/// Anything but [FrameType::Ack] counts as a NACK.
pub const fn is_ack(byte: u8) -> bool {
    byte == FrameType::Ack.into_bits()
}
