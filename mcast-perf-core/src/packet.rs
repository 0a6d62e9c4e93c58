use crate::error::CollectorError;

/// Bytes taken by the tag and sequence fields
pub const HEADER_LEN: usize = 8;

/// Largest UDP payload that fits a 1500-byte MTU without fragmenting
pub const MAX_UDP_PAYLOAD: usize = 1472;

/// 700 bytes of user data plus 32 bytes of messaging-layer framing
pub const DEFAULT_MSG_LEN: usize = 700 + 32;

/// In-band message tags that drive the receiver's run phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Warmup,
    Data,
    Quit,
}

impl MessageType {
    pub fn tag(self) -> u32 {
        match self {
            MessageType::Warmup => 0,
            MessageType::Data => 1,
            MessageType::Quit => 2,
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = CollectorError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageType::Warmup),
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Quit),
            other => Err(CollectorError::UnknownMessageType(other)),
        }
    }
}

/// Raw header fields as they sit on the wire.
///
/// Both fields are host byte order: sender and receiver are expected to share
/// endianness, nothing is normalised to network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub tag: u32,
    pub sequence: u32,
}

impl DatagramHeader {
    /// Parse the header from the front of a received payload
    pub fn parse(data: &[u8]) -> Result<Self, CollectorError> {
        if data.len() < HEADER_LEN {
            return Err(CollectorError::Truncated(data.len()));
        }

        let tag = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        let sequence = u32::from_ne_bytes([data[4], data[5], data[6], data[7]]);

        Ok(Self { tag, sequence })
    }

    pub fn message_type(&self) -> Result<MessageType, CollectorError> {
        MessageType::try_from(self.tag)
    }
}

/// Reusable outgoing datagram of a fixed length
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buffer: Vec<u8>,
    sequence: u32,
}

impl MessageBuilder {
    /// `msg_len` must already be validated to `HEADER_LEN..=MAX_UDP_PAYLOAD`
    pub fn new(msg_len: usize) -> Self {
        let mut builder = Self {
            buffer: vec![0u8; msg_len.max(HEADER_LEN)],
            sequence: 0,
        };
        builder.set_kind(MessageType::Warmup);
        builder
    }

    /// Switch the tag and restart the sequence at 0
    pub fn set_kind(&mut self, kind: MessageType) {
        self.buffer[0..4].copy_from_slice(&kind.tag().to_ne_bytes());
        self.sequence = 0;
        self.write_sequence();
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    /// Bump the sequence field for the next send
    pub fn advance(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.write_sequence();
    }

    fn write_sequence(&mut self) {
        self.buffer[4..8].copy_from_slice(&self.sequence.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_layout() {
        let mut builder = MessageBuilder::new(100);
        builder.set_kind(MessageType::Data);
        builder.advance();
        builder.advance();

        let payload = builder.payload();
        assert_eq!(payload.len(), 100);
        assert!(payload[HEADER_LEN..].iter().all(|&b| b == 0));

        let header = DatagramHeader::parse(payload).unwrap();
        assert_eq!(header.tag, 1);
        assert_eq!(header.sequence, 2);
        assert_eq!(header.message_type().unwrap(), MessageType::Data);
    }

    #[test]
    fn test_set_kind_restarts_sequence() {
        let mut builder = MessageBuilder::new(DEFAULT_MSG_LEN);
        for _ in 0..5 {
            builder.advance();
        }
        builder.set_kind(MessageType::Quit);

        let header = DatagramHeader::parse(builder.payload()).unwrap();
        assert_eq!(header.message_type().unwrap(), MessageType::Quit);
        assert_eq!(header.sequence, 0);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut data = vec![0u8; 16];
        data[0..4].copy_from_slice(&7u32.to_ne_bytes());
        let header = DatagramHeader::parse(&data).unwrap();
        assert!(matches!(
            header.message_type(),
            Err(CollectorError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn test_truncated_datagram() {
        assert!(matches!(
            DatagramHeader::parse(&[0u8; 5]),
            Err(CollectorError::Truncated(5))
        ));
    }
}
