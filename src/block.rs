use crate::session::{ProtocolError, SessionError};
use crate::transport::{Transport, TransportError};

/// Payload of an IEEE 488.2 definite-length block response.
///
/// The wire format is `#<d><length><payload><terminator>`: a `#` tag,
/// one digit giving the width of the decimal length field, the payload
/// byte count, the payload itself and a single trailing terminator
/// byte. Construction guarantees the payload length equals the count
/// declared in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBlock {
    data: Vec<u8>,
}

impl BinaryBlock {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Incremental block decoder over a transport.
///
/// Reads are issued bounded to what the current parse stage still
/// needs, so a single underlying read may cover any fraction of the
/// header or payload without desynchronizing the stream.
pub(crate) struct BlockReader<'a> {
    transport: &'a mut dyn Transport,
}

impl<'a> BlockReader<'a> {
    pub(crate) fn new(transport: &'a mut dyn Transport) -> Self {
        Self { transport }
    }

    /// Parse the `#<d><length>` header and return the declared payload
    /// byte count.
    pub(crate) fn read_header(&mut self) -> Result<usize, SessionError> {
        let mut byte = [0u8; 1];
        self.fill(&mut byte)?;
        if byte[0] != b'#' {
            return Err(ProtocolError::BadBlockTag(byte[0]).into());
        }

        self.fill(&mut byte)?;
        let digits = match byte[0] {
            b'0' => return Err(ProtocolError::IndefiniteBlock.into()),
            b'1'..=b'9' => usize::from(byte[0] - b'0'),
            other => return Err(ProtocolError::BadLengthDigit(other).into()),
        };

        let mut field = vec![0u8; digits];
        self.fill(&mut field)?;
        let mut length = 0usize;
        for &digit in &field {
            if !digit.is_ascii_digit() {
                return Err(ProtocolError::BadLengthDigit(digit).into());
            }
            length = length * 10 + usize::from(digit - b'0');
        }
        Ok(length)
    }

    /// Read exactly `length` payload bytes plus the trailing terminator
    /// byte, which is framing and gets discarded.
    pub(crate) fn read_payload(&mut self, length: usize) -> Result<Vec<u8>, SessionError> {
        let mut payload = vec![0u8; length];
        self.fill(&mut payload)?;

        let mut terminator = [0u8; 1];
        self.fill(&mut terminator)?;
        Ok(payload)
    }

    /// Read until `buf` is full, looping over short reads.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), SessionError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.transport.read(&mut buf[filled..])?;
            if n == 0 {
                // Peer closed with the block incomplete.
                return Err(TransportError::ConnectionClosed.into());
            }
            filled += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptedTransport, Step};

    fn read_block(steps: Vec<Step>) -> Result<Vec<u8>, SessionError> {
        let mut transport = ScriptedTransport::new(steps);
        let mut reader = BlockReader::new(&mut transport);
        let length = reader.read_header()?;
        reader.read_payload(length)
    }

    #[test]
    fn test_block_in_a_single_read() {
        let payload = read_block(vec![Step::Read(b"#18abcdefgh\n".to_vec())]).unwrap();
        assert_eq!(payload, b"abcdefgh");
    }

    #[test]
    fn test_block_split_into_single_bytes() {
        let steps = b"#210abcdefghij\n"
            .iter()
            .map(|&b| Step::Read(vec![b]))
            .collect();
        let payload = read_block(steps).unwrap();
        assert_eq!(payload, b"abcdefghij");
    }

    #[test]
    fn test_header_split_inside_length_field() {
        let payload = read_block(vec![
            Step::Read(b"#".to_vec()),
            Step::Read(b"21".to_vec()),
            Step::Read(b"0abcde".to_vec()),
            Step::Read(b"fghij\n".to_vec()),
        ])
        .unwrap();
        assert_eq!(payload, b"abcdefghij");
    }

    #[test]
    fn test_payload_may_contain_terminator_bytes() {
        let payload = read_block(vec![Step::Read(b"#14a\nb\n\n".to_vec())]).unwrap();
        assert_eq!(payload, b"a\nb\n");
    }

    #[test]
    fn test_empty_block() {
        let payload = read_block(vec![Step::Read(b"#10\n".to_vec())]).unwrap();
        assert_eq!(payload, b"");
    }

    #[test]
    fn test_peer_close_mid_payload_is_transport_error() {
        let err = read_block(vec![Step::Read(b"#18abc".to_vec()), Step::Eof]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_peer_close_before_terminator_is_transport_error() {
        let err = read_block(vec![Step::Read(b"#13abc".to_vec()), Step::Eof]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_bad_tag() {
        let err = read_block(vec![Step::Read(b"X18abcdefgh\n".to_vec())]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::BadBlockTag(b'X'))
        ));
    }

    #[test]
    fn test_indefinite_block_rejected() {
        let err = read_block(vec![Step::Read(b"#0payload".to_vec())]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::IndefiniteBlock)
        ));
    }

    #[test]
    fn test_non_digit_in_length_field() {
        let err = read_block(vec![Step::Read(b"#2x0abc".to_vec())]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::BadLengthDigit(b'x'))
        ));
    }

    #[test]
    fn test_terminator_consumed_between_consecutive_blocks() {
        let mut transport = ScriptedTransport::new(vec![
            Step::Read(b"#13abc\n".to_vec()),
            Step::Read(b"#13def\n".to_vec()),
        ]);

        let mut reader = BlockReader::new(&mut transport);
        let length = reader.read_header().unwrap();
        assert_eq!(reader.read_payload(length).unwrap(), b"abc");

        let mut reader = BlockReader::new(&mut transport);
        let length = reader.read_header().unwrap();
        assert_eq!(reader.read_payload(length).unwrap(), b"def");
    }
}
