use crate::block::{BinaryBlock, BlockReader};
use crate::transport::{Transport, TransportError};

/// Lifecycle of one half-duplex SCPI session.
///
/// Framing-breaking failures (timeout, connection loss mid-response)
/// move the session to `Closed` because the stream position is no
/// longer trustworthy; the owner must reconnect. Parse failures on a
/// fully framed response keep the session `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingResponse,
    AssemblingBlock,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Expected '#' at the start of a binary block, got byte 0x{0:02x}")]
    BadBlockTag(u8),

    #[error("Indefinite-length binary block ('#0') is not supported")]
    IndefiniteBlock,

    #[error("Invalid digit 0x{0:02x} in binary block length field")]
    BadLengthDigit(u8),

    #[error("Empty response to '{0}'")]
    EmptyResponse(String),

    #[error("Response is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Cannot parse {field} from '{text}'")]
    NumericField { field: &'static str, text: String },

    #[error("Malformed identification reply '{0}'")]
    Identity(String),

    #[error("Unknown trigger status '{0}'")]
    TriggerStatus(String),

    #[error("Malformed error queue reply '{0}'")]
    ErrorQueue(String),

    #[error("Malformed waveform preamble: {0}")]
    Preamble(String),

    #[error("Waveform chunk holds {got} samples where {expected} were requested")]
    ShortChunk { expected: usize, got: usize },

    #[error("WORD format waveform data has odd byte length {0}")]
    OddWordPayload(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Instrument error {code}: {message}")]
    Device { code: i32, message: String },

    #[error("Session is closed, reconnect to continue")]
    Closed,

    #[error("Session is busy with an outstanding request")]
    NotIdle,
}

/// Half-duplex SCPI command/query engine on top of a [`Transport`].
///
/// Exactly one request may be in flight per session; the protocol has
/// no framing that would let interleaved requests be told apart.
pub struct ScpiSession {
    transport: Box<dyn Transport>,
    state: SessionState,
}

impl ScpiSession {
    const READ_BUF: usize = 512;

    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn begin(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::AwaitingResponse | SessionState::AssemblingBlock => {
                Err(SessionError::NotIdle)
            }
        }
    }

    fn write_line(&mut self, command: &str) -> Result<(), SessionError> {
        let mut message = Vec::with_capacity(command.len() + 1);
        message.extend_from_slice(command.as_bytes());
        message.push(b'\n');
        if let Err(e) = self.transport.write_all(&message) {
            self.state = SessionState::Closed;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a command that produces no response.
    pub fn send_command(&mut self, command: &str) -> Result<(), SessionError> {
        self.begin()?;
        log::debug!("-> {}", command);
        self.write_line(command)
    }

    /// Send a query and read its text reply, stripped of the trailing
    /// terminator.
    pub fn send_query(&mut self, command: &str) -> Result<String, SessionError> {
        self.begin()?;
        log::debug!("-> {}", command);
        self.write_line(command)?;

        self.state = SessionState::AwaitingResponse;
        let raw = match self.read_line() {
            Ok(raw) => raw,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };
        self.state = SessionState::Idle;

        // The response is framed at this point; what follows no longer
        // invalidates the stream position.
        let text = String::from_utf8(raw).map_err(ProtocolError::from)?;
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return Err(ProtocolError::EmptyResponse(command.to_string()).into());
        }
        log::debug!("<- {}", text);
        Ok(text.to_string())
    }

    /// Send a query whose reply is a definite-length binary block.
    ///
    /// Block payloads can contain any byte value, so the reply is never
    /// scanned for a line terminator.
    pub fn send_binary_query(&mut self, command: &str) -> Result<BinaryBlock, SessionError> {
        self.begin()?;
        log::debug!("-> {}", command);
        self.write_line(command)?;

        self.state = SessionState::AwaitingResponse;
        let mut reader = BlockReader::new(self.transport.as_mut());
        let length = match reader.read_header() {
            Ok(length) => length,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };
        self.state = SessionState::AssemblingBlock;
        let payload = match reader.read_payload(length) {
            Ok(payload) => payload,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };
        self.state = SessionState::Idle;
        log::debug!("<- binary block, {} bytes", payload.len());
        Ok(BinaryBlock::new(payload))
    }

    /// Poll the instrument error queue and surface a nonzero entry as a
    /// device error.
    pub fn check_error(&mut self) -> Result<(), SessionError> {
        let reply = self.send_query(":SYSTem:ERRor?")?;
        let (code, message) = parse_error_reply(&reply)?;
        if code != 0 {
            return Err(SessionError::Device { code, message });
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Closed;
        self.transport.close()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut response = Vec::new();
        let mut buf = [0u8; Self::READ_BUF];
        loop {
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed.into());
            }
            response.extend_from_slice(&buf[..n]);
            if response.ends_with(b"\n") {
                return Ok(response);
            }
        }
    }
}

/// Parse a `<code>,"<message>"` error queue reply.
fn parse_error_reply(reply: &str) -> Result<(i32, String), ProtocolError> {
    let (code, message) = reply
        .split_once(',')
        .ok_or_else(|| ProtocolError::ErrorQueue(reply.to_string()))?;
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| ProtocolError::ErrorQueue(reply.to_string()))?;
    Ok((code, message.trim().trim_matches('"').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{sent_lines, ScriptedTransport, Step};

    fn session_with(steps: Vec<Step>) -> (ScpiSession, std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        let transport = ScriptedTransport::new(steps);
        let written = transport.written();
        (ScpiSession::new(Box::new(transport)), written)
    }

    #[test]
    fn test_query_strips_terminator() {
        let (mut session, written) = session_with(vec![Step::line("RIGOL TECHNOLOGIES")]);
        let reply = session.send_query("*IDN?").unwrap();
        assert_eq!(reply, "RIGOL TECHNOLOGIES");
        assert_eq!(sent_lines(&written), vec!["*IDN?"]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_query_strips_carriage_return() {
        let (mut session, _) = session_with(vec![Step::Read(b"1.0e-3\r\n".to_vec())]);
        assert_eq!(session.send_query(":TIMebase:MAIN:SCALe?").unwrap(), "1.0e-3");
    }

    #[test]
    fn test_query_reassembles_fragmented_reply() {
        let (mut session, _) = session_with(vec![
            Step::Read(b"12".to_vec()),
            Step::Read(b"0".to_vec()),
            Step::Read(b"0\n".to_vec()),
        ]);
        assert_eq!(session.send_query(":WAVeform:POINts?").unwrap(), "1200");
    }

    #[test]
    fn test_empty_reply_is_protocol_error_and_session_stays_usable() {
        let (mut session, _) = session_with(vec![Step::line(""), Step::line("DS1104Z")]);
        let err = session.send_query("*IDN?").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::EmptyResponse(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.send_query("*IDN?").unwrap(), "DS1104Z");
    }

    #[test]
    fn test_timeout_closes_session() {
        let (mut session, _) = session_with(vec![Step::Timeout]);
        let err = session.send_query("*IDN?").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::Timeout(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.send_query("*IDN?"),
            Err(SessionError::Closed)
        ));
        assert!(matches!(
            session.send_command(":RUN"),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn test_peer_close_mid_reply() {
        let (mut session, _) = session_with(vec![Step::Read(b"RIG".to_vec()), Step::Eof]);
        let err = session.send_query("*IDN?").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::ConnectionClosed)
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_command_writes_terminated_line() {
        let (mut session, written) = session_with(vec![]);
        session.send_command(":RUN").unwrap();
        assert_eq!(written.borrow().as_slice(), b":RUN\n");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_binary_query_returns_payload() {
        let (mut session, written) = session_with(vec![Step::Read(b"#18abcdefgh\n".to_vec())]);
        let block = session.send_binary_query(":DISPlay:DATA?").unwrap();
        assert_eq!(block.as_bytes(), b"abcdefgh");
        assert_eq!(sent_lines(&written), vec![":DISPlay:DATA?"]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_binary_query_peer_close_mid_payload() {
        let (mut session, _) = session_with(vec![Step::Read(b"#18abc".to_vec()), Step::Eof]);
        let err = session.send_binary_query(":DISPlay:DATA?").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::ConnectionClosed)
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_check_error_passes_on_zero_code() {
        let (mut session, written) = session_with(vec![Step::line("0,\"No error\"")]);
        session.check_error().unwrap();
        assert_eq!(sent_lines(&written), vec![":SYSTem:ERRor?"]);
    }

    #[test]
    fn test_check_error_surfaces_device_error() {
        let (mut session, _) = session_with(vec![Step::line("-113,\"Undefined header\"")]);
        let err = session.check_error().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Device { code: -113, ref message } if message == "Undefined header"
        ));
    }

    #[test]
    fn test_malformed_error_reply() {
        assert!(matches!(
            parse_error_reply("gibberish"),
            Err(ProtocolError::ErrorQueue(_))
        ));
        assert!(matches!(
            parse_error_reply("x,\"message\""),
            Err(ProtocolError::ErrorQueue(_))
        ));
    }

    #[test]
    fn test_close_makes_session_unusable() {
        let (mut session, _) = session_with(vec![]);
        session.close().unwrap();
        assert!(matches!(
            session.send_query("*IDN?"),
            Err(SessionError::Closed)
        ));
    }
}
