use crate::{
    channel::{Channel, Timeout, Transport},
    error::{ProtocolError, WireError},
};
use std::time::{Duration, Instant};
use tracing::warn;

/// Single protocol revision; checked right after HELLO, mismatch is fatal.
pub const PROTOCOL_VERSION: u32 = 0x0100_0001;

/// How often a busy or idle side must emit `Msg::TellOnline` so the peer's
/// bounded read does not mistake silence for death.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// The closed set of message codes. A message on the wire is this code as a
/// u32 followed by the payload the code implies (see each arm's doc).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Msg {
    /// Keepalive; transparent to any reader waiting for something else.
    TellOnline = 0,
    /// Worker greeting: id, protocol version, language count, languages.
    Hello = 1,
    /// Registration rejected: the id is already connected.
    DuplicatedId = 2,
    /// Registration rejected: the id exceeds the server's length limit.
    IdTooLong = 3,
    /// Registration accepted.
    ConnectOk = 4,
    /// Server asks the worker for one info value: key.
    QueryInfo = 5,
    /// Worker answers a query: value.
    AnsQuery = 6,
    /// Server starts a task: problem code; directory sync follows inline.
    PrepareData = 7,
    /// Worker aborts the task after sync: reason.
    DataError = 8,
    /// Worker accepted the data: number of test cases.
    DataOk = 9,
    /// Server sends the job: language, source, input name, output name.
    StartJudge = 10,
    StartJudgeOk = 11,
    /// Worker is waiting on a local resource; may repeat before Ok.
    StartJudgeWait = 12,
    CompileSucceed = 13,
    /// Compilation failed: reason.
    CompileFail = 14,
    /// One case outcome: case result record.
    ReportCase = 15,
    ReportJudgeFinish = 16,
    /// Raw file transfer: both sides opened their file.
    FileBegin = 17,
    /// Raw file transfer: receiver is ready for data.
    FileTransBegin = 18,
    FileEnd = 19,
    FileCheckOk = 20,
    FileCheckFail = 21,
    /// A local open/read/write failed before or during a transfer.
    FileSystemError = 22,
    /// Directory sync: manifest follows (count, then name/digest pairs).
    SyncdirBegin = 23,
    /// Directory sync: indices of needed files in the sender's manifest.
    SyncdirFileList = 24,
    /// Directory sync: the archive transfer is about to start.
    SyncdirFtrans = 25,
    SyncdirDone = 26,
    /// Unrecoverable condition on the sending side.
    Error = 0xffff_ffff,
}

impl Msg {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Msg> {
        let msg = match code {
            0 => Msg::TellOnline,
            1 => Msg::Hello,
            2 => Msg::DuplicatedId,
            3 => Msg::IdTooLong,
            4 => Msg::ConnectOk,
            5 => Msg::QueryInfo,
            6 => Msg::AnsQuery,
            7 => Msg::PrepareData,
            8 => Msg::DataError,
            9 => Msg::DataOk,
            10 => Msg::StartJudge,
            11 => Msg::StartJudgeOk,
            12 => Msg::StartJudgeWait,
            13 => Msg::CompileSucceed,
            14 => Msg::CompileFail,
            15 => Msg::ReportCase,
            16 => Msg::ReportJudgeFinish,
            17 => Msg::FileBegin,
            18 => Msg::FileTransBegin,
            19 => Msg::FileEnd,
            20 => Msg::FileCheckOk,
            21 => Msg::FileCheckFail,
            22 => Msg::FileSystemError,
            23 => Msg::SyncdirBegin,
            24 => Msg::SyncdirFileList,
            25 => Msg::SyncdirFtrans,
            26 => Msg::SyncdirDone,
            0xffff_ffff => Msg::Error,
            _ => return None,
        };
        Some(msg)
    }
}

impl<T: Transport> Channel<T> {
    pub fn send_msg(&mut self, msg: Msg, timeout: Timeout) -> Result<(), WireError> {
        self.write_u32(msg.code(), timeout)?;
        Ok(())
    }

    /// Receives one message; does not interpret keepalives.
    pub fn recv_msg(&mut self, timeout: Timeout) -> Result<Msg, WireError> {
        let code = self.read_u32(timeout)?;
        match Msg::from_code(code) {
            Some(msg) => Ok(msg),
            None => {
                warn!(peer = %self.peer(), code, "unknown message code");
                Err(ProtocolError::UnknownCode(code).into())
            }
        }
    }

    /// Waits for one of `accepted`, consuming keepalives transparently.
    ///
    /// The deadline is fixed when the call starts: an intervening
    /// `TellOnline` neither resets nor extends it.
    pub fn recv_any(&mut self, accepted: &[Msg], timeout: Timeout) -> Result<Msg, WireError> {
        let deadline = self.deadline(timeout);
        loop {
            let remaining = match deadline {
                None => Timeout::Never,
                Some(d) => Timeout::After(d.saturating_duration_since(Instant::now())),
            };
            let msg = self.recv_msg(remaining)?;
            if msg == Msg::TellOnline {
                continue;
            }
            if accepted.contains(&msg) {
                return Ok(msg);
            }
            warn!(
                peer = %self.peer(),
                got = msg.code(),
                "message sequence violation"
            );
            return Err(ProtocolError::UnexpectedMessage {
                expected: "one of the messages legal in this state",
                got: msg.code(),
            }
            .into());
        }
    }

    /// Waits for exactly `want`, consuming keepalives transparently under a
    /// single fixed deadline.
    pub fn expect_msg(&mut self, want: Msg, timeout: Timeout) -> Result<(), WireError> {
        self.recv_any(&[want], timeout).map(|_| ())
    }
}
