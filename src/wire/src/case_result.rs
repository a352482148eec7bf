use crate::{
    channel::{Channel, Timeout, Transport},
    error::{ProtocolError, WireError},
};
use serde::{Deserialize, Serialize};

/// Outcome of executing one test case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ExeStatus {
    Correct = 0,
    PartiallyCorrect = 1,
    WrongAnswer = 2,
    TimeLimitExceeded = 3,
    Killed = 4,
    SegFault = 5,
    Signalled = 6,
    IllegalSyscall = 7,
    NonzeroExit = 8,
    SystemError = 9,
}

impl ExeStatus {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<ExeStatus> {
        let st = match code {
            0 => ExeStatus::Correct,
            1 => ExeStatus::PartiallyCorrect,
            2 => ExeStatus::WrongAnswer,
            3 => ExeStatus::TimeLimitExceeded,
            4 => ExeStatus::Killed,
            5 => ExeStatus::SegFault,
            6 => ExeStatus::Signalled,
            7 => ExeStatus::IllegalSyscall,
            8 => ExeStatus::NonzeroExit,
            9 => ExeStatus::SystemError,
            _ => return None,
        };
        Some(st)
    }
}

impl std::fmt::Display for ExeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            ExeStatus::Correct => "correct",
            ExeStatus::PartiallyCorrect => "partially correct",
            ExeStatus::WrongAnswer => "wrong answer",
            ExeStatus::TimeLimitExceeded => "time limit exceeded",
            ExeStatus::Killed => "killed",
            ExeStatus::SegFault => "segmentation fault",
            ExeStatus::Signalled => "terminated by signal",
            ExeStatus::IllegalSyscall => "illegal system call",
            ExeStatus::NonzeroExit => "non-zero exit code",
            ExeStatus::SystemError => "system error",
        };
        f.write_str(text)
    }
}

/// One test case's result as it travels from worker to server and onward to
/// the task source. Time is microseconds of wall clock, memory is kilobytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub status: ExeStatus,
    pub score: u32,
    pub time_us: u32,
    pub memory_kb: u32,
    pub extra_info: String,
}

impl CaseResult {
    pub fn write_to<T: Transport>(
        &self,
        chan: &mut Channel<T>,
        timeout: Timeout,
    ) -> Result<(), WireError> {
        chan.write_u32(self.status.code(), timeout)?;
        chan.write_u32(self.score, timeout)?;
        chan.write_u32(self.time_us, timeout)?;
        chan.write_u32(self.memory_kb, timeout)?;
        chan.write_string(self.extra_info.as_bytes(), timeout)?;
        Ok(())
    }

    pub fn read_from<T: Transport>(
        chan: &mut Channel<T>,
        timeout: Timeout,
    ) -> Result<CaseResult, WireError> {
        let status_code = chan.read_u32(timeout)?;
        let status = ExeStatus::from_code(status_code)
            .ok_or(ProtocolError::BadPayload("unknown execution status"))?;
        let score = chan.read_u32(timeout)?;
        let time_us = chan.read_u32(timeout)?;
        let memory_kb = chan.read_u32(timeout)?;
        let extra_info = String::from_utf8_lossy(&chan.read_string(timeout)?).into_owned();
        Ok(CaseResult {
            status,
            score,
            time_us,
            memory_kb,
            extra_info,
        })
    }
}
