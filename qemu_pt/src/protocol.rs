//! Control bytes exchanged with QEMU-PT over the control socket.
use std::{convert::TryFrom, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Acquire = b'R',
    Release = b'D',
    Reload = b'L',
    EnableSampling = b'S',
    DisableSampling = b'O',
    CommitFilter = b'T',
    Finalize = b'F',
    EnableRqiMode = b'A',
    DisableRqiMode = b'B',
    EnableTraceMode = b'E',
    DisableTraceMode = b'G',
    EnablePatches = b'P',
    DisablePatches = b'Q',
    SetLightInstrumentation = b'U',
    SetSeInstrumentation = b'V',
    SetWhitelistInstrumentation = b'W',
    SetBlacklist = b'Y',
    Printf = b'X',
    Crash = b'C',
    Kasan = b'K',
    Info = b'I',
    Timeout = b't',
    Abort = b'H',
    PtTrashed = b'[',
    PtTrashedCrash = b']',
    PtTrashedKasan = b'{',
}

const COMMANDS: [Command; 26] = [
    Command::Acquire,
    Command::Release,
    Command::Reload,
    Command::EnableSampling,
    Command::DisableSampling,
    Command::CommitFilter,
    Command::Finalize,
    Command::EnableRqiMode,
    Command::DisableRqiMode,
    Command::EnableTraceMode,
    Command::DisableTraceMode,
    Command::EnablePatches,
    Command::DisablePatches,
    Command::SetLightInstrumentation,
    Command::SetSeInstrumentation,
    Command::SetWhitelistInstrumentation,
    Command::SetBlacklist,
    Command::Printf,
    Command::Crash,
    Command::Kasan,
    Command::Info,
    Command::Timeout,
    Command::Abort,
    Command::PtTrashed,
    Command::PtTrashedCrash,
    Command::PtTrashedKasan,
];

impl Command {
    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Acquire => "ACQUIRE",
            Command::Release => "RELEASE",
            Command::Reload => "RELOAD",
            Command::EnableSampling => "ENABLE_SAMPLING",
            Command::DisableSampling => "DISABLE_SAMPLING",
            Command::CommitFilter => "COMMIT_FILTER",
            Command::Finalize => "FINALIZE",
            Command::EnableRqiMode => "ENABLE_RQI_MODE",
            Command::DisableRqiMode => "DISABLE_RQI_MODE",
            Command::EnableTraceMode => "ENABLE_TRACE_MODE",
            Command::DisableTraceMode => "DISABLE_TRACE_MODE",
            Command::EnablePatches => "ENABLE_PATCHES",
            Command::DisablePatches => "DISABLE_PATCHES",
            Command::SetLightInstrumentation => "REDQUEEN_SET_LIGHT_INSTRUMENTATION",
            Command::SetSeInstrumentation => "REDQUEEN_SET_SE_INSTRUMENTATION",
            Command::SetWhitelistInstrumentation => "REDQUEEN_SET_WHITELIST_INSTRUMENTATION",
            Command::SetBlacklist => "REDQUEEN_SET_BLACKLIST",
            Command::Printf => "PRINTF",
            Command::Crash => "CRASH",
            Command::Kasan => "KASAN",
            Command::Info => "INFO",
            Command::Timeout => "TIMEOUT",
            Command::Abort => "ABORT",
            Command::PtTrashed => "PT_TRASHED",
            Command::PtTrashedCrash => "PT_TRASHED_CRASH",
            Command::PtTrashedKasan => "PT_TRASHED_KASAN",
        }
    }

    /// Whether the trace buffer overflowed during the run.
    #[inline]
    pub fn is_overflow(self) -> bool {
        matches!(
            self,
            Command::PtTrashed | Command::PtTrashedCrash | Command::PtTrashedKasan
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        COMMANDS.iter().copied().find(|c| c.byte() == b).ok_or(b)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_distinct() {
        for c in COMMANDS.iter() {
            assert_eq!(Command::try_from(c.byte()), Ok(*c));
        }
        assert_eq!(Command::try_from(b'Z'), Err(b'Z'));
        assert_eq!(Command::Timeout.byte(), b't');
    }
}
