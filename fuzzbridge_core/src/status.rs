/// Process exit codes fixed by the engine's reporting conventions.
pub const CLEAN_EXIT_CODE: i32 = 0;
pub const CRASH_EXIT_CODE: i32 = 1;
pub const TIMEOUT_EXIT_CODE: i32 = 70;
pub const ERROR_EXIT_CODE: i32 = 77;

/// How a fuzzing process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    /// A crash found by a sanitizer (or any unrecognized abnormal end).
    Crash,
    Timeout,
    /// A fault in the callable or a broken contract, reported by the engine.
    ContractError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => CLEAN_EXIT_CODE,
            ExitStatus::Crash => CRASH_EXIT_CODE,
            ExitStatus::Timeout => TIMEOUT_EXIT_CODE,
            ExitStatus::ContractError => ERROR_EXIT_CODE,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            CLEAN_EXIT_CODE => ExitStatus::Clean,
            TIMEOUT_EXIT_CODE => ExitStatus::Timeout,
            ERROR_EXIT_CODE => ExitStatus::ContractError,
            _ => ExitStatus::Crash,
        }
    }

    /// Classifies a finished child; signal deaths count as crashes.
    pub fn from_process(status: &std::process::ExitStatus) -> Self {
        status.code().map_or(ExitStatus::Crash, Self::from_code)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitStatus::Clean => "clean",
            ExitStatus::Crash => "crash",
            ExitStatus::Timeout => "timeout",
            ExitStatus::ContractError => "error",
        };
        write!(f, "{name} (exit {})", self.code())
    }
}
