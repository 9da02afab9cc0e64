//! Process-wide error classification and exit-status tracking.
//!
//! Every failure in the retriever maps onto one of a small set of exit
//! ranks. The process exit code is the most severe rank ever reported
//! (numerically lowest nonzero value); later, milder errors never clobber it.

use std::sync::atomic::{AtomicU8, Ordering};

/// Exit ranks, ordered by severity (lower nonzero value = more severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Ok = 0,
    Generic = 1,
    ParseInit = 2,
    Io = 3,
    Network = 4,
    Tls = 5,
    Auth = 6,
    Remote = 8,
}

/// Shared exit-status cell. Workers report severities into it instead of
/// calling process-exit.
#[derive(Debug, Default)]
pub struct ExitStatus {
    code: AtomicU8,
}

impl ExitStatus {
    pub fn new() -> Self {
        Self {
            code: AtomicU8::new(ExitCode::Ok as u8),
        }
    }

    /// Record a severity. The cell keeps the lowest nonzero code seen.
    pub fn report(&self, code: ExitCode) {
        let new = code as u8;
        if new == 0 {
            return;
        }
        let mut cur = self.code.load(Ordering::Relaxed);
        loop {
            if cur != 0 && cur <= new {
                return;
            }
            match self
                .code
                .compare_exchange_weak(cur, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn get(&self) -> u8 {
        self.code.load(Ordering::Relaxed)
    }
}

/// Top-level error for init/run paths that abort the whole process.
#[derive(Debug, thiserror::Error)]
pub enum GrabError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("cannot resolve URI '{0}'")]
    BadUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    Config(String),
}

impl GrabError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            GrabError::Init(_) | GrabError::Config(_) | GrabError::BadUrl(_) => ExitCode::ParseInit,
            GrabError::Io(_) => ExitCode::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_severe_code_wins() {
        let status = ExitStatus::new();
        status.report(ExitCode::Remote);
        assert_eq!(status.get(), 8);
        status.report(ExitCode::Network);
        assert_eq!(status.get(), 4);
        // A later, milder error must not clobber the severe one.
        status.report(ExitCode::Remote);
        assert_eq!(status.get(), 4);
    }

    #[test]
    fn test_ok_is_never_recorded() {
        let status = ExitStatus::new();
        status.report(ExitCode::Ok);
        assert_eq!(status.get(), 0);
        status.report(ExitCode::Io);
        status.report(ExitCode::Ok);
        assert_eq!(status.get(), 3);
    }
}
