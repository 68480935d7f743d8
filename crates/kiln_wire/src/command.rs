//! Commands sent by the controller to a worker process.

use std::fmt;

/// How a worker should wind down when told to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Finish the test currently running, skip the rest, report, exit.
    #[default]
    Default,
    /// Same as `Default` but the worker announces `stop-on-next-test`.
    Exit,
    /// Exit as fast as possible without completing the current test.
    Kill,
}

impl ShutdownMode {
    pub fn token(self) -> &'static str {
        match self {
            ShutdownMode::Default => "default",
            ShutdownMode::Exit => "exit",
            ShutdownMode::Kill => "kill",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "default" => Some(ShutdownMode::Default),
            "exit" => Some(ShutdownMode::Exit),
            "kill" => Some(ShutdownMode::Kill),
            _ => None,
        }
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One controller → worker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Execute the named test class.
    RunClass(String),
    /// No more classes will follow for the current test set.
    TestSetFinished,
    /// Wind down according to the mode.
    Shutdown(ShutdownMode),
    /// Acknowledges the worker's `bye`; the worker may now exit.
    ByeAck,
}

impl Command {
    /// Wire opcode for this command.
    pub fn opcode(&self) -> &'static str {
        match self {
            Command::RunClass(_) => "run-class",
            Command::TestSetFinished => "testset-finished",
            Command::Shutdown(_) => "shutdown",
            Command::ByeAck => "bye-ack",
        }
    }
}
