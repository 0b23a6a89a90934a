//! How the bridge was started: by hand, or by an IDE expecting an OpenOCD.
//!
//! IDE integrations launch the debug server like OpenOCD and pass the GDB port
//! as an OpenOCD command (`-c "gdb_port 50000"`). They then wait for OpenOCD's
//! log lines before starting GDB, so in that mode the bridge prints the same
//! lines.

use std::process::{Child, Command, Stdio};

use super::BridgeError;

/// The OpenOCD command carrying the GDB port.
const GDB_PORT_COMMAND: &str = "gdb_port";

/// Startup protocol of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupMode {
    /// Plain operation with human-readable status output.
    #[default]
    Plain,
    /// OpenOCD emulation for IDE integrations.
    Emulation,
}

impl StartupMode {
    /// Lines printed once the bridge listens on `port`.
    pub fn banners(self, port: u16) -> Vec<String> {
        match self {
            StartupMode::Plain => Vec::new(),
            StartupMode::Emulation => vec![
                "Info : dw-link.cpu: debugWIRE adapter ready".to_string(),
                format!("Info : Listening on port {port} for gdb connections"),
            ],
        }
    }
}

/// Looks for an OpenOCD `gdb_port N` command in the arguments.
///
/// The command may be one argument (`"gdb_port 50000"`), be split over two, or
/// be one of several `;`-separated commands.
pub fn emulation_port<S: AsRef<str>>(args: &[S]) -> Option<u16> {
    let mut tokens = args
        .iter()
        .flat_map(|arg| arg.as_ref().split(|c: char| c.is_whitespace() || c == ';'))
        .filter(|token| !token.is_empty());

    while let Some(token) = tokens.next() {
        if token == GDB_PORT_COMMAND {
            return tokens.next().and_then(|port| port.parse().ok());
        }
    }

    None
}

/// A program started next to the bridge, typically a GDB front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionCommand {
    program: String,
    args: Vec<String>,
}

impl CompanionCommand {
    /// Splits a shell-style command line.
    pub fn parse(line: &str) -> Result<Self, BridgeError> {
        let mut words = shlex::split(line)
            .ok_or_else(|| BridgeError::InvalidCompanion(line.to_string()))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| BridgeError::InvalidCompanion(line.to_string()))?;

        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    /// The program to run.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Its arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Starts the program without waiting for it.
    pub fn spawn(&self) -> Result<Companion, BridgeError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| BridgeError::Companion {
                program: self.program.clone(),
                source,
            })?;

        Ok(Companion { child })
    }
}

/// A running companion program.
#[derive(Debug)]
pub struct Companion {
    child: Child,
}

impl Companion {
    /// Process id of the companion.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Returns `true` once the companion has terminated.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}
