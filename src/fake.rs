//! Scripted stand-ins for the serial console and the SSH transport, used to
//! run the driver, the upgrade client and the coordinator without hardware.

use std::{
    collections::VecDeque,
    io,
    net::IpAddr,
    path::Path,
    sync::{Arc, Mutex},
};

use crate::{
    boot_driver::SerialSession,
    error::{Error, Result},
    signal::CancelFlag,
    upgrade::{CommandOutput, UpgradeTransport},
};

// FakeSession =================================================================

/// Everything written to a [`FakeSession`], one entry per write.
#[derive(Clone, Default)]
pub(crate) struct Writes(Arc<Mutex<Vec<Vec<u8>>>>);

impl Writes {
    pub fn all(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }

    pub fn text(&self) -> Vec<String> {
        self.all()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Number of writes equal to `bytes`.
    pub fn count(&self, bytes: &[u8]) -> usize {
        self.0.lock().unwrap().iter().filter(|w| *w == bytes).count()
    }
}

/// A console that plays back a script, one entry per read.
///
/// Once the script is exhausted the session reports itself closed, unless it
/// was made [`idle`](Self::idle), in which case reads keep timing out.
pub(crate) struct FakeSession {
    script: VecDeque<String>,
    writes: Writes,
    idle: bool,
    cancel_after: Option<(usize, CancelFlag)>,
}

impl FakeSession {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FakeSession {
            script: script.into_iter().map(Into::into).collect(),
            writes: Writes::default(),
            idle: false,
            cancel_after: None,
        }
    }

    pub fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    /// Raises `cancel` once `writes` writes have been made.
    pub fn cancelling_after(mut self, writes: usize, cancel: &CancelFlag) -> Self {
        self.cancel_after = Some((writes, cancel.clone()));
        self
    }

    pub fn writes(&self) -> Writes {
        self.writes.clone()
    }
}

impl SerialSession for FakeSession {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.script.pop_front() {
            Some(line) => Ok(Some(line)),
            None if self.idle => Ok(Some(String::new())),
            None => Ok(None),
        }
    }

    fn bytes_waiting(&mut self) -> io::Result<usize> {
        match self.script.front() {
            Some(line) => Ok(line.len()),
            None if self.idle => Ok(0),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "script exhausted",
            )),
        }
    }

    fn read_available(&mut self) -> io::Result<String> {
        Ok(self.script.pop_front().unwrap_or_default())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut writes = self.writes.0.lock().unwrap();
        writes.push(bytes.to_vec());
        if let Some((after, cancel)) = &self.cancel_after {
            if writes.len() >= *after {
                cancel.cancel();
            }
        }
        Ok(())
    }
}

// FakeTransport ===============================================================

/// Calls made on a [`FakeTransport`], e.g. `connect 192.168.1.254`.
#[derive(Clone, Default)]
pub(crate) struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// First word of every call, in order.
    pub fn names(&self) -> Vec<String> {
        self.all()
            .iter()
            .map(|c| c.split_whitespace().next().unwrap_or_default().to_string())
            .collect()
    }

    fn push(&self, call: String) {
        self.0.lock().unwrap().push(call);
    }
}

/// An SSH transport answering every command with a canned `stderr`.
pub(crate) struct FakeTransport {
    calls: Calls,
    stderr: String,
    refuse_connection: bool,
    cancel_on_connect: bool,
}

impl FakeTransport {
    pub fn new(stderr: impl Into<String>) -> Self {
        FakeTransport {
            calls: Calls::default(),
            stderr: stderr.into(),
            refuse_connection: false,
            cancel_on_connect: false,
        }
    }

    pub fn refusing_connection(mut self) -> Self {
        self.refuse_connection = true;
        self
    }

    /// Raises the flag handed to `connect`, as an operator would mid-connect.
    pub fn cancelling_on_connect(mut self) -> Self {
        self.cancel_on_connect = true;
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl UpgradeTransport for FakeTransport {
    fn connect(&mut self, host: IpAddr, cancel: &CancelFlag) -> Result<()> {
        self.calls.push(format!("connect {}", host));
        if self.cancel_on_connect {
            cancel.cancel();
        }
        if self.refuse_connection {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        self.calls
            .push(format!("upload {} {}", local.display(), remote));
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        self.calls.push(format!("exec {}", command));
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: self.stderr.clone(),
            exit_status: None,
        })
    }

    fn close(&mut self) {
        self.calls.push("close".to_string());
    }
}
