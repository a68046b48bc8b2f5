use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("child process already taken")]
    ChildTaken,
}

/// Pseudo-terminal master plus the child process spawned on its slave side.
///
/// The slave end is dropped right after spawning so the master reader sees
/// EOF once the child (and anything it forked) closes the terminal.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl Pty {
    pub fn spawn(rows: u16, cols: u16, cmd: CommandBuilder) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size(rows, cols))
            .map_err(PtyError::OpenPty)?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(PtyError::SpawnCommand)?;
        drop(pair.slave);

        let pid = child.process_id();
        Ok(Self {
            master: pair.master,
            child: Some(child),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child for a dedicated wait task.
    pub fn take_child(&mut self) -> Result<Box<dyn Child + Send + Sync>, PtyError> {
        self.child.take().ok_or(PtyError::ChildTaken)
    }

    /// A killer usable after the child has been moved into a wait task.
    pub fn clone_killer(&self) -> Option<Box<dyn ChildKiller + Send + Sync>> {
        self.child.as_ref().map(|c| c.clone_killer())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(size(rows, cols))
            .map_err(PtyError::Resize)
    }
}

fn size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
