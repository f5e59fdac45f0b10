//! The serial console of the device.
//!
//! Automatic updates are started by the automounter without a terminal, so their
//! messages and errors also go to the console named in the bootloader environment.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::debug;
use tracing_subscriber::fmt::{MakeWriter, writer::MutexGuardWriter};
use uboot_env::UBootEnv;

use crate::{Error, Result};

/// U-Boot variable naming the kernel console, e.g. `console=ttymxc0,115200`.
pub const CONSOLE_VAR: &str = "console";

/// The device node of a console setting: `console=ttymxc0,115200` → `/dev/ttymxc0`.
pub fn device(setting: &str) -> Option<PathBuf> {
    let name = setting.rsplit('=').next()?.split(',').next()?.trim();
    (!name.is_empty()).then(|| Path::new("/dev").join(name))
}

/// Shared handle to the console, usable as a [`MakeWriter`] for log output.
#[derive(Debug, Clone)]
pub struct SerialConsole(Arc<Mutex<File>>);

impl SerialConsole {
    /// Opens the console configured in the bootloader environment.
    pub fn from_env(env: &UBootEnv) -> Result<Self> {
        let setting = env.get_var(CONSOLE_VAR)?.read()?.ok_or_else(|| {
            Error::InvalidParameter(format!("`{CONSOLE_VAR}` is not set"))
        })?;
        let path = device(&setting).ok_or_else(|| {
            Error::InvalidParameter(format!("no console device in `{setting}`"))
        })?;

        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(Error::io(format!("failed opening `{}`", path.display())))?;
        debug!("writing messages to serial console `{}`", path.display());

        Ok(Self(Arc::new(Mutex::new(file))))
    }

    /// Writes one line, as is.
    pub fn write_line(&self, line: &str) {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let written: io::Result<()> =
            writeln!(file, "{line}").and_then(|()| file.flush());
        if let Err(e) = written {
            debug!("failed writing to the serial console: {e}");
        }
    }
}

impl<'a> MakeWriter<'a> for SerialConsole {
    type Writer = MutexGuardWriter<'a, File>;

    fn make_writer(&'a self) -> Self::Writer {
        MakeWriter::make_writer(&*self.0)
    }
}
