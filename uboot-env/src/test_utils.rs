//! Stand-ins for the `fw_printenv`/`fw_setenv` tools that keep the environment in a
//! temporary directory, one file per variable.
//!
//! Tests spawning these scripts should run serially: writing an executable while
//! another thread forks can make `exec` fail with `ETXTBSY`.

use std::{
    fs,
    io::{self, ErrorKind},
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::UBootEnv;

const PRINTENV: &str = r###"#!/bin/sh
if [ -f "$VARS/$1" ]; then
    printf '%s=%s\n' "$1" "$(cat "$VARS/$1")"
else
    echo "## Error: \"$1\" not defined" >&2
    exit 1
fi
"###;

const SETENV: &str = r###"#!/bin/sh
name="$1"
shift
if [ $# -gt 0 ]; then
    printf '%s' "$*" > "$VARS/$name"
else
    rm -f "$VARS/$name"
fi
"###;

pub struct FakeFwTools {
    tempdir: TempDir,
}

impl FakeFwTools {
    pub fn new() -> io::Result<Self> {
        let tempdir = TempDir::new()?;
        let vars = tempdir.path().join("vars");
        fs::create_dir_all(&vars)?;

        let vars = vars.display().to_string();
        write_script(
            &tempdir.path().join("fw_printenv"),
            &PRINTENV.replace("$VARS", &vars),
        )?;
        write_script(
            &tempdir.path().join("fw_setenv"),
            &SETENV.replace("$VARS", &vars),
        )?;

        Ok(Self { tempdir })
    }

    pub fn printenv(&self) -> PathBuf {
        self.tempdir.path().join("fw_printenv")
    }

    pub fn setenv(&self) -> PathBuf {
        self.tempdir.path().join("fw_setenv")
    }

    pub fn env(&self) -> UBootEnv {
        UBootEnv::new(self.printenv(), self.setenv())
    }

    /// Reads a variable straight from the backing directory.
    pub fn value(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.tempdir.path().join("vars").join(name)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets a variable straight in the backing directory.
    pub fn set_value(&self, name: &str, value: &str) -> io::Result<()> {
        fs::write(self.tempdir.path().join("vars").join(name), value)
    }
}

fn write_script(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}
