//! Read and write U-Boot environment variables.
//!
//! The environment is accessed through the `fw_printenv` and `fw_setenv` tools from
//! `u-boot-tools`, which know where the environment lives on the device (and
//! handle redundant copies and CRCs for us).

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use tracing::debug;

pub mod test_utils;

pub const DEFAULT_PRINTENV: &str = "fw_printenv";
pub const DEFAULT_SETENV: &str = "fw_setenv";

/// Error definition for library.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid environment variable name `{0}`")]
    InvalidName(String),
    #[error("failed to run `{tool}`: {source}")]
    Spawn {
        tool: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{tool}` exited with {status}: {stderr}")]
    Tool {
        tool: PathBuf,
        status: i32,
        stderr: String,
    },
    #[error("unexpected output of `{tool}` for `{name}`: {output}")]
    MalformedOutput {
        tool: PathBuf,
        name: String,
        output: String,
    },
}

impl Error {
    /// The OS error number behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Spawn { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle to the U-Boot environment of the running system.
#[derive(Debug, Clone)]
pub struct UBootEnv {
    printenv: PathBuf,
    setenv: PathBuf,
}

impl Default for UBootEnv {
    fn default() -> Self {
        Self::new(DEFAULT_PRINTENV, DEFAULT_SETENV)
    }
}

impl UBootEnv {
    pub fn new(printenv: impl Into<PathBuf>, setenv: impl Into<PathBuf>) -> Self {
        Self {
            printenv: printenv.into(),
            setenv: setenv.into(),
        }
    }

    pub fn get_var(&self, name: &str) -> Result<EnvVar<'_>> {
        if name.is_empty()
            || name.contains('=')
            || name.chars().any(char::is_whitespace)
        {
            return Err(Error::InvalidName(name.to_owned()));
        }

        Ok(EnvVar {
            env: self,
            name: name.to_owned(),
        })
    }

    fn run<I, S>(&self, tool: &Path, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(tool)
            .args(args)
            .output()
            .map_err(|source| Error::Spawn {
                tool: tool.to_owned(),
                source,
            })
    }
}

/// A single variable of the U-Boot environment.
pub struct EnvVar<'a> {
    env: &'a UBootEnv,
    name: String,
}

impl EnvVar<'_> {
    /// Reads the variable. Returns `None` if it is not defined.
    pub fn read(&self) -> Result<Option<String>> {
        let tool = &self.env.printenv;
        let output = self.env.run(tool, [&self.name])?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            // fw_printenv reports `## Error: "<name>" not defined` for unset vars.
            if stderr.contains("not defined") {
                debug!("u-boot variable `{}` is not defined", self.name);
                return Ok(None);
            }

            return Err(Error::Tool {
                tool: tool.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_printenv_line(&self.name, &stdout)
            .map(|value| Some(value.to_owned()))
            .ok_or_else(|| Error::MalformedOutput {
                tool: tool.clone(),
                name: self.name.clone(),
                output: stdout.trim().to_owned(),
            })
    }

    /// Sets the variable, creating it if needed.
    pub fn write(&self, value: &str) -> Result<()> {
        debug!("setting u-boot variable `{}={value}`", self.name);
        self.set(Some(value))
    }

    /// Deletes the variable from the environment. Deleting an unset variable is fine.
    pub fn remove(&self) -> Result<()> {
        debug!("removing u-boot variable `{}`", self.name);
        self.set(None)
    }

    fn set(&self, value: Option<&str>) -> Result<()> {
        let tool = &self.env.setenv;
        let mut args = vec![self.name.as_str()];
        args.extend(value);

        let output = self.env.run(tool, args)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Tool {
                tool: tool.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

/// Extracts the value from a `name=value` line as printed by `fw_printenv <name>`.
fn parse_printenv_line<'a>(name: &str, stdout: &'a str) -> Option<&'a str> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix('='))
        .map(str::trim_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeFwTools;
    use serial_test::serial;

    #[test]
    fn it_parses_printenv_lines() {
        assert_eq!(parse_printenv_line("foo", "foo=bar\n"), Some("bar"));
        assert_eq!(parse_printenv_line("foo", "foo=\n"), Some(""));
        assert_eq!(parse_printenv_line("foo", "foo=a=b\n"), Some("a=b"));
        assert_eq!(
            parse_printenv_line("BOOT_ORDER", "BOOT_ORDER=A B\n"),
            Some("A B")
        );
        assert_eq!(parse_printenv_line("foo", "foobar=1\n"), None);
        assert_eq!(parse_printenv_line("foo", ""), None);
    }

    #[test]
    fn it_rejects_invalid_names() {
        let env = UBootEnv::default();
        assert!(matches!(env.get_var(""), Err(Error::InvalidName(_))));
        assert!(matches!(env.get_var("a=b"), Err(Error::InvalidName(_))));
        assert!(matches!(env.get_var("a b"), Err(Error::InvalidName(_))));
        assert!(env.get_var("update_reboot_state").is_ok());
    }

    #[test]
    #[serial]
    fn it_reads_writes_and_removes_vars() -> color_eyre::Result<()> {
        let tools = FakeFwTools::new()?;
        let env = tools.env();
        let var = env.get_var("update_reboot_state")?;

        assert_eq!(var.read()?, None);

        var.write("3")?;
        assert_eq!(var.read()?, Some("3".to_owned()));
        assert_eq!(tools.value("update_reboot_state")?, Some("3".to_owned()));

        var.remove()?;
        assert_eq!(var.read()?, None);
        // removing twice is fine
        var.remove()?;

        Ok(())
    }

    #[test]
    fn it_reports_missing_tools() {
        let env = UBootEnv::new("/nonexistent/fw_printenv", "/nonexistent/fw_setenv");
        let err = env.get_var("foo").unwrap().read().unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(err.raw_os_error(), Some(2));
    }
}
