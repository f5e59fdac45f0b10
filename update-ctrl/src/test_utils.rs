//! In-memory fakes of the external interfaces, and a [`Fixture`] wiring them to a
//! temporary work directory.

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bon::bon;
use clap::Parser;
use tempfile::TempDir;

use crate::{
    BootStateStore, EngineError, Error, ExitStatus, Package, RebootState, Result,
    Slot, StagedWorkflow, UpdateCtrl, UpdateEngine, UpdateKind, Version, WorkDir,
    console::SerialConsole,
    program::{self, Cli},
    workflow::{Marker, Reboot},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct BootState {
    state: RebootState,
    /// Raw value that does not parse as a reboot state.
    unknown: Option<String>,
    reboot_complete: bool,
    writes: usize,
    /// Writes accepted before every further write fails.
    write_budget: Option<usize>,
    bad_slots: HashSet<(UpdateKind, Slot)>,
}

/// [`BootStateStore`] in memory. Clones share their state.
#[derive(Debug, Clone)]
pub struct FakeBootState(Arc<Mutex<BootState>>);

impl FakeBootState {
    pub fn new(state: RebootState) -> Self {
        Self(Arc::new(Mutex::new(BootState {
            state,
            unknown: None,
            reboot_complete: true,
            writes: 0,
            write_budget: None,
            bad_slots: HashSet::new(),
        })))
    }

    pub fn state(&self) -> RebootState {
        lock(&self.0).state
    }

    /// Number of `set_reboot_state` calls.
    pub fn writes(&self) -> usize {
        lock(&self.0).writes
    }

    pub fn set_reboot_complete(&self, complete: bool) {
        lock(&self.0).reboot_complete = complete;
    }

    pub fn set_unknown(&self, value: &str) {
        lock(&self.0).unknown = Some(value.to_owned());
    }

    /// Lets `writes` more writes succeed, then fails every write with `EROFS`.
    pub fn fail_writes_after(&self, writes: usize) {
        let mut inner = lock(&self.0);
        inner.write_budget = Some(inner.writes + writes);
    }
}

impl BootStateStore for FakeBootState {
    fn get_reboot_state(&self) -> Result<RebootState> {
        let inner = lock(&self.0);
        match &inner.unknown {
            Some(value) => Err(Error::UnknownRebootState(value.clone())),
            None => Ok(inner.state),
        }
    }

    fn set_reboot_state(&self, state: RebootState) -> Result<()> {
        let mut inner = lock(&self.0);
        if inner.write_budget.is_some_and(|budget| inner.writes >= budget) {
            return Err(Error::io(format!("failed writing `{state}`"))(
                io::Error::from_raw_os_error(libc::EROFS),
            ));
        }
        inner.state = state;
        inner.unknown = None;
        inner.writes += 1;
        Ok(())
    }

    fn is_reboot_complete(&self, _includes_firmware: bool) -> Result<bool> {
        Ok(lock(&self.0).reboot_complete)
    }

    fn mark_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<()> {
        if kind == UpdateKind::Combined {
            return Err(Error::InvalidParameter("combined slot".to_owned()));
        }
        lock(&self.0).bad_slots.insert((kind, slot));
        Ok(())
    }

    fn is_slot_bad(&self, kind: UpdateKind, slot: Slot) -> Result<bool> {
        if kind == UpdateKind::Combined {
            return Err(Error::InvalidParameter("combined slot".to_owned()));
        }
        Ok(lock(&self.0).bad_slots.contains(&(kind, slot)))
    }
}

/// Failure injected into the [`FakeEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    InProgress,
    Rejected(i32),
    System(i32),
}

impl FakeFailure {
    fn to_error(self, kind: UpdateKind) -> EngineError {
        match self {
            FakeFailure::InProgress => EngineError::InProgress,
            FakeFailure::Rejected(code) => EngineError::Rejected {
                kind,
                code,
                detail: "rejected by fake engine".to_owned(),
            },
            FakeFailure::System(errno) => EngineError::System {
                context: "fake engine".to_owned(),
                source: io::Error::from_raw_os_error(errno),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Engine {
    applied: Vec<UpdateKind>,
    packages: Vec<Package>,
    rolled_back: Vec<UpdateKind>,
    versions: HashMap<UpdateKind, Version>,
    apply_failures: HashMap<UpdateKind, FakeFailure>,
    rollback_failures: HashMap<UpdateKind, FakeFailure>,
}

/// [`UpdateEngine`] recording its calls. Clones share their state.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine(Arc<Mutex<Engine>>);

impl FakeEngine {
    pub fn applied(&self) -> Vec<UpdateKind> {
        lock(&self.0).applied.clone()
    }

    pub fn packages(&self) -> Vec<Package> {
        lock(&self.0).packages.clone()
    }

    pub fn rolled_back(&self) -> Vec<UpdateKind> {
        lock(&self.0).rolled_back.clone()
    }

    pub fn set_version(&self, kind: UpdateKind, version: Version) {
        lock(&self.0).versions.insert(kind, version);
    }

    pub fn fail_apply(&self, kind: UpdateKind, failure: FakeFailure) {
        lock(&self.0).apply_failures.insert(kind, failure);
    }

    pub fn fail_rollback(&self, kind: UpdateKind, failure: FakeFailure) {
        lock(&self.0).rollback_failures.insert(kind, failure);
    }
}

impl UpdateEngine for FakeEngine {
    fn apply(
        &self,
        kind: UpdateKind,
        package: &Package,
    ) -> std::result::Result<(), EngineError> {
        let mut inner = lock(&self.0);
        if let Some(failure) = inner.apply_failures.get(&kind) {
            return Err(failure.to_error(kind));
        }
        inner.applied.push(kind);
        inner.packages.push(package.clone());
        Ok(())
    }

    fn rollback(&self, kind: UpdateKind) -> std::result::Result<(), EngineError> {
        let mut inner = lock(&self.0);
        if let Some(failure) = inner.rollback_failures.get(&kind) {
            return Err(failure.to_error(kind));
        }
        inner.rolled_back.push(kind);
        Ok(())
    }

    fn get_version(
        &self,
        kind: UpdateKind,
    ) -> std::result::Result<Version, EngineError> {
        Ok(lock(&self.0)
            .versions
            .get(&kind)
            .copied()
            .unwrap_or(Version(0)))
    }
}

#[derive(Debug, Default)]
struct RebootCalls {
    calls: usize,
    errno: Option<i32>,
}

/// [`Reboot`] counting its calls, failing with a configured errno.
#[derive(Debug, Clone, Default)]
pub struct FakeReboot(Arc<Mutex<RebootCalls>>);

impl FakeReboot {
    pub fn failing(errno: i32) -> Self {
        Self(Arc::new(Mutex::new(RebootCalls {
            calls: 0,
            errno: Some(errno),
        })))
    }

    pub fn calls(&self) -> usize {
        lock(&self.0).calls
    }
}

impl Reboot for FakeReboot {
    fn reboot(&self) -> io::Result<()> {
        let mut inner = lock(&self.0);
        inner.calls += 1;
        match inner.errno {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

/// A Fixture with fake boot state, engine and reboot over a temporary work
/// directory. No update is pending by default and every reboot has happened.
pub struct Fixture {
    pub work_dir: TempDir,
    pub store: FakeBootState,
    pub engine: FakeEngine,
    pub reboot: FakeReboot,
    pub ctrl: UpdateCtrl<FakeBootState, FakeEngine>,
    pub workflow: StagedWorkflow<FakeBootState, FakeReboot>,
}

#[bon]
impl Fixture {
    #[builder]
    pub fn new(
        #[builder(default = RebootState::NoPending)] state: RebootState,
        #[builder(default = true)] reboot_complete: bool,
        #[builder(default = Version(0))] fw_version: Version,
        #[builder(default = Version(0))] app_version: Version,
        reboot_errno: Option<i32>,
        #[builder(default = 1)] poll_attempts: u32,
        #[builder(default = Duration::ZERO)] poll_interval: Duration,
    ) -> Fixture {
        let work_dir = TempDir::new_in("/tmp").unwrap();

        let store = FakeBootState::new(state);
        store.set_reboot_complete(reboot_complete);

        let engine = FakeEngine::default();
        engine.set_version(UpdateKind::Firmware, fw_version);
        engine.set_version(UpdateKind::Application, app_version);

        let reboot = reboot_errno.map(FakeReboot::failing).unwrap_or_default();

        let ctrl = UpdateCtrl::new(
            store.clone(),
            engine.clone(),
            WorkDir::new(work_dir.path()),
        );
        let workflow = StagedWorkflow::builder()
            .work_dir(WorkDir::new(work_dir.path()))
            .store(store.clone())
            .reboot(reboot.clone())
            .poll_attempts(poll_attempts)
            .poll_interval(poll_interval)
            .build();

        Self {
            work_dir,
            store,
            engine,
            reboot,
            ctrl,
            workflow,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.work_dir.path().join(name)
    }

    /// Writes a file into the work directory, like the delivery agent does.
    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) {
        fs::write(self.path(name), contents).unwrap();
    }

    pub fn has(&self, marker: Marker) -> bool {
        self.path(marker.file_name()).exists()
    }

    /// Announces an update through the descriptor files.
    pub fn announce(&self, kind: &str, version: u64, size: u64) {
        self.write(crate::workflow::UPDATE_TYPE, kind);
        self.write(crate::workflow::UPDATE_VERSION, version.to_string());
        self.write(crate::workflow::UPDATE_SIZE, size.to_string());
    }

    pub fn run(&self, cmd: &str) -> color_eyre::Result<ExitStatus> {
        self.run_with(cmd, None)
    }

    /// Runs `cmd` with user messages copied to `console`.
    pub fn run_on_console(
        &self,
        cmd: &str,
        console: &SerialConsole,
    ) -> color_eyre::Result<ExitStatus> {
        self.run_with(cmd, Some(console))
    }

    fn run_with(
        &self,
        cmd: &str,
        console: Option<&SerialConsole>,
    ) -> color_eyre::Result<ExitStatus> {
        let cmd: Vec<_> = cmd.split(" ").collect();
        let mut vec = Vec::from(&["update-ctrl"]);
        vec.extend_from_slice(&cmd);
        println!("{vec:?}");

        let cli = Cli::try_parse_from(&vec)?;
        program::run(&self.ctrl, &self.workflow, cli, console)
    }
}
