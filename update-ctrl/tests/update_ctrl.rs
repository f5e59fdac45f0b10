use update_ctrl::{
    ExitStatus, RebootState, ResultCode, UpdateKind, Version,
    console::SerialConsole,
    test_utils::{FakeFailure, Fixture},
    workflow::{Marker, UPDATE_LOCATION},
};

fn code(status: color_eyre::Result<ExitStatus>) -> u8 {
    match status.unwrap() {
        ExitStatus::Code(code) => code.code(),
        other => panic!("expected a result code, got {other:?}"),
    }
}

#[test]
fn it_updates_firmware() {
    let fx = Fixture::builder().build();
    assert_eq!(code(fx.run("update --firmware /media/fw.raucb")), 0);
    assert_eq!(fx.store.state(), RebootState::IncompleteFw);
    assert_eq!(fx.engine.applied(), [UpdateKind::Firmware]);
}

#[test]
fn it_updates_firmware_and_application_together() {
    let fx = Fixture::builder().build();
    assert_eq!(
        code(fx.run("update --firmware /media/fw.raucb --application /media/app.raucb")),
        16
    );
    assert_eq!(fx.store.state(), RebootState::IncompleteBoth);
}

#[test]
fn it_reports_pending_updates_as_progress_errors() {
    let fx = Fixture::builder().state(RebootState::IncompleteApp).build();
    assert_eq!(code(fx.run("update --application /media/app.raucb")), 9);
    assert_eq!(fx.store.state(), RebootState::IncompleteApp);
    assert!(fx.engine.applied().is_empty());
}

#[test]
fn it_refuses_updates_without_packages() {
    let fx = Fixture::builder().build();
    assert!(fx.run("update").is_err());
}

#[test]
fn it_commits_idempotently() {
    let fx = Fixture::builder().state(RebootState::IncompleteFw).build();
    assert_eq!(code(fx.run("commit")), 20);
    assert_eq!(fx.store.state(), RebootState::NoPending);

    let writes = fx.store.writes();
    assert_eq!(code(fx.run("commit")), 21);
    assert_eq!(fx.store.writes(), writes);
}

#[test]
fn it_reports_commits_before_reboot_as_reboot_pending() {
    let fx = Fixture::builder()
        .state(RebootState::IncompleteBoth)
        .reboot_complete(false)
        .build();
    assert_eq!(code(fx.run("commit")), ResultCode::FwRebootPending.code());

    let fx = Fixture::builder()
        .state(RebootState::IncompleteApp)
        .reboot_complete(false)
        .build();
    assert_eq!(code(fx.run("commit")), ResultCode::AppRebootPending.code());
    assert_eq!(fx.store.state(), RebootState::IncompleteApp);
}

#[test]
fn it_reports_unknown_reboot_states_on_commit() {
    let fx = Fixture::builder().build();
    fx.store.set_unknown("77");
    assert_eq!(code(fx.run("commit")), 22);
}

#[test]
fn it_clears_the_work_dir_when_fully_committed() {
    let fx = Fixture::builder().state(RebootState::IncompleteFw).build();
    fx.announce("firmware", 3, 1000);
    fx.write(UPDATE_LOCATION, "update.raucb");
    fx.write(Marker::Installed.file_name(), "");
    fx.write(Marker::Apply.file_name(), "");

    assert_eq!(code(fx.run("commit")), 20);
    assert!(!fx.has(Marker::Installed));
    assert!(!fx.has(Marker::Apply));
    assert!(!fx.path(UPDATE_LOCATION).exists());
    assert_eq!(code(fx.run("available")), 53);
}

#[test]
fn it_refuses_rollback_without_incomplete_update() {
    let fx = Fixture::builder().build();
    assert_eq!(
        code(fx.run("rollback firmware")),
        ResultCode::FwRollbackProgressError.code()
    );
    assert_eq!(fx.store.state(), RebootState::NoPending);
    assert_eq!(fx.store.writes(), 0);
    assert!(!fx.has(Marker::Rollback));
}

#[test]
fn it_rolls_back_and_reboots_through_apply() {
    let fx = Fixture::builder().state(RebootState::IncompleteApp).build();
    assert_eq!(code(fx.run("rollback app")), 12);
    assert_eq!(fx.store.state(), RebootState::RollbackAppPending);
    assert!(fx.has(Marker::Rollback));

    assert_eq!(code(fx.run("apply")), 67);
    assert_eq!(fx.reboot.calls(), 1);
    assert_eq!(fx.store.state(), RebootState::IncompleteAppRollback);
    assert!(!fx.has(Marker::Rollback));

    assert_eq!(code(fx.run("commit")), 20);
    assert_eq!(fx.store.state(), RebootState::NoPending);
}

#[test]
fn it_restores_the_rollback_state_when_reboot_fails() {
    let fx = Fixture::builder()
        .state(RebootState::IncompleteFw)
        .reboot_errno(libc::EPERM)
        .build();
    assert_eq!(code(fx.run("rollback fw")), 4);

    let status = fx.run("apply").unwrap();
    assert_eq!(status, ExitStatus::SystemError(libc::EPERM));
    assert_eq!(fx.store.state(), RebootState::RollbackFwPending);
    assert!(fx.has(Marker::Rollback));
}

#[test]
fn it_keeps_track_of_firmware_switched_by_a_failed_combined_rollback() {
    let fx = Fixture::builder().state(RebootState::IncompleteBoth).build();
    fx.engine
        .fail_rollback(UpdateKind::Application, FakeFailure::Rejected(1));

    assert_eq!(code(fx.run("rollback both")), 6);
    assert_eq!(fx.engine.rolled_back(), [UpdateKind::Firmware]);
    assert_eq!(fx.store.state(), RebootState::RollbackFwPending);
    assert!(fx.has(Marker::Rollback));
}

#[test]
fn it_switches_slots_of_committed_systems() {
    let fx = Fixture::builder().build();
    assert_eq!(code(fx.run("switch-slot app")), 12);
    assert_eq!(fx.store.state(), RebootState::RollbackAppPending);
    assert_eq!(fx.engine.rolled_back(), [UpdateKind::Application]);

    assert_eq!(code(fx.run("switch-slot fw")), 5);
}

#[test]
fn it_reports_the_reboot_state() {
    let fx = Fixture::builder().state(RebootState::FailedApp).build();
    assert_eq!(code(fx.run("state")), 24);

    let fx = Fixture::builder()
        .state(RebootState::IncompleteApp)
        .reboot_complete(false)
        .build();
    assert_eq!(code(fx.run("state")), 31);

    let fx = Fixture::builder().state(RebootState::IncompleteApp).build();
    assert_eq!(code(fx.run("state")), 28);
}

#[test]
fn it_gates_automatic_updates_on_former_failures() {
    let fx = Fixture::builder().state(RebootState::FailedFw).build();
    assert_eq!(
        code(fx.run(
            "automatic --update-stick /media/usb --firmware-file fw.raucb --fw-version 9"
        )),
        51
    );
    assert_eq!(fx.store.state(), RebootState::NoPending);
    assert!(fx.engine.applied().is_empty());
}

#[test]
fn it_updates_automatically_only_to_newer_versions() {
    let fx = Fixture::builder()
        .fw_version(Version(5))
        .app_version(Version(5))
        .build();

    let cmd = "automatic --update-stick /media/usb --application-file /app.raucb \
               --app-version 5";
    assert_eq!(code(fx.run(cmd)), 41);
    assert!(fx.engine.applied().is_empty());
    assert_eq!(fx.store.state(), RebootState::NoPending);

    let cmd = "automatic --update-stick /media/usb --application-file /app.raucb \
               --app-version 6";
    assert_eq!(code(fx.run(cmd)), 41);
    assert_eq!(fx.store.state(), RebootState::IncompleteApp);
    assert_eq!(
        fx.engine.packages()[0].path,
        std::path::Path::new("/media/usb/app.raucb")
    );
}

#[test]
fn it_reports_automatic_updates_on_the_serial_console() {
    let fx = Fixture::builder()
        .state(RebootState::FailedFw)
        .app_version(Version(5))
        .build();
    fx.write("ttymxc0", "");
    let console = SerialConsole::open(&fx.path("ttymxc0")).unwrap();

    let cmd = "automatic --update-stick /media/usb --application-file /app.raucb \
               --app-version 5";
    fx.run_on_console(cmd, &console).unwrap();
    fx.run_on_console(cmd, &console).unwrap();

    let written = std::fs::read_to_string(fx.path("ttymxc0")).unwrap();
    let lines: Vec<_> = written.lines().collect();
    assert_eq!(
        lines,
        [
            "Automatic update not allowed: FormerFwUpdateFailed",
            "Application is up to date",
        ]
    );
}

#[test]
fn it_resolves_incomplete_rollbacks_before_automatic_updates() {
    let fx = Fixture::builder()
        .state(RebootState::RollbackBothPending)
        .build();
    let cmd = "automatic --update-stick /media/usb --firmware-file fw.raucb \
               --fw-version 2 --application-file app.raucb --app-version 2";
    assert_eq!(code(fx.run(cmd)), 45);
    assert_eq!(fx.store.state(), RebootState::IncompleteBoth);
    assert_eq!(
        fx.engine.applied(),
        [UpdateKind::Firmware, UpdateKind::Application]
    );
}

#[test]
fn it_reports_announced_updates() {
    let fx = Fixture::builder().build();
    fx.write(Marker::Download.file_name(), "");
    assert_eq!(code(fx.run("available")), 53);

    fx.announce("app", 12, 4096);
    assert_eq!(code(fx.run("available")), 55);
    fx.announce("common", 12, 4096);
    assert_eq!(code(fx.run("available")), 56);
}

#[test]
fn it_rejects_malformed_descriptors() {
    let fx = Fixture::builder().build();
    fx.announce("kernel", 1, 10);
    assert!(fx.run("available").is_err());
}

#[test]
fn it_requests_the_download_once() {
    let fx = Fixture::builder().build();
    assert_eq!(code(fx.run("download")), 57);
    assert!(!fx.has(Marker::Download));

    fx.announce("firmware", 2, 1000);
    assert_eq!(code(fx.run("download")), 58);
    assert_eq!(code(fx.run("download")), 59);

    let markers = std::fs::read_dir(fx.work_dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name() == "downloadUpdate")
        .count();
    assert_eq!(markers, 1);
}

#[test]
fn it_reports_download_progress() {
    let fx = Fixture::builder().build();
    fx.announce("firmware", 2, 1000);
    fx.write(UPDATE_LOCATION, fx.path("update.raucb").to_str().unwrap());
    fx.write("update.raucb", vec![0u8; 500]);
    // no download requested
    assert_eq!(code(fx.run("progress")), 60);

    fx.write(Marker::Download.file_name(), "");
    assert_eq!(code(fx.run("progress")), 61);

    fx.write("update.raucb", vec![0u8; 1000]);
    assert_eq!(code(fx.run("progress")), 62);
}

#[test]
fn it_resolves_relative_download_locations() {
    let fx = Fixture::builder().build();
    fx.announce("firmware", 2, 1000);
    fx.write(Marker::Download.file_name(), "");
    fx.write(UPDATE_LOCATION, "update.raucb");

    // not created yet
    assert_eq!(code(fx.run("progress")), 60);

    fx.write("update.raucb", vec![0u8; 10]);
    assert_eq!(code(fx.run("progress")), 61);
}

#[test]
fn it_waits_for_the_download_location() {
    let fx = Fixture::builder()
        .poll_attempts(3)
        .poll_interval(std::time::Duration::from_millis(10))
        .build();
    fx.announce("firmware", 2, 1000);
    fx.write(Marker::Download.file_name(), "");

    assert_eq!(code(fx.run("progress")), 60);
}

#[test]
fn it_waits_while_the_download_location_is_empty() {
    let fx = Fixture::builder().build();
    fx.announce("firmware", 2, 1000);
    fx.write(Marker::Download.file_name(), "");
    fx.write(UPDATE_LOCATION, "");

    assert_eq!(code(fx.run("progress")), 60);
    assert_eq!(code(fx.run("install")), 63);
}

#[test]
fn it_queues_the_installation() {
    let fx = Fixture::builder().build();
    assert_eq!(code(fx.run("install")), 63);

    fx.write(UPDATE_LOCATION, "update.raucb");
    assert_eq!(code(fx.run("install")), 64);
    assert!(fx.has(Marker::Install));
    assert_eq!(code(fx.run("install")), 64);

    fx.write(Marker::Installed.file_name(), "");
    assert_eq!(code(fx.run("install")), 65);
}

#[test]
fn it_has_nothing_to_apply_before_installation() {
    let fx = Fixture::builder().build();
    assert_eq!(code(fx.run("apply")), 68);
    assert_eq!(fx.reboot.calls(), 0);
}

#[test]
fn it_reboots_local_installations() {
    let fx = Fixture::builder().build();
    fx.write(Marker::Installed.file_name(), "");

    assert_eq!(code(fx.run("apply")), 67);
    assert_eq!(fx.reboot.calls(), 1);
    assert!(!fx.has(Marker::Apply));
}

#[test]
fn it_passes_through_reboot_errors_of_local_installations() {
    let fx = Fixture::builder()
        .state(RebootState::IncompleteFw)
        .reboot_errno(libc::EBUSY)
        .build();
    fx.write(Marker::Installed.file_name(), "");

    let status = fx.run("apply").unwrap();
    assert_eq!(status, ExitStatus::SystemError(libc::EBUSY));
    assert_eq!(fx.reboot.calls(), 1);
    assert_eq!(fx.store.state(), RebootState::IncompleteFw);
    assert_eq!(fx.store.writes(), 0);
}

#[test]
fn it_leaves_networked_reboots_to_the_supervisor() {
    let fx = Fixture::builder().build();
    fx.write(Marker::Download.file_name(), "");
    fx.write(Marker::Installed.file_name(), "");

    assert_eq!(code(fx.run("apply")), 67);
    assert!(fx.has(Marker::Apply));
    assert_eq!(code(fx.run("apply")), 67);
    assert_eq!(fx.reboot.calls(), 0);
}

#[test]
fn it_marks_slots_bad() {
    let fx = Fixture::builder().build();
    assert_eq!(code(fx.run("is-bad app b")), 69);
    assert_eq!(code(fx.run("mark-bad app B")), 69);
    assert_eq!(code(fx.run("is-bad app 1")), 71);
    assert_eq!(code(fx.run("is-bad fw B")), 69);

    assert_eq!(code(fx.run("mark-bad fw C")), 70);
    assert_eq!(code(fx.run("mark-bad common A")), 70);
}

#[test]
fn it_prints_versions() {
    let fx = Fixture::builder().fw_version(Version(20250101)).build();
    assert_eq!(fx.run("versions").unwrap(), ExitStatus::Success);
    assert_eq!(fx.run("versions fw").unwrap(), ExitStatus::Success);
}
