//! Minimal PID-1 harness for running the end-to-end tests inside a VM:
//! mounts devtmpfs, sysfs and a tmpfs, execs the test binary baked into
//! the image at /zfsdev.test, records the outcome and powers off.

use std::fs::{self, File};
use std::process::Command;

use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};

const NO_DATA: Option<&str> = None;

fn power_off() -> ! {
    let _ = reboot(RebootMode::RB_POWER_OFF);
    std::process::exit(1);
}

fn mount_special(fstype: &str, path: &str, flags: MsFlags) {
    if let Err(err) = fs::create_dir_all(path) {
        eprintln!("failed to create mount point {path}: {err}");
        power_off();
    }
    if let Err(err) = mount(Some(fstype), path, Some(fstype), flags, NO_DATA) {
        eprintln!("failed to mount {fstype} on {path}: {err}");
        power_off();
    }
}

fn main() {
    if std::process::id() != 1 {
        eprintln!("testinit is a PID-1 harness, refusing to run elsewhere");
        return;
    }

    if let Err(err) = fs::create_dir_all("/dev") {
        eprintln!("failed to create /dev: {err}");
        power_off();
    }
    if let Err(err) = mount(
        Some("none"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::MS_NOSUID,
        NO_DATA,
    ) {
        eprintln!("failed to mount /dev: {err}");
        power_off();
    }
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount_special("tmpfs", "/dev/shm", flags);
    mount_special("sysfs", "/sys", flags);

    match Command::new("/zfsdev.test").status() {
        Ok(status) if status.success() => {
            if let Err(err) = File::create("/successful") {
                eprintln!("failed to record test status: {err}");
            }
        }
        Ok(status) => eprintln!("tests failed: {status}"),
        Err(err) => eprintln!("failed to run tests: {err}"),
    }
    power_off();
}
