use std::ffi::OsStr;
use std::process::{Command, Stdio};

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    configure_for_background(&mut cmd);
    cmd
}

/// Asks the process to exit. The caller escalates to `Child::kill` if it lingers.
pub fn request_terminate(pid: u32) -> bool {
    let pid = pid.to_string();

    #[cfg(windows)]
    let status = command("taskkill").args(["/PID", &pid, "/T"]).status();

    #[cfg(not(windows))]
    let status = command("kill").args(["-TERM", &pid]).status();

    matches!(status, Ok(s) if s.success())
}

pub fn kill_child_process_tree(child: &mut std::process::Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}
