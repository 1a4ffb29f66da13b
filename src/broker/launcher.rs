//! Spawning children on a fresh pty

use crate::broker::protocol::{LaunchRequest, TtyConfig};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// A child running on the slave side of a pty we hold the master of
#[derive(Debug)]
pub(crate) struct SpawnedChild {
    pub pid: i32,
    pub master: OwnedFd,
}

fn winsize(tty: &TtyConfig) -> Winsize {
    Winsize {
        ws_row: tty.rows,
        ws_col: tty.cols,
        ws_xpixel: tty.pixel_width,
        ws_ypixel: tty.pixel_height,
    }
}

/// Open a pty, configure it, and exec the requested program on it
///
/// Returns once exec has succeeded; a failed exec (missing or non-executable path,
/// bad working directory) comes back as the error.
pub(crate) fn spawn_on_pty(request: &LaunchRequest) -> io::Result<SpawnedChild> {
    let pty = openpty(Some(&winsize(&request.tty)), None).map_err(io::Error::from)?;

    // The master stays in the broker only.
    fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;

    let mut termios = tcgetattr(&pty.slave).map_err(io::Error::from)?;
    if request.tty.utf8 {
        termios.input_flags.insert(InputFlags::IUTF8);
    } else {
        termios.input_flags.remove(InputFlags::IUTF8);
    }
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(io::Error::from)?;

    let stdin = pty.slave.try_clone()?;
    let stdout = pty.slave.try_clone()?;
    let stderr = pty.slave;

    let mut command = Command::new(&request.executable_path);
    if let Some((arg0, args)) = request.argv.split_first() {
        command.arg0(arg0).args(args);
    }
    command
        .env_clear()
        .envs(request.environment.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if !request.working_dir.is_empty() {
        command.current_dir(&request.working_dir);
    }

    // SAFETY: only async-signal-safe calls (setsid, ioctl) run between fork and exec.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    Ok(SpawnedChild {
        pid: child.id() as i32,
        master: pty.master,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;
    use std::io::Read;

    fn read_until_eof(master: OwnedFd) -> String {
        let mut file = std::fs::File::from(master);
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                // EIO once the slave side is closed on Linux
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_child_runs_on_pty_with_requested_size() {
        let request = LaunchRequest::new("/bin/sh")
            .with_argv(["sh", "-c", "stty size; test -t 0 && echo tty"])
            .with_env("PATH", "/usr/bin:/bin")
            .with_tty(TtyConfig {
                rows: 33,
                cols: 91,
                ..TtyConfig::default()
            });
        let spawned = spawn_on_pty(&request).unwrap();
        let output = read_until_eof(spawned.master);

        assert!(output.contains("33 91"), "output: {:?}", output);
        assert!(output.contains("tty"), "output: {:?}", output);
        let status = waitpid(Pid::from_raw(spawned.pid), None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn test_environment_is_replaced() {
        let request = LaunchRequest::new("/bin/sh")
            .with_argv(["sh", "-c", "echo \"[$PTYBROKER_PROBE][$HOME]\""])
            .with_env("PTYBROKER_PROBE", "yes");
        let spawned = spawn_on_pty(&request).unwrap();
        let output = read_until_eof(spawned.master);

        assert!(output.contains("[yes][]"), "output: {:?}", output);
        let _ = waitpid(Pid::from_raw(spawned.pid), None);
    }

    #[test]
    fn test_missing_executable_fails() {
        let request = LaunchRequest::new("/nonexistent/definitely-not-here");
        assert!(spawn_on_pty(&request).is_err());
    }
}
