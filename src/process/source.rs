//! Process table enumeration
//!
//! - **Linux**: reads `/proc/<pid>/stat`
//! - **Elsewhere**: parses `ps -axo pid=,ppid=,pgid=,tpgid=,tty=,comm=`

use crate::process::ProcessInfo;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;

/// Something that can list the processes of the system
pub trait ProcessSource: Send + Sync {
    /// Every visible process, in a stable order
    fn enumerate(&self) -> io::Result<Vec<ProcessInfo>>;
}

impl<F> ProcessSource for F
where
    F: Fn() -> io::Result<Vec<ProcessInfo>> + Send + Sync,
{
    fn enumerate(&self) -> io::Result<Vec<ProcessInfo>> {
        self()
    }
}

/// The operating system's process table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessSource;

impl SystemProcessSource {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSource for SystemProcessSource {
    #[cfg(target_os = "linux")]
    fn enumerate(&self) -> io::Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for entry in std::fs::read_dir("/proc")?.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            // Processes exit between readdir and read; that is not an error.
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                continue;
            };
            if let Some(info) = parse_proc_stat(&stat) {
                processes.push(info);
            }
        }
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    #[cfg(not(target_os = "linux"))]
    fn enumerate(&self) -> io::Result<Vec<ProcessInfo>> {
        let output = std::process::Command::new("ps")
            .args(["-axo", "pid=,ppid=,pgid=,tpgid=,tty=,comm="])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_ps_line)
            .collect())
    }
}

/// Parse `/proc/<pid>/stat`: "pid (comm) state ppid pgrp session tty_nr tpgid ..."
pub fn parse_proc_stat(stat: &str) -> Option<ProcessInfo> {
    // The command name may contain spaces and parens, so split on the last ')'.
    let name_start = stat.find('(')?;
    let name_end = stat.rfind(')')?;
    let pid = stat[..name_start].trim().parse::<i32>().ok()?;
    let name = stat[name_start + 1..name_end].to_string();

    let fields: Vec<&str> = stat.get(name_end + 2..)?.split_whitespace().collect();
    // fields[0] = state, [1] = ppid, [2] = pgrp, [3] = session, [4] = tty_nr, [5] = tpgid
    let ppid = fields.get(1)?.parse::<i32>().ok()?;
    let pgid = fields.get(2)?.parse::<i32>().ok()?;
    let tty_nr = fields.get(4)?.parse::<i64>().ok()?;
    let tpgid = fields.get(5)?.parse::<i32>().ok()?;

    let tty = (tty_nr != 0).then_some(tty_nr as u64);
    Some(ProcessInfo {
        pid,
        ppid,
        pgid,
        tty,
        foreground: tty.is_some() && tpgid > 0 && pgid == tpgid,
        name,
    })
}

/// Parse one line of `ps -axo pid=,ppid=,pgid=,tpgid=,tty=,comm=`
pub fn parse_ps_line(line: &str) -> Option<ProcessInfo> {
    let mut rest = line.trim_start();
    let mut fields = [""; 5];
    for field in fields.iter_mut() {
        let end = rest.find(char::is_whitespace)?;
        *field = &rest[..end];
        rest = rest[end..].trim_start();
    }
    let [pid, ppid, pgid, tpgid, tty_name] = fields;
    let pid = pid.parse::<i32>().ok()?;
    let ppid = ppid.parse::<i32>().ok()?;
    let pgid = pgid.parse::<i32>().ok()?;
    let tpgid = tpgid.parse::<i32>().ok()?;

    let tty = match tty_name {
        "?" | "??" | "-" => None,
        name => {
            let mut hasher = DefaultHasher::new();
            name.hash(&mut hasher);
            Some(hasher.finish())
        }
    };
    Some(ProcessInfo {
        pid,
        ppid,
        pgid,
        tty,
        foreground: tty.is_some() && tpgid > 0 && pgid == tpgid,
        name: rest.trim_end().to_string(),
    })
}
