/// One entry of a process table enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    /// Controlling terminal device, `None` when detached
    pub tty: Option<u64>,
    /// The process group is the foreground group of its terminal
    pub foreground: bool,
    /// Command name
    pub name: String,
}

impl ProcessInfo {
    pub fn new(pid: i32, ppid: i32, name: impl Into<String>) -> Self {
        Self {
            pid,
            ppid,
            pgid: pid,
            tty: None,
            foreground: false,
            name: name.into(),
        }
    }

    pub fn with_tty(mut self, tty: u64) -> Self {
        self.tty = Some(tty);
        self
    }

    pub fn in_foreground(mut self) -> Self {
        self.foreground = true;
        self
    }
}
