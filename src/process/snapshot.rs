use crate::process::ProcessInfo;
use std::collections::{HashMap, HashSet, VecDeque};

/// Immutable picture of the process table at one point in time
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    processes: HashMap<i32, ProcessInfo>,
    /// Parent pid to child pids, in enumeration order
    children: HashMap<i32, Vec<i32>>,
    generation: u64,
}

impl ProcessSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from an enumeration; the first entry wins when a pid repeats
    pub fn from_processes(processes: Vec<ProcessInfo>, generation: u64) -> Self {
        let mut by_pid = HashMap::with_capacity(processes.len());
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();

        for info in processes {
            if by_pid.contains_key(&info.pid) {
                continue;
            }
            if info.ppid != info.pid {
                children.entry(info.ppid).or_default().push(info.pid);
            }
            by_pid.insert(info.pid, info);
        }

        Self {
            processes: by_pid,
            children,
            generation,
        }
    }

    /// Bumped by one for every snapshot a cache publishes
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, pid: i32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    pub fn children_of(&self, pid: i32) -> &[i32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Follow foreground children down from `pid`
    ///
    /// At each level the first foreground child in enumeration order is taken. Returns
    /// `pid` itself when none of its children is in the foreground.
    pub fn deepest_foreground_job(&self, pid: i32) -> Option<&ProcessInfo> {
        let mut current = self.processes.get(&pid)?;
        let mut visited = HashSet::from([pid]);

        loop {
            let next = self
                .children_of(current.pid)
                .iter()
                .filter_map(|child| self.processes.get(child))
                .find(|child| child.foreground && !visited.contains(&child.pid));
            match next {
                Some(child) => {
                    visited.insert(child.pid);
                    current = child;
                }
                None => return Some(current),
            }
        }
    }

    /// Every descendant of `pid`, breadth-first
    pub fn descendants(&self, pid: i32) -> Vec<&ProcessInfo> {
        let mut out = Vec::new();
        let mut visited = HashSet::from([pid]);
        let mut queue: VecDeque<i32> = self.children_of(pid).iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            if !visited.insert(next) {
                continue;
            }
            if let Some(info) = self.processes.get(&next) {
                out.push(info);
                queue.extend(self.children_of(next).iter().copied());
            }
        }
        out
    }

    /// Pids that appeared, disappeared, or changed foreground state since `previous`
    pub fn changed_pids(&self, previous: &ProcessSnapshot) -> HashSet<i32> {
        let mut changed: HashSet<i32> = previous
            .processes
            .keys()
            .filter(|pid| !self.processes.contains_key(pid))
            .copied()
            .collect();

        for (pid, info) in &self.processes {
            match previous.processes.get(pid) {
                Some(old) if old.foreground == info.foreground => {}
                _ => {
                    changed.insert(*pid);
                }
            }
        }
        changed
    }
}
