//! Process table and socket queries
//!
//! On Linux these read `/proc` directly. Elsewhere descendant discovery
//! returns nothing (process-group signalling still covers the tree) and the
//! port query reports `Unsupported` so callers can fall back to a bind probe.

use std::collections::VecDeque;
use std::io;

/// One row of the process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub state: char,
}

impl ProcStat {
    /// Zombies and dead entries no longer count as running
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parse the contents of `/proc/<pid>/stat`
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are taken from after the last `)`.
pub fn parse_stat(pid: u32, contents: &str) -> Option<ProcStat> {
    let after_comm = contents.rsplit_once(')')?.1;
    let mut fields = after_comm.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some(ProcStat {
        pid,
        ppid,
        pgid,
        state,
    })
}

/// Socket inodes whose local port equals `port`, from a `/proc/net/tcp*` table
pub fn parse_tcp_table(contents: &str, port: u16) -> Vec<u64> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port {
                return None;
            }
            let inode: u64 = fields.get(9)?.parse().ok()?;
            // TIME_WAIT sockets have no owner
            (inode != 0).then_some(inode)
        })
        .collect()
}

/// Order `root`'s descendants breadth-first from a process table snapshot
pub fn descendants_in(table: &[ProcStat], root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = VecDeque::from([root]);
    while let Some(parent) = frontier.pop_front() {
        for entry in table.iter().filter(|p| p.ppid == parent && p.pid != root) {
            if !found.contains(&entry.pid) {
                found.push(entry.pid);
                frontier.push_back(entry.pid);
            }
        }
    }
    found
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    pub fn stat(pid: u32) -> Option<ProcStat> {
        let contents = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_stat(pid, &contents)
    }

    fn pids() -> Vec<u32> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect()
    }

    pub fn process_table() -> Vec<ProcStat> {
        pids().into_iter().filter_map(stat).collect()
    }

    pub fn is_alive(pid: u32) -> bool {
        stat(pid).map(|s| s.is_alive()).unwrap_or(false)
    }

    pub fn port_owners(port: u16) -> io::Result<Vec<u32>> {
        let mut inodes = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match fs::read_to_string(table) {
                Ok(contents) => inodes.extend(parse_tcp_table(&contents, port)),
                // tcp6 is absent when IPv6 is disabled
                Err(e) if e.kind() == io::ErrorKind::NotFound && table.ends_with('6') => {}
                Err(e) => return Err(e),
            }
        }
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let own_pid = std::process::id();
        let mut owners = Vec::new();
        for pid in pids() {
            if pid == own_pid {
                continue;
            }
            // Unreadable fd tables belong to other users; skip them
            let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
                continue;
            };
            let owns = fds.filter_map(|fd| fd.ok()).any(|fd| {
                fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target.to_string_lossy()))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if owns {
                owners.push(pid);
            }
        }
        owners.sort_unstable();
        Ok(owners)
    }

    fn socket_inode(link: &str) -> Option<u64> {
        link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn process_table() -> Vec<ProcStat> {
        Vec::new()
    }

    #[cfg(unix)]
    pub fn is_alive(pid: u32) -> bool {
        // Signal 0 probes existence; EPERM still means the process exists
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn port_owners(_port: u16) -> io::Result<Vec<u32>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "port owner lookup requires /proc",
        ))
    }
}

/// Whether `pid` refers to a live (non-zombie) process
pub fn is_alive(pid: u32) -> bool {
    imp::is_alive(pid)
}

/// All descendants of `root`, breadth-first (children before grandchildren)
pub fn descendants(root: u32) -> Vec<u32> {
    descendants_in(&imp::process_table(), root)
}

/// Live members of process group `pgid`, excluding the leader itself
pub fn group_members(pgid: u32) -> Vec<u32> {
    imp::process_table()
        .into_iter()
        .filter(|p| p.pgid == pgid && p.pid != pgid && p.is_alive())
        .map(|p| p.pid)
        .collect()
}

/// Pids holding a socket whose local port is `port`
pub fn port_owners(port: u16) -> io::Result<Vec<u32>> {
    imp::port_owners(port)
}
