//! Finding helper processes in the OS process table.
//!
//! A helper started by an earlier run of the server is not tracked by the
//! current broker. The only trace left is its command line, so matching is a
//! heuristic: the process must look like the configured helper binary and
//! carry a port argument inside the pool.
//!
//! Freeing a port does not depend on that heuristic. On Linux the listening
//! socket is looked up in `/proc/net/tcp{,6}` and traced to the processes
//! holding it open.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::{debug, trace};

use crate::config::HelperConfig;

/// Kernel limit on the short process name (`comm`) on Linux.
const COMM_MAX_LEN: usize = 15;

const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];
/// `st` column value for a listening socket.
const TCP_LISTEN: &str = "0A";

/// A live process that is probably a helper serving `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicMatch {
    pub pid: u32,
    pub port: u16,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
}

/// Port named by `-p N`, `-pN`, `--port N` or `--port=N`.
pub fn parse_port_arg<S: AsRef<str>>(args: &[S]) -> Option<u16> {
    let mut iter = args.iter().map(AsRef::as_ref);
    while let Some(arg) = iter.next() {
        if arg == "-p" || arg == "--port" {
            return iter.next().and_then(|v| v.parse().ok());
        }
        if let Some(value) = arg.strip_prefix("--port=") {
            return value.parse().ok();
        }
        if let Some(value) = arg.strip_prefix("-p") {
            if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                return value.parse().ok();
            }
        }
    }
    None
}

pub(crate) fn binary_name(binary: &str) -> &str {
    Path::new(binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binary)
}

/// Whether a process name or the head of its command line names the helper.
/// Interpreted scripts show up as `sh /path/to/helper ...`.
pub fn looks_like_helper<S: AsRef<str>>(name: &str, cmd: &[S], helper: &str) -> bool {
    if name == helper {
        return true;
    }
    if helper.len() > COMM_MAX_LEN
        && helper.is_char_boundary(COMM_MAX_LEN)
        && name == &helper[..COMM_MAX_LEN]
    {
        return true;
    }
    cmd.iter()
        .take(2)
        .any(|arg| binary_name(arg.as_ref()) == helper)
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing()
        .with_cmd(UpdateKind::Always)
        .with_exe(UpdateKind::OnlyIfNotSet)
}

/// Scan every process for helpers serving a port in the configured pool.
pub fn scan(config: &HelperConfig) -> Vec<HeuristicMatch> {
    let helper = binary_name(&config.binary);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());

    let mut found: Vec<HeuristicMatch> = system
        .processes()
        .values()
        .filter(|process| process.thread_kind().is_none())
        .filter_map(|process| {
            let name = process.name().to_string_lossy();
            let cmd: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            if !looks_like_helper(&name, &cmd, helper) {
                return None;
            }
            let port = parse_port_arg(&cmd)?;
            if !config.contains_port(port) {
                return None;
            }
            trace!(pid = process.pid().as_u32(), port, "Helper process matched");
            Some(HeuristicMatch {
                pid: process.pid().as_u32(),
                port,
                start_time: process.start_time(),
            })
        })
        .collect();

    found.sort_by_key(|m| (m.port, m.pid));
    found
}

/// Send SIGTERM to one pid. Returns false if the process is gone or the
/// signal could not be delivered.
pub(crate) fn terminate_pid(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh_kind());
    match system.process(pid) {
        Some(process) => process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill()),
        None => false,
    }
}

/// Inode of a listening socket on `port`, from one `/proc/net/tcp` row.
pub(crate) fn parse_listener(line: &str, port: u16) -> Option<u64> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if *fields.get(3)? != TCP_LISTEN {
        return None;
    }
    let (_, local_port) = fields.get(1)?.rsplit_once(':')?;
    if u16::from_str_radix(local_port, 16).ok()? != port {
        return None;
    }
    fields.get(9)?.parse().ok().filter(|inode| *inode != 0)
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

/// Pids of processes holding a socket that listens on `port`. Processes
/// whose descriptors this user cannot read are not reported.
pub fn port_listeners(port: u16) -> Vec<u32> {
    let inodes: HashSet<u64> = TCP_TABLES
        .iter()
        .filter_map(|table| std::fs::read_to_string(table).ok())
        .flat_map(|contents| {
            contents
                .lines()
                .skip(1)
                .filter_map(|line| parse_listener(line, port))
                .collect::<Vec<_>>()
        })
        .collect();
    if inodes.is_empty() {
        return Vec::new();
    }

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut owners: Vec<u32> = entries
        .flatten()
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let fds = std::fs::read_dir(entry.path().join("fd")).ok()?;
            let holds = fds.flatten().any(|fd| {
                std::fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target.to_string_lossy()))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            holds.then_some(pid)
        })
        .collect();
    owners.sort_unstable();
    owners
}

/// Force-kill whatever serves `port`: every process listening on it, plus
/// helper-looking processes whose command line names it. Ports outside the
/// pool and this process itself are never touched. Returns how many
/// processes were signalled.
pub(crate) fn kill_port(config: &HelperConfig, port: u16) -> usize {
    if !config.contains_port(port) {
        debug!(port, "Port is outside the helper pool, not freeing it");
        return 0;
    }

    let mut targets: BTreeSet<u32> = port_listeners(port).into_iter().collect();

    let helper = binary_name(&config.binary);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());
    for process in system.processes().values() {
        if process.thread_kind().is_some() {
            continue;
        }
        let name = process.name().to_string_lossy();
        let cmd: Vec<String> = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        if looks_like_helper(&name, &cmd, helper) && parse_port_arg(&cmd) == Some(port) {
            targets.insert(process.pid().as_u32());
        }
    }
    targets.remove(&std::process::id());

    let mut killed = 0;
    for pid in targets {
        match system.process(Pid::from_u32(pid)) {
            Some(process) => {
                debug!(pid, port, "Killing process holding helper port");
                if process.kill() {
                    killed += 1;
                }
            }
            None => trace!(pid, port, "Port holder exited before it could be killed"),
        }
    }
    killed
}
