//! The whole bugreport, as handed over by the section splitter.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::{anr::Anr, logcat::Logcat, stacks::VmTraces};

/// What we know about a thread across every dump it showed up in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub pid: u32,
    pub tid: u32,
    pub name: String,
}

/// What we know about a process across every dump it showed up in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd_line: String,
    pub threads: BTreeMap<u32, ThreadInfo>,
}

impl ProcessInfo {
    pub fn new(pid: u32, cmd_line: &str) -> Self {
        Self {
            pid,
            cmd_line: cmd_line.to_string(),
            threads: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bugreport {
    /// When dumpstate started and finished
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,

    pub anr: Option<Anr>,
    pub system_log: Logcat,
    pub event_log: Logcat,
    /// The merged log. Left alone by the inspector if already supplied.
    pub logcat: Option<Logcat>,

    pub vm_traces_just_now: Option<VmTraces>,
    pub vm_traces_last_anr: Option<VmTraces>,

    // filled in by the inspector
    pub all_known_processes: BTreeMap<u32, ProcessInfo>,
    /// Indices into `logcat`
    pub interesting_log_lines: Vec<usize>,
}

impl Bugreport {
    pub fn process_info(&self, pid: u32) -> Option<&ProcessInfo> {
        self.all_known_processes.get(&pid)
    }

    pub fn thread_info(&self, pid: u32, tid: u32) -> Option<&ThreadInfo> {
        self.process_info(pid)?.threads.get(&tid)
    }
}
