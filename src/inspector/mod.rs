//! Cross-referencing everything in a bugreport: which processes and threads
//! exist, which ANR happened, who was blocked on whom, and which log lines
//! matter.

pub mod binder;
pub mod logs;

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::{
    anr::AnrParser,
    bugreport::{Bugreport, ProcessInfo, ThreadInfo},
    config::InspectorConfig,
    lines::Lines,
    logcat::LogLevel,
    stacks::{DeadlockDetector, Lock, LockType, Process, Thread, VmTraces},
};

/// The heap task daemon sits in a wait that looks blocked but never is.
const HEAP_TASK_DAEMON_STACK: [&str; 3] = [
    "dalvik.system.VMRuntime.runHeapTasks",
    "java.lang.Daemons$HeapTaskDaemon.run",
    "java.lang.Thread.run",
];

pub struct Inspector<'a> {
    bugreport: &'a mut Bugreport,
    config: &'a InspectorConfig,
}

impl<'a> Inspector<'a> {
    pub fn new(bugreport: &'a mut Bugreport, config: &'a InspectorConfig) -> Self {
        Self { bugreport, config }
    }

    /// Run every pass, in order. Passes only add annotations; the one
    /// exception is the optional logcat trim.
    pub fn inspect(mut self) {
        self.make_process_info();
        self.find_anr();
        self.inspect_traces();
        self.mark_deadlocks();
        self.prepare_logcat();
        self.annotate_logcat();
        self.make_interesting_processes();
    }

    fn make_process_info(&mut self) {
        let report = &mut *self.bugreport;
        let directory = &mut report.all_known_processes;

        let anr_traces = report.anr.as_ref().and_then(|anr| anr.vm_traces.as_ref());
        let all = [
            anr_traces,
            report.vm_traces_just_now.as_ref(),
            report.vm_traces_last_anr.as_ref(),
        ];
        for traces in all.into_iter().flatten() {
            record_processes(directory, &traces.processes);
        }

        debug!("{} known processes", directory.len());
    }

    fn find_anr(&mut self) {
        if self.bugreport.anr.is_some() {
            return;
        }

        let lines = self
            .bugreport
            .system_log
            .filter("ActivityManager", LogLevel::Error);
        let Some(mut anr) = AnrParser::default()
            .parse(&mut Lines::new(&lines))
            .into_iter()
            .next()
        else {
            debug!("no anr in the system log");
            return;
        };

        info!("anr in {} (pid {:?})", anr.process, anr.pid);
        anr.vm_traces = self.bugreport.vm_traces_last_anr.clone();
        self.bugreport.anr = Some(anr);
    }

    fn inspect_traces(&mut self) {
        let report = &mut *self.bugreport;
        let anr_traces = report.anr.as_mut().and_then(|anr| anr.vm_traces.as_mut());
        let all = [
            report.vm_traces_just_now.as_mut(),
            report.vm_traces_last_anr.as_mut(),
            anr_traces,
        ];
        for traces in all.into_iter().flatten() {
            inspect_processes(&mut traces.processes);
        }
    }

    fn mark_deadlocks(&mut self) {
        let Some(anr) = self.bugreport.anr.as_mut() else {
            return;
        };
        let (Some(pid), Some(traces)) = (anr.pid, anr.vm_traces.as_mut()) else {
            return;
        };

        let found = DeadlockDetector::detect(traces, pid);
        debug!("{} processes tangled up with pid {}", found.len(), pid);
        traces.add_deadlocked(found);
    }

    /// Fill in missing times, build the merged log if nobody supplied one,
    /// and trim it if asked to.
    fn prepare_logcat(&mut self) {
        let report = &mut *self.bugreport;
        logs::invent_times(&mut report.system_log.lines);
        logs::invent_times(&mut report.event_log.lines);

        match report.logcat.as_mut() {
            Some(logcat) => logs::invent_times(&mut logcat.lines),
            None => {
                report.logcat = Some(logs::merge(
                    &report.system_log.lines,
                    &report.event_log.lines,
                ))
            }
        }

        if !self.config.trim_logcat {
            return;
        }
        if let (Some(start), Some(logcat)) = (report.start_time, report.logcat.as_mut()) {
            logs::trim(logcat, start);
        }
    }

    fn annotate_logcat(&mut self) {
        let report = &mut *self.bugreport;
        let Some(logcat) = report.logcat.as_mut() else {
            return;
        };

        report.interesting_log_lines = logs::interesting_lines(logcat);
        logs::link_processes(logcat, &report.all_known_processes);
        logs::mark_anr_regions(logcat);
        if let (Some(start), Some(end)) = (report.start_time, report.end_time) {
            logs::mark_bugreport_region(logcat, start, end);
        }
    }

    fn make_interesting_processes(&mut self) {
        let Some(anr) = self.bugreport.anr.as_mut() else {
            return;
        };
        let pid = anr.pid;
        if let Some(traces) = anr.vm_traces.as_mut() {
            make_interesting_processes(traces, pid);
        }
    }
}

/// Run every pass over `bugreport`.
pub fn inspect(bugreport: &mut Bugreport, config: &InspectorConfig) {
    Inspector::new(bugreport, config).inspect();
}

/// Add what `processes` say about pids and tids to `directory`. The longer
/// of two names wins, since dumps sometimes truncate them.
fn record_processes(directory: &mut BTreeMap<u32, ProcessInfo>, processes: &[Process]) {
    for process in processes {
        let cmd_line = process.cmd_line.as_deref().unwrap_or("");
        let info = directory
            .entry(process.pid)
            .or_insert_with(|| ProcessInfo::new(process.pid, cmd_line));
        if cmd_line.len() > info.cmd_line.len() {
            info.cmd_line = cmd_line.to_string();
        }

        for thread in &process.threads {
            let Some(tid) = thread.sys_tid else {
                continue;
            };
            let known = info.threads.entry(tid).or_insert_with(|| ThreadInfo {
                pid: process.pid,
                tid,
                name: thread.name.clone(),
            });
            if thread.name.len() > known.name.len() {
                known.name = thread.name.clone();
            }
        }
    }
}

pub fn inspect_processes(processes: &mut [Process]) {
    combine_locks(processes);
    binder::mark_binder_threads(processes);
    mark_blocked_threads(processes);
    mark_interesting_threads(processes);
}

fn threads_mut(processes: &mut [Process]) -> impl Iterator<Item = &mut Thread> {
    processes.iter_mut().flat_map(|p| p.threads.iter_mut())
}

/// Gather the locks of every frame into the thread's lock map. A monitor seen
/// from more than one frame gets the union of its lock types.
fn combine_locks(processes: &mut [Process]) {
    for thread in threads_mut(processes) {
        let mut locks: BTreeMap<Option<String>, Lock> = BTreeMap::new();
        for lock in thread.java_frames().flat_map(|f| f.locks.iter()) {
            locks
                .entry(lock.address.clone())
                .and_modify(|existing| existing.kind |= lock.kind)
                .or_insert_with(|| lock.clone());
        }
        thread.locks = locks;
    }
}

fn mark_blocked_threads(processes: &mut [Process]) {
    for thread in threads_mut(processes) {
        if thread.matches_java_stack(Some("HeapTaskDaemon"), &HEAP_TASK_DAEMON_STACK) {
            continue;
        }
        thread.blocked = thread
            .locks
            .values()
            .any(|lock| lock.kind.contains(LockType::BLOCKED));
    }
}

fn mark_interesting_threads(processes: &mut [Process]) {
    for thread in threads_mut(processes) {
        thread.interesting = is_thread_interesting(thread);
    }
}

pub fn is_thread_interesting(thread: &Thread) -> bool {
    if thread.runnable || thread.is_binder() {
        return true;
    }
    // only there to write the dump
    !thread.matches_java_stack(Some("Signal Catcher"), &[])
}

fn is_process_interesting(process: &Process, anr_pid: Option<u32>) -> bool {
    Some(process.pid) == anr_pid || !process.threads.is_empty()
}

/// Project every process down to its interesting threads, and keep the ones
/// with something left (plus the ANR process, regardless).
pub fn make_interesting_processes(traces: &mut VmTraces, anr_pid: Option<u32>) {
    traces.interesting_processes = traces
        .processes
        .iter()
        .map(|p| p.with_threads(p.threads.iter().filter(|t| t.interesting).cloned()))
        .filter(|p| is_process_interesting(p, anr_pid))
        .collect();
}
