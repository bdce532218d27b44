//! Finds the threads tangled up in the locks held by a process's main thread.
//!
//! The traversal walks a bipartite graph of monitors and threads: from a
//! monitor to every thread of the same process that touches it, and from
//! there to every other monitor those threads touch. Monitors are per-VM, so
//! the walk never leaves the process that owns the monitor.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{Process, Thread, VmTraces};

/// A thread, identified by where it lives. Ordered by pid, then tid.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ThreadRecord {
    pid: u32,
    tid: Option<u32>,
    // position in VmTraces, to tell apart threads without a tid
    process: usize,
    thread: usize,
}

/// A monitor inside one process. Ordered by pid, then address, unknown
/// addresses first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct LockRecord {
    pid: u32,
    address: Option<String>,
    process: usize,
}

#[derive(Debug)]
pub struct DeadlockDetector<'a> {
    traces: &'a VmTraces,
    visited: BTreeSet<LockRecord>,
    involved: BTreeSet<ThreadRecord>,
}

impl<'a> DeadlockDetector<'a> {
    /// Returns a projection of every process involved with the locks of
    /// `pid`'s main thread, holding only the involved threads. Empty when
    /// the process or its main thread is missing, or main holds no locks.
    pub fn detect(traces: &'a VmTraces, pid: u32) -> Vec<Process> {
        let mut detector = Self {
            traces,
            visited: BTreeSet::new(),
            involved: BTreeSet::new(),
        };
        detector.walk(pid);
        detector.collect()
    }

    fn walk(&mut self, pid: u32) {
        let traces = self.traces;
        let Some((process_index, process)) = traces
            .processes
            .iter()
            .enumerate()
            .find(|(_, p)| p.pid == pid)
        else {
            debug!("no process {} for deadlock detection", pid);
            return;
        };
        let Some(main) = process.thread("main") else {
            debug!("process {} has no main thread", pid);
            return;
        };

        let mut to_visit = BTreeSet::new();
        self.enqueue_locks(&mut to_visit, pid, process_index, main);

        while let Some(lock) = to_visit.pop_first() {
            self.visited.insert(lock.clone());

            // unknown objects can't be matched against anything
            if lock.address.is_none() {
                continue;
            }

            let owner = &traces.processes[lock.process];
            for (thread_index, thread) in owner.threads.iter().enumerate() {
                if !thread.locks.contains_key(&lock.address) {
                    continue;
                }
                let record = ThreadRecord {
                    pid: owner.pid,
                    tid: thread.tid,
                    process: lock.process,
                    thread: thread_index,
                };
                if self.involved.insert(record) {
                    self.enqueue_locks(&mut to_visit, owner.pid, lock.process, thread);
                }
            }
        }
    }

    fn enqueue_locks(
        &self,
        to_visit: &mut BTreeSet<LockRecord>,
        pid: u32,
        process: usize,
        thread: &Thread,
    ) {
        for address in thread.locks.keys() {
            let record = LockRecord {
                pid,
                address: address.clone(),
                process,
            };
            if !self.visited.contains(&record) {
                to_visit.insert(record);
            }
        }
    }

    fn collect(self) -> Vec<Process> {
        let mut result: BTreeMap<usize, Process> = BTreeMap::new();

        for record in &self.involved {
            let original = &self.traces.processes[record.process];
            result
                .entry(record.process)
                .or_insert_with(|| original.with_threads(std::iter::empty()))
                .threads
                .push(original.threads[record.thread].clone());
        }

        result.into_values().collect()
    }
}
