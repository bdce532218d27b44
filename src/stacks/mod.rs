//! Parsed VM traces: processes, threads, frames and the locks attached to them.

pub mod deadlock;
pub mod process;
pub mod thread;
pub mod vm_traces;

pub use deadlock::DeadlockDetector;
pub use process::ProcessSnapshotParser;
pub use thread::ThreadSnapshotParser;
pub use vm_traces::VmTracesParser;

use bitflags::bitflags;
use chrono::NaiveDateTime;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

bitflags! {
    /// How a thread relates to a monitor. A thread can hit the same monitor
    /// from several frames, so these get OR'd together.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LockType: u8 {
        const LOCKED = 1 << 0;
        const WAITING = 1 << 1;
        const SLEEPING = 1 << 2;
        const BLOCKED = 1 << 3;
    }
}

impl Serialize for LockType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.iter_names().map(|(name, _)| name.to_lowercase()).join("|");
        write!(f, "{}", names)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub kind: LockType,
    /// Hex address without the `0x`, `None` for "an unknown object"
    pub address: Option<String>,
    pub package: Option<String>,
    pub class: Option<String>,
    /// Only known for "waiting to lock ... held by thread N"
    pub owner_tid: Option<u32>,
}

impl Lock {
    pub fn new(kind: LockType, address: &str, package: Option<&str>, class: &str) -> Self {
        Self {
            kind,
            address: Some(address.to_string()),
            package: package.map(str::to_string),
            class: Some(class.to_string()),
            owner_tid: None,
        }
    }

    pub fn unknown(kind: LockType) -> Self {
        Self {
            kind,
            address: None,
            package: None,
            class: None,
            owner_tid: None,
        }
    }

    /// Two locks are the same monitor iff both have an address and they match.
    pub fn same_monitor(&self, other: &Lock) -> bool {
        matches!((&self.address, &other.address), (Some(a), Some(b)) if a == b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
pub enum Language {
    #[strum(serialize = "java")]
    Java,
    #[strum(serialize = "jni")]
    Jni,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JavaFrame {
    pub text: String,
    pub package: Option<String>,
    pub class: String,
    pub method: String,
    pub source_file: Option<String>,
    pub source_line: Option<i32>,
    pub language: Language,
    pub locks: Vec<Lock>,
}

impl JavaFrame {
    /// `pkg.Class.method`, or `Class.method` in the default package.
    pub fn full_name(&self) -> String {
        match &self.package {
            Some(package) => format!("{}.{}.{}", package, self.class, self.method),
            None => format!("{}.{}", self.class, self.method),
        }
    }

    pub fn is(&self, package: &str, class: &str, method: &str) -> bool {
        self.package.as_deref() == Some(package) && self.class == class && self.method == method
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NativeFrame {
    pub text: String,
    pub library: String,
    pub symbol: Option<String>,
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KernelFrame {
    pub text: String,
    pub syscall: String,
    pub offset0: u64,
    pub offset1: u64,
}

/// One line of a thread's stack. Index 0 is the top of the stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackFrame {
    Java(JavaFrame),
    Native(NativeFrame),
    Kernel(KernelFrame),
    Other { text: String },
}

impl StackFrame {
    pub fn as_java(&self) -> Option<&JavaFrame> {
        match self {
            StackFrame::Java(f) => Some(f),
            _ => None,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            StackFrame::Java(f) => &f.text,
            StackFrame::Native(f) => &f.text,
            StackFrame::Kernel(f) => &f.text,
            StackFrame::Other { text } => text,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, strum::Display)]
pub enum ThreadType {
    #[default]
    Managed,
    Unmanaged,
}

/// The interface and method on one side of a Binder transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BinderCall {
    pub package: Option<String>,
    pub class: Option<String>,
    pub method: Option<String>,
}

impl fmt::Display for BinderCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [&self.package, &self.class, &self.method]
            .into_iter()
            .flatten()
            .join(".");
        write!(f, "{}", parts)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Thread {
    pub kind: ThreadType,
    pub name: String,
    pub daemon: bool,
    pub priority: Option<i32>,
    pub tid: Option<u32>,
    pub sys_tid: Option<u32>,
    pub vm_state: Option<String>,
    pub attributes: Vec<String>,
    pub held_mutexes: Option<String>,
    pub frames: Vec<StackFrame>,
    pub runnable: bool,

    // filled in by the inspector
    pub blocked: bool,
    pub interesting: bool,
    pub inbound_binder: Option<BinderCall>,
    pub outbound_binder: Option<BinderCall>,
    /// Every lock seen in any frame, keyed by address
    #[serde(skip)]
    pub locks: BTreeMap<Option<String>, Lock>,
}

impl Thread {
    pub fn java_frames(&self) -> impl DoubleEndedIterator<Item = &JavaFrame> {
        self.frames.iter().filter_map(StackFrame::as_java)
    }

    pub fn is_binder(&self) -> bool {
        self.inbound_binder.is_some() || self.outbound_binder.is_some()
    }

    /// Whether this thread has the given name (when one is supplied) and its
    /// Java frames are exactly `signature`, top of stack first. Non-Java
    /// frames are skipped.
    pub fn matches_java_stack(&self, name: Option<&str>, signature: &[&str]) -> bool {
        if let Some(name) = name {
            if name != self.name {
                return false;
            }
        }

        let mut java = self.java_frames();
        for expected in signature {
            match java.next() {
                Some(frame) if frame.full_name() == *expected => {}
                _ => return false,
            }
        }

        java.next().is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Process {
    pub pid: u32,
    pub cmd_line: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub threads: Vec<Thread>,
}

impl Process {
    /// A copy of this process holding only the given threads.
    pub fn with_threads<I>(&self, threads: I) -> Self
    where
        I: IntoIterator<Item = Thread>,
    {
        Self {
            pid: self.pid,
            cmd_line: self.cmd_line.clone(),
            date: self.date,
            threads: threads.into_iter().collect(),
        }
    }

    pub fn thread(&self, name: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.name == name)
    }
}

/// All the processes dumped on one occasion.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VmTraces {
    pub processes: Vec<Process>,
    pub interesting_processes: Vec<Process>,
    pub deadlocked_processes: Vec<Process>,
}

impl VmTraces {
    pub fn process(&self, pid: u32) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Merge `found` into the deadlocked set. Processes are keyed by pid,
    /// threads by position-independent identity (tid, then name).
    pub fn add_deadlocked(&mut self, found: Vec<Process>) {
        for process in found {
            match self
                .deadlocked_processes
                .iter_mut()
                .find(|p| p.pid == process.pid)
            {
                Some(existing) => {
                    for thread in process.threads {
                        let known = existing
                            .threads
                            .iter()
                            .any(|t| t.tid == thread.tid && t.name == thread.name);
                        if !known {
                            existing.threads.push(thread);
                        }
                    }
                }
                None => self.deadlocked_processes.push(process),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JavaFrame, Language, Lock, LockType, StackFrame, Thread};

    fn java(package: &str, class: &str, method: &str) -> StackFrame {
        StackFrame::Java(JavaFrame {
            text: String::new(),
            package: Some(package.to_string()),
            class: class.to_string(),
            method: method.to_string(),
            source_file: None,
            source_line: None,
            language: Language::Java,
            locks: vec![],
        })
    }

    #[test]
    fn lock_type_display() {
        let kind = LockType::LOCKED | LockType::BLOCKED;
        assert_eq!(kind.to_string(), "locked|blocked");
    }

    #[test]
    fn unknown_locks_are_never_the_same_monitor() {
        let a = Lock::unknown(LockType::BLOCKED);
        let b = Lock::unknown(LockType::BLOCKED);
        assert!(!a.same_monitor(&b));

        let c = Lock::new(LockType::LOCKED, "12", None, "Object");
        let d = Lock::new(LockType::BLOCKED, "12", Some("java.lang"), "Object");
        assert!(c.same_monitor(&d));
    }

    #[test]
    fn java_stack_signature() {
        let thread = Thread {
            name: "HeapTaskDaemon".to_string(),
            frames: vec![
                StackFrame::Other {
                    text: "  kernel: futex_wait".to_string(),
                },
                java("dalvik.system", "VMRuntime", "runHeapTasks"),
                java("java.lang", "Daemons$HeapTaskDaemon", "run"),
                java("java.lang", "Thread", "run"),
            ],
            ..Default::default()
        };

        let signature = [
            "dalvik.system.VMRuntime.runHeapTasks",
            "java.lang.Daemons$HeapTaskDaemon.run",
            "java.lang.Thread.run",
        ];
        assert!(thread.matches_java_stack(Some("HeapTaskDaemon"), &signature));
        assert!(thread.matches_java_stack(None, &signature));
        assert!(!thread.matches_java_stack(Some("main"), &signature));
        assert!(!thread.matches_java_stack(None, &signature[..2]));
        assert!(!thread.matches_java_stack(None, &[]));
    }
}
