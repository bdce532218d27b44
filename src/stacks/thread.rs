//! Parser for a single thread of a VM traces dump.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::{debug, trace};

use super::{
    JavaFrame, KernelFrame, Language, Lock, LockType, NativeFrame, StackFrame, Thread, ThreadType,
};
use crate::{
    config::InspectorConfig,
    error::ParseError,
    lines::{Line, Lines},
};

lazy_static! {
    pub static ref BEGIN_UNMANAGED_THREAD_RE: Regex =
        Regex::new(r#"^"(.*)" sysTid=(\d+)(.*)$"#).unwrap();
    pub static ref BEGIN_MANAGED_THREAD_RE: Regex =
        Regex::new(r#"^"(.*)" (.*) ?prio=(\d+)\s+tid=(\d+)\s*(.*)$"#).unwrap();
    pub static ref BEGIN_NOT_ATTACHED_THREAD_RE: Regex =
        Regex::new(r#"^"(.*)" (.*) ?prio=(\d+)\s+(\(not attached\))$"#).unwrap();

    static ref ATTR_RE: Regex = Regex::new(r"^  \| (.*)$").unwrap();
    static ref HELD_MUTEXES_RE: Regex = Regex::new(r"^  \| (held mutexes=\s*(.*))$").unwrap();
    static ref SYS_TID_ATTR_RE: Regex = Regex::new(r"^  \| sysTid=(\d+) .*$").unwrap();
    static ref STATE_ATTR_RE: Regex = Regex::new(r"^  \| state=R .*$").unwrap();

    static ref NATIVE_RE: Regex = Regex::new(
        r"^  (?:native: )?#\d+ \S+ [0-9a-fA-F]+\s+(.*)\s+\((.*)\+(\d+)\)(?:\s+\(BuildId: \w+\))?$"
    ).unwrap();
    static ref NATIVE_NO_LOC_RE: Regex = Regex::new(
        r"^  (?:native: )?#\d+ \S+ [0-9a-fA-F]+\s+(.+?)(?:\s+\((.*?)\))?(?:\s+\(BuildId: \w+\))?\s*$"
    ).unwrap();
    static ref KERNEL_RE: Regex =
        Regex::new(r"^  kernel: (.*)\+0x([0-9a-fA-F]+)/0x([0-9a-fA-F]+)$").unwrap();
    static ref KERNEL_UNKNOWN_RE: Regex =
        Regex::new(r"^  kernel: \(couldn't read /proc/self/task/\d+/stack\)$").unwrap();
    static ref JAVA_RE: Regex =
        Regex::new(r"^  at (?:(.+)\.)?([^.]+)\.([^.]+)\((.*):([\d-]+)\)$").unwrap();
    static ref JNI_RE: Regex =
        Regex::new(r"^  at (?:(.+)\.)?([^.]+)\.([^.]+)\(Native method\)$").unwrap();

    static ref LOCKED_RE: Regex = Regex::new(
        r"^  - locked <0x([0-9a-fA-F]{1,16})> \(a (?:(.+)\.)?([^.]+)\)$"
    ).unwrap();
    static ref SLEEPING_ON_RE: Regex = Regex::new(
        r"^  - sleeping on <0x([0-9a-fA-F]{1,16})> \(a (?:(.+)\.)?([^.]+)\)$"
    ).unwrap();
    static ref WAITING_ON_RE: Regex = Regex::new(
        r"^  - waiting on <0x([0-9a-fA-F]{1,16})> \(a (?:(.+)\.)?([^.]+)\)$"
    ).unwrap();
    static ref WAITING_TO_LOCK_HELD_RE: Regex = Regex::new(
        r"^  - waiting to lock <0x([0-9a-fA-F]{1,16})> \(a (?:(.+)\.)?([^.]+)\) held by thread (\d+)$"
    ).unwrap();
    static ref WAITING_TO_LOCK_RE: Regex = Regex::new(
        r"^  - waiting to lock <0x([0-9a-fA-F]{1,16})> \(a (?:(.+)\.)?([^.]+)\)$"
    ).unwrap();
    static ref WAITING_TO_LOCK_UNKNOWN_RE: Regex =
        Regex::new(r"^  - waiting to lock an unknown object$").unwrap();
    static ref NO_MANAGED_STACK_FRAME_RE: Regex =
        Regex::new(r"^  (\(no managed stack frames\))$").unwrap();

    // a process boundary without the usual blank line in front of it
    static ref SECTION_MARKER_RE: Regex = Regex::new(r"^----- (?:pid|end) \d+").unwrap();
}

/// Whether `text` opens a thread in any of the three known shapes.
pub fn is_thread_header(text: &str) -> bool {
    BEGIN_UNMANAGED_THREAD_RE.is_match(text)
        || BEGIN_MANAGED_THREAD_RE.is_match(text)
        || BEGIN_NOT_ATTACHED_THREAD_RE.is_match(text)
}

fn group<'t>(caps: &Captures<'t>, i: usize) -> Option<&'t str> {
    caps.get(i).map(|m| m.as_str())
}

fn lock_from(kind: LockType, caps: &Captures) -> Lock {
    Lock::new(kind, &caps[1], group(caps, 2), &caps[3])
}

/// Parses one thread, stopping at the first blank line.
///
/// The parser can be reused.
#[derive(Debug, Default)]
pub struct ThreadSnapshotParser {
    dump: bool,
}

impl ThreadSnapshotParser {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            dump: config.dump_threads,
        }
    }

    /// Parse one thread. On an unrecognized header the line is pushed back
    /// so the caller can take another look at it.
    pub fn parse<T: Line>(&self, lines: &mut Lines<T>) -> Result<Thread, ParseError> {
        let header = lines.next().ok_or(ParseError::NoInput)?;
        let mut result = match Self::parse_header(header.text()) {
            Ok(thread) => thread,
            Err(e) => {
                lines.rewind();
                return Err(e);
            }
        };

        Self::parse_attributes(&mut result, lines);
        Self::parse_stack(&mut result, lines);

        if self.dump {
            dump_thread(&result);
        }

        Ok(result)
    }

    fn parse_header(text: &str) -> Result<Thread, ParseError> {
        if let Some(caps) = BEGIN_UNMANAGED_THREAD_RE.captures(text) {
            Ok(Thread {
                kind: ThreadType::Unmanaged,
                name: caps[1].to_string(),
                sys_tid: Some(caps[2].parse()?),
                ..Default::default()
            })
        } else if let Some(caps) = BEGIN_MANAGED_THREAD_RE.captures(text) {
            Ok(Thread {
                kind: ThreadType::Managed,
                name: caps[1].to_string(),
                daemon: caps[2].trim() == "daemon",
                priority: caps[3].parse().ok(),
                tid: caps[4].parse().ok(),
                vm_state: Some(caps[5].to_string()),
                ..Default::default()
            })
        } else if let Some(caps) = BEGIN_NOT_ATTACHED_THREAD_RE.captures(text) {
            Ok(Thread {
                kind: ThreadType::Managed,
                name: caps[1].to_string(),
                daemon: caps[2].trim() == "daemon",
                priority: caps[3].parse().ok(),
                vm_state: Some(caps[4].to_string()),
                ..Default::default()
            })
        } else {
            Err(ParseError::UnrecognizedHeader(text.to_string()))
        }
    }

    fn parse_attributes<T: Line>(result: &mut Thread, lines: &mut Lines<T>) {
        while let Some(line) = lines.next() {
            let text = line.text();
            if let Some(caps) = HELD_MUTEXES_RE.captures(text) {
                result.attributes.push(caps[1].to_string());
                result.held_mutexes = Some(caps[2].to_string());
            } else if let Some(caps) = ATTR_RE.captures(text) {
                result.attributes.push(caps[1].to_string());
                if let Some(caps) = SYS_TID_ATTR_RE.captures(text) {
                    result.sys_tid = caps[1].parse().ok();
                }
                if STATE_ATTR_RE.is_match(text) {
                    result.runnable = true;
                }
            } else {
                lines.rewind();
                break;
            }
        }
    }

    fn parse_stack<T: Line>(result: &mut Thread, lines: &mut Lines<T>) {
        // index into result.frames of the frame that lock lines attach to
        let mut last_java: Option<usize> = None;

        while let Some(line) = lines.next() {
            let text = line.text();

            let frame = if let Some(caps) = NATIVE_RE.captures(text) {
                StackFrame::Native(NativeFrame {
                    text: text.to_string(),
                    library: caps[1].to_string(),
                    symbol: Some(caps[2].to_string()),
                    offset: caps[3].parse().ok(),
                })
            } else if let Some(caps) = NATIVE_NO_LOC_RE.captures(text) {
                StackFrame::Native(NativeFrame {
                    text: text.to_string(),
                    library: caps[1].to_string(),
                    symbol: group(&caps, 2).map(str::to_string),
                    offset: None,
                })
            } else if let Some(caps) = KERNEL_RE.captures(text) {
                StackFrame::Kernel(KernelFrame {
                    text: text.to_string(),
                    syscall: caps[1].to_string(),
                    offset0: u64::from_str_radix(&caps[2], 16).unwrap_or_default(),
                    offset1: u64::from_str_radix(&caps[3], 16).unwrap_or_default(),
                })
            } else if KERNEL_UNKNOWN_RE.is_match(text) {
                StackFrame::Other {
                    text: text.to_string(),
                }
            } else if let Some(caps) = JAVA_RE.captures(text) {
                StackFrame::Java(JavaFrame {
                    text: text.to_string(),
                    package: group(&caps, 1).map(str::to_string),
                    class: caps[2].to_string(),
                    method: caps[3].to_string(),
                    source_file: Some(caps[4].to_string()),
                    source_line: caps[5].parse().ok(),
                    language: Language::Java,
                    locks: vec![],
                })
            } else if let Some(caps) = JNI_RE.captures(text) {
                StackFrame::Java(JavaFrame {
                    text: text.to_string(),
                    package: group(&caps, 1).map(str::to_string),
                    class: caps[2].to_string(),
                    method: caps[3].to_string(),
                    source_file: None,
                    source_line: None,
                    language: Language::Jni,
                    locks: vec![],
                })
            } else if let Some(lock) = Self::parse_lock(text) {
                match last_java.and_then(|i| result.frames.get_mut(i)) {
                    Some(StackFrame::Java(frame)) => frame.locks.push(lock),
                    _ => trace!("lock without a java frame ==> [{}]", text),
                }
                continue;
            } else if let Some(caps) = NO_MANAGED_STACK_FRAME_RE.captures(text) {
                StackFrame::Other {
                    text: caps[1].to_string(),
                }
            } else if text.trim().is_empty() {
                break;
            } else if SECTION_MARKER_RE.is_match(text) {
                lines.rewind();
                break;
            } else {
                trace!("  other  ==> [{}]", text);
                StackFrame::Other {
                    text: text.to_string(),
                }
            };

            last_java = match frame {
                StackFrame::Java(_) => Some(result.frames.len()),
                _ => None,
            };
            result.frames.push(frame);
        }
    }

    fn parse_lock(text: &str) -> Option<Lock> {
        if let Some(caps) = LOCKED_RE.captures(text) {
            Some(lock_from(LockType::LOCKED, &caps))
        } else if let Some(caps) = WAITING_ON_RE.captures(text) {
            Some(lock_from(LockType::WAITING, &caps))
        } else if let Some(caps) = SLEEPING_ON_RE.captures(text) {
            Some(lock_from(LockType::SLEEPING, &caps))
        } else if let Some(caps) = WAITING_TO_LOCK_HELD_RE.captures(text) {
            let mut lock = lock_from(LockType::BLOCKED, &caps);
            lock.owner_tid = caps[4].parse().ok();
            Some(lock)
        } else if let Some(caps) = WAITING_TO_LOCK_RE.captures(text) {
            Some(lock_from(LockType::BLOCKED, &caps))
        } else if WAITING_TO_LOCK_UNKNOWN_RE.is_match(text) {
            Some(Lock::unknown(LockType::BLOCKED))
        } else {
            None
        }
    }
}

fn dump_thread(thread: &Thread) {
    debug!(
        "THREAD name={} daemon={} priority={:?} tid={:?} sysTid={:?} vmState={:?}",
        thread.name, thread.daemon, thread.priority, thread.tid, thread.sys_tid, thread.vm_state
    );
    for attr in &thread.attributes {
        debug!("  attr --> {}", attr);
    }
    debug!("  heldMutexes={:?}", thread.held_mutexes);
    for frame in &thread.frames {
        match frame {
            StackFrame::Native(f) => {
                debug!("  frame(native) ==> {} / {:?} / {:?}", f.library, f.symbol, f.offset)
            }
            StackFrame::Kernel(f) => {
                debug!("  frame(kernel) ==> {} / 0x{:x} / 0x{:x}", f.syscall, f.offset0, f.offset1)
            }
            StackFrame::Java(f) => {
                debug!(
                    "  frame(java)   ==> {} / {:?}:{:?} / {}",
                    f.full_name(),
                    f.source_file,
                    f.source_line,
                    f.language
                );
                for lock in &f.locks {
                    debug!(
                        "                --> {} / {:?} / {:?} / {:?}",
                        lock.kind, lock.address, lock.package, lock.class
                    );
                }
            }
            StackFrame::Other { text } => debug!("  frame(other)  ==> {}", text),
        }
    }
}
