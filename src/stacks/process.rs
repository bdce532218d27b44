//! Parser for one `----- pid N at ... -----` section of a VM traces dump.

use chrono::NaiveDateTime;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, trace, warn};

use super::{thread::is_thread_header, Process, ThreadSnapshotParser};
use crate::{
    config::InspectorConfig,
    error::ParseError,
    lines::{Line, Lines},
};

lazy_static! {
    pub static ref BEGIN_PROCESS_RE: Regex =
        Regex::new(r"^----- pid (\d+) at (\d{4}-\d\d-\d\d \d\d:\d\d:\d\d) -----$").unwrap();
    pub static ref END_PROCESS_RE: Regex = Regex::new(r"^----- end (\d+) -----$").unwrap();
    static ref CMD_LINE_RE: Regex = Regex::new(r"^Cmd line: (.*)$").unwrap();
}

pub const PROCESS_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Threads,
}

#[derive(Debug, Default)]
pub struct ProcessSnapshotParser {
    threads: ThreadSnapshotParser,
}

impl ProcessSnapshotParser {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            threads: ThreadSnapshotParser::new(config),
        }
    }

    /// Parse through the end marker of the next process (or the end of input).
    ///
    /// Always returns what was read locally; merging repeated sightings of a
    /// pid is the caller's business.
    pub fn parse<T: Line>(&self, lines: &mut Lines<T>) -> Result<Process, ParseError> {
        let mut result: Option<Process> = None;
        let mut state = State::Initial;

        while let Some(line) = lines.next() {
            let text = line.text();

            if let Some(caps) = BEGIN_PROCESS_RE.captures(text) {
                if result.is_some() {
                    // next process started without an end marker
                    lines.rewind();
                    break;
                }
                let date = match NaiveDateTime::parse_from_str(&caps[2], PROCESS_DATE_FORMAT) {
                    Ok(date) => Some(date),
                    Err(e) => {
                        warn!("pid {}: {}", &caps[1], ParseError::from(e));
                        None
                    }
                };
                result = Some(Process {
                    pid: caps[1].parse()?,
                    date,
                    ..Default::default()
                });
                continue;
            }

            if END_PROCESS_RE.is_match(text) {
                break;
            }

            let Some(process) = result.as_mut() else {
                trace!("skipping preamble [{}]", text);
                continue;
            };

            match state {
                State::Initial => {
                    if let Some(caps) = CMD_LINE_RE.captures(text) {
                        process.cmd_line = Some(caps[1].to_string());
                    } else if is_thread_header(text) {
                        lines.rewind();
                        state = State::Threads;
                    }
                }
                State::Threads => {
                    if !is_thread_header(text) {
                        trace!("skipping between threads [{}]", text);
                        continue;
                    }
                    lines.rewind();
                    match self.threads.parse(lines) {
                        Ok(thread) => process.threads.push(thread),
                        Err(e) => {
                            // TODO: backtrack and retry from the next header instead of giving up on the rest of this process
                            debug!("giving up on threads of pid {}: {}", process.pid, e);
                            break;
                        }
                    }
                }
            }
        }

        result.ok_or(ParseError::MissingProcessHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::ProcessSnapshotParser;
    use crate::error::ParseError;
    use crate::lines::{Lines, TextLine};

    const DUMP: &str = r#"
----- pid 1234 at 2016-05-03 12:34:56 -----
Cmd line: com.example.app
Build fingerprint: 'google/foo/bar:7.0/NRD90M/1234:userdebug/dev-keys'

DALVIK THREADS (2):
"main" prio=5 tid=1 Native
  | group="main" sCount=1 dsCount=0 obj=0x75c0e1d8 self=0x7f8e2a6400
  | sysTid=1234 nice=-10 cgrp=default sched=0/0 handle=0x7f92d1da98
  at android.os.MessageQueue.nativePollOnce(Native method)
  at android.os.Looper.loop(Looper.java:154)

"Signal Catcher" daemon prio=5 tid=2 Runnable
  | sysTid=1240 nice=0 cgrp=default sched=0/0 handle=0x7f7b9ff450
  | state=R schedstat=( 0 0 0 ) utm=0 stm=0 core=1 HZ=100
  native: #00 pc 000000000035a5c4  /system/lib64/libart.so (art::DumpNativeStack+220)

----- end 1234 -----

----- pid 99 at 2016-05-03 12:34:57 -----
"#;

    #[test]
    fn parses_one_process() {
        let lines = TextLine::split(DUMP);
        let mut cursor = Lines::new(&lines);
        let process = ProcessSnapshotParser::default().parse(&mut cursor).unwrap();

        assert_eq!(process.pid, 1234);
        assert_eq!(process.cmd_line.as_deref(), Some("com.example.app"));
        assert_eq!(
            process.date.map(|d| d.to_string()).as_deref(),
            Some("2016-05-03 12:34:56")
        );
        assert_eq!(process.threads.len(), 2);
        assert_eq!(process.threads[0].name, "main");
        assert_eq!(process.threads[0].sys_tid, Some(1234));
        assert_eq!(process.threads[0].frames.len(), 2);
        assert_eq!(process.threads[1].name, "Signal Catcher");
        assert!(process.threads[1].runnable);

        // the next process is left for the next call
        let next = ProcessSnapshotParser::default().parse(&mut cursor).unwrap();
        assert_eq!(next.pid, 99);
        assert!(next.threads.is_empty());
    }

    #[test]
    fn missing_end_marker() {
        let lines = TextLine::split(concat!(
            "----- pid 1 at 2016-05-03 12:34:56 -----\n",
            "\"main\" prio=5 tid=1 Native\n",
            "  at a.B.c(B.java:1)\n",
            "----- pid 2 at 2016-05-03 12:34:56 -----\n",
        ));
        let mut cursor = Lines::new(&lines);
        let parser = ProcessSnapshotParser::default();

        let first = parser.parse(&mut cursor).unwrap();
        assert_eq!(first.pid, 1);
        assert_eq!(first.threads.len(), 1);
        assert_eq!(first.threads[0].frames.len(), 1);

        assert_eq!(parser.parse(&mut cursor).unwrap().pid, 2);
        assert_eq!(
            parser.parse(&mut cursor),
            Err(ParseError::MissingProcessHeader)
        );
    }
}
