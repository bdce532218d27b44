//! A condensed view of an inspected bugreport, for printing or for JSON.

use chrono::NaiveDateTime;
use itertools::Itertools;
use serde::Serialize;
use std::fmt;

use crate::{
    bugreport::Bugreport,
    stacks::{Process, Thread},
};

#[derive(Debug, Serialize)]
pub struct ThreadSummary {
    pub name: String,
    pub tid: Option<u32>,
    pub sys_tid: Option<u32>,
    pub state: Option<String>,
    pub blocked: bool,
    pub inbound_binder: Option<String>,
    pub outbound_binder: Option<String>,
    /// Top frame, if any
    pub top: Option<String>,
}

impl From<&Thread> for ThreadSummary {
    fn from(thread: &Thread) -> Self {
        Self {
            name: thread.name.clone(),
            tid: thread.tid,
            sys_tid: thread.sys_tid,
            state: thread.vm_state.clone(),
            blocked: thread.blocked,
            inbound_binder: thread.inbound_binder.as_ref().map(ToString::to_string),
            outbound_binder: thread.outbound_binder.as_ref().map(ToString::to_string),
            top: thread.frames.first().map(|f| f.text().trim().to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub cmd_line: Option<String>,
    pub threads: Vec<ThreadSummary>,
}

impl From<&Process> for ProcessSummary {
    fn from(process: &Process) -> Self {
        Self {
            pid: process.pid,
            cmd_line: process.cmd_line.clone(),
            threads: process.threads.iter().map(ThreadSummary::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogLineSummary {
    pub lineno: usize,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AnrSummary {
    pub process: String,
    pub component: Option<String>,
    pub pid: Option<u32>,
    pub reason: Option<String>,
    pub time: Option<NaiveDateTime>,
    pub interesting_processes: Vec<ProcessSummary>,
    pub deadlocked_processes: Vec<ProcessSummary>,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub known_processes: usize,
    pub anr: Option<AnrSummary>,
    pub interesting_log_lines: Vec<LogLineSummary>,
    pub anr_region_lines: usize,
    pub bugreport_region_lines: usize,
}

impl Summary {
    pub fn from_bugreport(bugreport: &Bugreport) -> Self {
        let anr = bugreport.anr.as_ref().map(|anr| {
            let summarize = |processes: &[Process]| {
                processes.iter().map(ProcessSummary::from).collect_vec()
            };
            let traces = anr.vm_traces.as_ref();
            AnrSummary {
                process: anr.process.clone(),
                component: anr.component.clone(),
                pid: anr.pid,
                reason: anr.reason.clone(),
                time: anr.time,
                interesting_processes: traces
                    .map(|t| summarize(&t.interesting_processes[..]))
                    .unwrap_or_default(),
                deadlocked_processes: traces
                    .map(|t| summarize(&t.deadlocked_processes[..]))
                    .unwrap_or_default(),
            }
        });

        let lines = bugreport.logcat.as_ref().map_or(&[][..], |l| &l.lines[..]);
        let interesting_log_lines = bugreport
            .interesting_log_lines
            .iter()
            .filter_map(|&i| lines.get(i))
            .map(|line| LogLineSummary {
                lineno: line.lineno,
                text: line.raw_text.clone(),
            })
            .collect();

        Self {
            start_time: bugreport.start_time,
            end_time: bugreport.end_time,
            known_processes: bugreport.all_known_processes.len(),
            anr,
            interesting_log_lines,
            anr_region_lines: lines.iter().filter(|l| l.region_anr).count(),
            bugreport_region_lines: lines.iter().filter(|l| l.region_bugreport).count(),
        }
    }
}

fn write_processes(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    processes: &[ProcessSummary],
) -> fmt::Result {
    if processes.is_empty() {
        return Ok(());
    }
    writeln!(f, "{}:", title)?;
    for process in processes {
        writeln!(
            f,
            "  pid {} {}",
            process.pid,
            process.cmd_line.as_deref().unwrap_or("?")
        )?;
        for thread in &process.threads {
            write!(
                f,
                "    \"{}\" tid={} {}",
                thread.name,
                thread.tid.map_or("?".to_string(), |t| t.to_string()),
                thread.state.as_deref().unwrap_or("")
            )?;
            if thread.blocked {
                write!(f, " BLOCKED")?;
            }
            if let Some(call) = &thread.outbound_binder {
                write!(f, " -> {}", call)?;
            }
            if let Some(call) = &thread.inbound_binder {
                write!(f, " <- {}", call)?;
            }
            writeln!(f)?;
            if let Some(top) = &thread.top {
                writeln!(f, "        {}", top)?;
            }
        }
    }
    Ok(())
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            writeln!(f, "bugreport {} .. {}", start, end)?;
        }
        writeln!(f, "{} known processes", self.known_processes)?;

        match &self.anr {
            Some(anr) => {
                write!(f, "ANR in {}", anr.process)?;
                if let Some(pid) = anr.pid {
                    write!(f, " (pid {})", pid)?;
                }
                if let Some(time) = anr.time {
                    write!(f, " at {}", time)?;
                }
                writeln!(f)?;
                if let Some(reason) = &anr.reason {
                    writeln!(f, "reason: {}", reason)?;
                }
                write_processes(f, "deadlocked", &anr.deadlocked_processes)?;
                write_processes(f, "interesting", &anr.interesting_processes)?;
            }
            None => writeln!(f, "no ANR found")?,
        }

        if !self.interesting_log_lines.is_empty() {
            writeln!(
                f,
                "log lines ({} in the anr window, {} during the bugreport):",
                self.anr_region_lines, self.bugreport_region_lines
            )?;
            for line in &self.interesting_log_lines {
                writeln!(f, "  {:>6}: {}", line.lineno, line.text)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Summary;
    use crate::bugreport::Bugreport;
    use crate::logcat::LogcatParser;

    #[test]
    fn empty_bugreport() {
        let summary = Summary::from_bugreport(&Bugreport::default());
        assert!(summary.anr.is_none());
        assert!(summary.interesting_log_lines.is_empty());
        assert_eq!(summary.to_string(), "0 known processes\nno ANR found\n");
    }

    #[test]
    fn interesting_lines_resolve_to_text() {
        let logcat = LogcatParser::default().parse_text(concat!(
            "--------- beginning of system\n",
            "05-03 12:00:01.000  1  1 I A: boring\n",
        ));
        let bugreport = Bugreport {
            logcat: Some(logcat),
            interesting_log_lines: vec![0, 7],
            ..Default::default()
        };

        let summary = Summary::from_bugreport(&bugreport);
        assert_eq!(summary.interesting_log_lines.len(), 1);
        assert_eq!(summary.interesting_log_lines[0].lineno, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json["interesting_log_lines"][0]["text"],
            "--------- beginning of system"
        );
    }
}
