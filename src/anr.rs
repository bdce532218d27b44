//! ANR reports as ActivityManager logs them:
//!
//! ```text
//! E ActivityManager: ANR in com.example.app (com.example.app/.MainActivity)
//! E ActivityManager: PID: 1234
//! E ActivityManager: Reason: Input dispatching timed out (...)
//! E ActivityManager: Load: 21.5 / 20.3 / 19.8
//! E ActivityManager: CPU usage from 0ms to 8597ms later: ...
//! ```

use chrono::NaiveDateTime;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::{
    lines::{Line, Lines},
    logcat::LogLine,
    stacks::VmTraces,
};

lazy_static! {
    pub static ref ANR_RE: Regex = Regex::new(r"^ANR in (\S+)(?: \((\S+)\))?.*$").unwrap();
    static ref PID_RE: Regex = Regex::new(r"^PID: (\d+)$").unwrap();
    static ref REASON_RE: Regex = Regex::new(r"^Reason: (.*)$").unwrap();
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Anr {
    pub process: String,
    pub component: Option<String>,
    pub pid: Option<u32>,
    pub reason: Option<String>,
    pub time: Option<NaiveDateTime>,
    /// Everything else in the report (load, cpu usage), untouched
    pub details: Vec<String>,
    #[serde(skip)]
    pub vm_traces: Option<VmTraces>,
}

#[derive(Debug, Default)]
pub struct AnrParser {}

impl AnrParser {
    /// Parse every ANR report out of ActivityManager error lines. Lines are
    /// only attributed to a report when they come from the same thread as
    /// its `ANR in` line.
    pub fn parse(&self, lines: &mut Lines<LogLine>) -> Vec<Anr> {
        let mut result = Vec::new();
        let mut current: Option<(Anr, Option<u32>)> = None;

        for line in lines {
            let text = line.text();

            if let Some(caps) = ANR_RE.captures(text) {
                if let Some((anr, _)) = current.take() {
                    result.push(anr);
                }
                let anr = Anr {
                    process: caps[1].to_string(),
                    component: caps.get(2).map(|m| m.as_str().to_string()),
                    time: line.time,
                    ..Default::default()
                };
                current = Some((anr, line.tid));
                continue;
            }

            let Some((anr, tid)) = current.as_mut() else {
                continue;
            };
            if *tid != line.tid {
                continue;
            }

            if let Some(caps) = PID_RE.captures(text) {
                anr.pid = caps[1].parse().ok();
            } else if let Some(caps) = REASON_RE.captures(text) {
                anr.reason = Some(caps[1].to_string());
            } else {
                anr.details.push(text.to_string());
            }
        }

        if let Some((anr, _)) = current {
            result.push(anr);
        }

        debug!("found {} anrs", result.len());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::AnrParser;
    use crate::lines::Lines;
    use crate::logcat::LogcatParser;

    #[test]
    fn parses_report() {
        let logcat = LogcatParser::default().parse_text(concat!(
            "05-03 12:34:56.789  1000  1200 E ActivityManager: ANR in com.example.app (com.example.app/.MainActivity)\n",
            "05-03 12:34:56.789  1000  1200 E ActivityManager: PID: 1234\n",
            "05-03 12:34:56.789  1000  1300 E ActivityManager: Unrelated noise\n",
            "05-03 12:34:56.789  1000  1200 E ActivityManager: Reason: Input dispatching timed out\n",
            "05-03 12:34:56.789  1000  1200 E ActivityManager: Load: 1.0 / 2.0 / 3.0\n",
            "05-03 12:35:10.000  1000  1200 E ActivityManager: ANR in com.other\n",
            "05-03 12:35:10.000  1000  1200 E ActivityManager: PID: 99\n",
        ));

        let anrs = AnrParser::default().parse(&mut Lines::new(&logcat.lines));
        assert_eq!(anrs.len(), 2);

        assert_eq!(anrs[0].process, "com.example.app");
        assert_eq!(
            anrs[0].component.as_deref(),
            Some("com.example.app/.MainActivity")
        );
        assert_eq!(anrs[0].pid, Some(1234));
        assert_eq!(anrs[0].reason.as_deref(), Some("Input dispatching timed out"));
        assert_eq!(anrs[0].details, vec!["Load: 1.0 / 2.0 / 3.0"]);
        assert!(anrs[0].time.is_some());

        assert_eq!(anrs[1].process, "com.other");
        assert_eq!(anrs[1].component, None);
        assert_eq!(anrs[1].pid, Some(99));
    }
}
