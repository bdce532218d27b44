//! Passes over the log buffers: filling in missing times, merging the system
//! and event logs, and tagging lines with what they belong to.

use chrono::{Duration, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::{
    anr::ANR_RE,
    bugreport::ProcessInfo,
    error::ParseError,
    logcat::{LogLine, Logcat},
};

lazy_static! {
    static ref INPUT_DISPATCHER_RE: Regex = Regex::new(
        r"^Application is not responding: .* It has been (\d+\.?\d*)ms since event, (\d+\.?\d*)ms since wait started"
    )
    .unwrap();
}

/// How much of the log to keep before the bugreport started.
pub const MAX_LINES_BEFORE_START: usize = 5000;
/// How far past the bugreport start to keep the log.
pub const SECONDS_AFTER_START: i64 = 3;

/// Anything over a year is not a real wait.
const MAX_PLAUSIBLE_WAIT_MS: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

/// Give untimed lines the time of the next timed line, and trailing untimed
/// lines the time of the last one.
pub fn invent_times(lines: &mut [LogLine]) {
    let mut next: Option<NaiveDateTime> = None;
    for line in lines.iter_mut().rev() {
        match line.time {
            Some(time) => next = Some(time),
            None => line.time = next,
        }
    }

    let mut last: Option<NaiveDateTime> = None;
    for line in lines.iter_mut() {
        match line.time {
            Some(time) => last = Some(time),
            None => line.time = last,
        }
    }
}

struct Merge {
    lines: Vec<LogLine>,
    seen_event: bool,
}

impl Merge {
    fn push(&mut self, line: &LogLine) {
        let mut line = line.clone();
        line.lineno = self.lines.len() + 1;
        self.lines.push(line);
    }

    fn push_event(&mut self, line: &LogLine) {
        if !self.seen_event {
            self.seen_event = true;
            let marker = LogLine::buffer_marker("event", line.time);
            self.push(&marker);
        }
        self.push(line);
    }
}

/// Interleave the system and event logs by time. The system log wins ties,
/// and untimed lines go out as soon as they're at the front.
pub fn merge(system: &[LogLine], event: &[LogLine]) -> Logcat {
    let mut merge = Merge {
        lines: Vec::with_capacity(system.len() + event.len() + 1),
        seen_event: false,
    };
    let mut system = system.iter().peekable();
    let mut event = event.iter().peekable();

    loop {
        let take_system = match (system.peek(), event.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(s), Some(e)) => match (s.time, e.time) {
                (None, _) => true,
                (_, None) => false,
                (Some(s), Some(e)) => s <= e,
            },
        };

        if take_system {
            if let Some(line) = system.next() {
                merge.push(line);
            }
        } else if let Some(line) = event.next() {
            merge.push_event(line);
        }
    }

    debug!("merged logcat has {} lines", merge.lines.len());
    Logcat { lines: merge.lines }
}

/// Lines worth pointing at: buffer boundaries and ActivityManager's ANR reports.
pub fn interesting_lines(logcat: &Logcat) -> Vec<usize> {
    logcat
        .lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            line.buffer_begin.is_some()
                || (line.tag.as_deref() == Some("ActivityManager") && ANR_RE.is_match(&line.text))
        })
        .map(|(i, _)| i)
        .collect()
}

/// Point each line at the process and thread that logged it, if we know them.
pub fn link_processes(logcat: &mut Logcat, processes: &BTreeMap<u32, ProcessInfo>) {
    for line in logcat.lines.iter_mut() {
        let Some(process) = line.pid.and_then(|pid| processes.get(&pid)) else {
            continue;
        };
        line.process = Some(process.pid);
        line.thread = line
            .tid
            .and_then(|tid| process.threads.get(&tid))
            .map(|thread| thread.tid);
    }
}

fn parse_wait(text: &str) -> Result<f64, ParseError> {
    let ms: f64 = text.parse()?;
    if !(0.0..MAX_PLAUSIBLE_WAIT_MS).contains(&ms) {
        return Err(ParseError::OutOfRange(format!("{}ms", text)));
    }
    Ok(ms)
}

fn wait_duration(ms: f64) -> Duration {
    let seconds = (ms / 1000.0) as i64;
    let millis = (ms % 1000.0).round() as i64;
    Duration::seconds(seconds) + Duration::milliseconds(millis)
}

fn mark_region(lines: &mut [LogLine], begin: NaiveDateTime, end: NaiveDateTime) -> usize {
    let mut count = 0;
    for line in lines.iter_mut() {
        if line.time.is_some_and(|t| begin <= t && t < end) {
            line.region_anr = true;
            count += 1;
        }
    }
    count
}

/// Mark the window InputDispatcher says it spent waiting on an unresponsive app.
pub fn mark_anr_regions(logcat: &mut Logcat) {
    let mut regions = Vec::new();

    for line in logcat.lines.iter() {
        if line.tag.as_deref() != Some("InputDispatcher") {
            continue;
        }
        let Some(caps) = INPUT_DISPATCHER_RE.captures(&line.text) else {
            continue;
        };
        let Some(end) = line.time else {
            continue;
        };

        match parse_wait(&caps[2]) {
            Ok(ms) => regions.push((end - wait_duration(ms), end)),
            Err(e) => warn!("line {}: bad wait time: {}", line.lineno, e),
        }
    }

    for (begin, end) in regions {
        let count = mark_region(&mut logcat.lines, begin, end);
        debug!("anr region {} .. {}: {} lines", begin, end, count);
    }
}

pub fn mark_bugreport_region(logcat: &mut Logcat, start: NaiveDateTime, end: NaiveDateTime) {
    for line in logcat.lines.iter_mut() {
        if line.time.is_some_and(|t| start <= t && t < end) {
            line.region_bugreport = true;
        }
    }
}

/// Keep at most [MAX_LINES_BEFORE_START] lines before `start`, and nothing
/// more than [SECONDS_AFTER_START] after it.
pub fn trim(logcat: &mut Logcat, start: NaiveDateTime) {
    let cutoff = start + Duration::seconds(SECONDS_AFTER_START);
    let lines = &mut logcat.lines;

    let end = lines
        .iter()
        .rposition(|l| l.time.map_or(true, |t| t <= cutoff))
        .map_or(0, |i| i + 1);
    let first_after_start = lines[..end]
        .iter()
        .position(|l| l.time.is_some_and(|t| t >= start))
        .unwrap_or(end);
    let begin = first_after_start.saturating_sub(MAX_LINES_BEFORE_START);

    debug!(
        "trimming logcat to lines {}..{} of {}",
        begin,
        end,
        lines.len()
    );
    lines.truncate(end);
    lines.drain(..begin);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logcat::LogcatParser;

    fn parse(text: &str) -> Logcat {
        LogcatParser::default().parse_text(text)
    }

    fn time(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.3f").unwrap()
    }

    #[test]
    fn invented_times_come_from_the_next_line() {
        let mut logcat = parse(concat!(
            "junk\n",
            "05-03 12:00:01.000  1  1 I A: one\n",
            "more junk\n",
            "05-03 12:00:02.000  1  1 I A: two\n",
            "trailing junk\n",
        ));
        invent_times(&mut logcat.lines);

        let times: Vec<_> = logcat.lines.iter().map(|l| l.time).collect();
        assert_eq!(
            times,
            vec![
                Some(time("1970-05-03 12:00:01.000")),
                Some(time("1970-05-03 12:00:01.000")),
                Some(time("1970-05-03 12:00:02.000")),
                Some(time("1970-05-03 12:00:02.000")),
                Some(time("1970-05-03 12:00:02.000")),
            ]
        );
    }

    #[test]
    fn nothing_to_invent_from() {
        let mut logcat = parse("junk\nmore junk\n");
        invent_times(&mut logcat.lines);
        assert!(logcat.lines.iter().all(|l| l.time.is_none()));
    }

    #[test]
    fn merge_orders_by_time() {
        let system = parse(concat!(
            "05-03 12:00:01.000  1  1 I S: s1\n",
            "05-03 12:00:03.000  1  1 I S: s3\n",
        ));
        let event = parse(concat!(
            "05-03 12:00:02.000  1  1 I E: e2\n",
            "05-03 12:00:03.000  1  1 I E: e3\n",
        ));

        let merged = merge(&system.lines, &event.lines);
        let texts: Vec<_> = merged.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["s1", "--------- beginning of event", "e2", "s3", "e3"]
        );

        let linenos: Vec<_> = merged.lines.iter().map(|l| l.lineno).collect();
        assert_eq!(linenos, vec![1, 2, 3, 4, 5]);

        let marker = &merged.lines[1];
        assert_eq!(marker.buffer_begin.as_deref(), Some("event"));
        assert_eq!(marker.time, Some(time("1970-05-03 12:00:02.000")));

        // the inputs are left alone
        assert_eq!(event.lines[0].lineno, 1);
    }

    #[test]
    fn merge_marks_event_log_that_has_its_own_marker() {
        let system = parse("05-03 12:00:01.000  1  1 I S: s1\n");
        let mut event = parse(concat!(
            "--------- beginning of events\n",
            "05-03 12:00:02.000  1  1 I E: e2\n",
        ));
        invent_times(&mut event.lines);

        let merged = merge(&system.lines, &event.lines);
        let texts: Vec<_> = merged.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "s1",
                "--------- beginning of event",
                "--------- beginning of events",
                "e2"
            ]
        );
        assert_eq!(merged.lines[1].time, Some(time("1970-05-03 12:00:02.000")));
    }

    #[test]
    fn merge_marks_untimed_event_lines_too() {
        let system = parse("05-03 12:00:01.000  1  1 I S: s1\n");
        let event = parse(concat!(
            "--------- beginning of events\n",
            "05-03 12:00:02.000  1  1 I E: e2\n",
        ));

        let merged = merge(&system.lines, &event.lines);
        let texts: Vec<_> = merged.lines.iter().map(|l| l.text.as_str()).collect();
        // untimed lines go out as soon as they reach the front
        assert_eq!(
            texts,
            vec![
                "--------- beginning of event",
                "--------- beginning of events",
                "s1",
                "e2"
            ]
        );
        assert_eq!(merged.lines[0].time, None);
    }

    #[test]
    fn merge_with_empty_event_log_keeps_system_log() {
        let system = parse(concat!(
            "05-03 12:00:02.000  1  1 I S: b\n",
            "junk\n",
            "05-03 12:00:01.000  1  1 I S: a\n",
        ));
        let shifted: Vec<_> = system
            .lines
            .iter()
            .map(|l| LogLine {
                lineno: l.lineno + 10,
                ..l.clone()
            })
            .collect();

        let merged = merge(&shifted, &[]);
        let got: Vec<_> = merged
            .lines
            .iter()
            .map(|l| (l.lineno, l.text.as_str(), l.time))
            .collect();
        assert_eq!(
            got,
            vec![
                (1, "b", Some(time("1970-05-03 12:00:02.000"))),
                (2, "junk", None),
                (3, "a", Some(time("1970-05-03 12:00:01.000"))),
            ]
        );
        assert!(merged.lines.iter().all(|l| l.buffer_begin.is_none()));
    }

    #[test]
    fn merge_event_only() {
        let event = parse("05-03 12:00:02.000  1  1 I E: e2\n");
        let merged = merge(&[], &event.lines);
        assert_eq!(merged.lines.len(), 2);
        assert_eq!(merged.lines[0].buffer_begin.as_deref(), Some("event"));
    }

    #[test]
    fn interesting_lines_are_indices() {
        let logcat = parse(concat!(
            "--------- beginning of system\n",
            "05-03 12:00:01.000  1  1 I A: nothing\n",
            "05-03 12:00:02.000  1  1 E ActivityManager: ANR in com.foo\n",
            "05-03 12:00:02.000  1  1 E Other: ANR in com.foo\n",
        ));
        assert_eq!(interesting_lines(&logcat), vec![0, 2]);
    }

    #[test]
    fn links_known_processes_and_threads() {
        let mut logcat = parse(concat!(
            "05-03 12:00:01.000  10  11 I A: known thread\n",
            "05-03 12:00:01.000  10  12 I A: unknown thread\n",
            "05-03 12:00:01.000  20  21 I A: unknown process\n",
        ));
        let mut info = ProcessInfo::new(10, "com.foo");
        info.threads.insert(
            11,
            crate::bugreport::ThreadInfo {
                pid: 10,
                tid: 11,
                name: "main".to_string(),
            },
        );
        let processes = BTreeMap::from([(10, info)]);

        link_processes(&mut logcat, &processes);
        let links: Vec<_> = logcat.lines.iter().map(|l| (l.process, l.thread)).collect();
        assert_eq!(
            links,
            vec![(Some(10), Some(11)), (Some(10), None), (None, None)]
        );
    }

    #[test]
    fn anr_region_from_input_dispatcher() {
        let mut logcat = parse(concat!(
            "05-03 12:00:00.000  1  1 I A: before\n",
            "05-03 12:00:03.000  1  1 I A: start of wait\n",
            "05-03 12:00:06.000  1  1 I A: during\n",
            "05-03 12:00:08.000  1  2 I InputDispatcher: Application is not responding: Window{1 com.foo}.  It has been 5000.5ms since event, 5000.2ms since wait started.  Reason: foo\n",
            "05-03 12:00:09.000  1  1 I A: after\n",
        ));
        mark_anr_regions(&mut logcat);

        let marked: Vec<_> = logcat.lines.iter().map(|l| l.region_anr).collect();
        assert_eq!(marked, vec![false, true, true, false, false]);
    }

    #[test]
    fn quoted_not_responding_message_opens_no_region() {
        let mut logcat = parse(concat!(
            "05-03 12:00:06.000  1  1 I A: during\n",
            "05-03 12:00:08.000  1  2 I InputDispatcher: Dropped event, earlier: Application is not responding: Window{1 com.foo}.  It has been 5000.0ms since event, 5000.0ms since wait started.\n",
        ));
        mark_anr_regions(&mut logcat);
        assert!(logcat.lines.iter().all(|l| !l.region_anr));
    }

    #[test]
    fn bugreport_region_is_half_open() {
        let mut logcat = parse(concat!(
            "05-03 12:00:00.000  1  1 I A: before\n",
            "05-03 12:00:01.000  1  1 I A: start\n",
            "05-03 12:00:02.000  1  1 I A: end\n",
        ));
        mark_bugreport_region(
            &mut logcat,
            time("1970-05-03 12:00:01.000"),
            time("1970-05-03 12:00:02.000"),
        );
        let marked: Vec<_> = logcat.lines.iter().map(|l| l.region_bugreport).collect();
        assert_eq!(marked, vec![false, true, false]);
    }

    #[test]
    fn trim_around_start() {
        let mut text = String::new();
        for i in 0..(MAX_LINES_BEFORE_START + 10) {
            text.push_str(&format!("05-03 11:00:00.000  1  1 I A: old {}\n", i));
        }
        text.push_str("05-03 12:00:00.000  1  1 I A: start\n");
        text.push_str("05-03 12:00:03.000  1  1 I A: just in\n");
        text.push_str("05-03 12:00:03.001  1  1 I A: too late\n");
        let mut logcat = parse(&text);

        trim(&mut logcat, time("1970-05-03 12:00:00.000"));

        assert_eq!(logcat.lines.len(), MAX_LINES_BEFORE_START + 2);
        assert_eq!(logcat.lines[0].text, "old 10");
        assert_eq!(logcat.lines.last().map(|l| l.text.as_str()), Some("just in"));
    }
}
