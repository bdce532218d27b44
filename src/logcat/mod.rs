//! Logcat lines in the `threadtime` format.

use chrono::{NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use std::str::FromStr;
use tracing::{trace, warn};

use crate::{config::InspectorConfig, error::ParseError, lines::Line};

lazy_static! {
    pub static ref BUFFER_BEGIN_RE: Regex = Regex::new(r"^--------- beginning of (.*)$").unwrap();
    static ref THREADTIME_RE: Regex = Regex::new(
        r"^(\d\d)-(\d\d)\s+(\d\d):(\d\d):(\d\d)\.(\d{3})\s+(\d+)\s+(\d+)\s+([VDIWEFAS])\s+(.*?)\s*:(?: (.*))?$"
    ).unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[derive(strum::Display, strum::EnumString)]
pub enum LogLevel {
    #[strum(serialize = "V")]
    Verbose,
    #[strum(serialize = "D")]
    Debug,
    #[strum(serialize = "I")]
    Info,
    #[strum(serialize = "W")]
    Warn,
    #[strum(serialize = "E")]
    Error,
    #[strum(serialize = "F")]
    Fatal,
    #[strum(serialize = "A")]
    Assert,
    #[strum(serialize = "S")]
    Silent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogLine {
    pub lineno: usize,
    pub raw_text: String,
    /// The message, or the raw text when the line didn't parse
    pub text: String,
    pub time: Option<NaiveDateTime>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub level: Option<LogLevel>,
    pub tag: Option<String>,
    /// Set on `--------- beginning of <buffer>` markers
    pub buffer_begin: Option<String>,

    // filled in by the inspector
    pub process: Option<u32>,
    pub thread: Option<u32>,
    pub region_anr: bool,
    pub region_bugreport: bool,
}

impl Line for LogLine {
    fn text(&self) -> &str {
        &self.text
    }
}

impl LogLine {
    pub fn is(&self, tag: &str, level: LogLevel) -> bool {
        self.tag.as_deref() == Some(tag) && self.level == Some(level)
    }

    /// The marker put in front of the event log when it is merged.
    pub fn buffer_marker(buffer: &str, time: Option<NaiveDateTime>) -> Self {
        let text = format!("--------- beginning of {}", buffer);
        Self {
            raw_text: text.clone(),
            text,
            time,
            buffer_begin: Some(buffer.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Logcat {
    pub lines: Vec<LogLine>,
}

impl Logcat {
    /// The lines with exactly this tag and level, in order.
    pub fn filter(&self, tag: &str, level: LogLevel) -> Vec<LogLine> {
        self.lines
            .iter()
            .filter(|line| line.is(tag, level))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub struct LogcatParser {
    year: i32,
}

impl Default for LogcatParser {
    fn default() -> Self {
        Self::new(&InspectorConfig::default())
    }
}

impl LogcatParser {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            year: config.log_year,
        }
    }

    /// Parse a whole section. Lines that don't look like logcat are kept,
    /// untimed, so the line count matches the input.
    pub fn parse<I, S>(&self, lines: I) -> Logcat
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = lines
            .into_iter()
            .enumerate()
            .map(|(i, raw)| self.parse_line(i + 1, raw.as_ref()))
            .collect();
        Logcat { lines }
    }

    pub fn parse_text(&self, text: &str) -> Logcat {
        self.parse(text.lines().map(|l| l.trim_end_matches('\r')))
    }

    pub fn parse_line(&self, lineno: usize, raw: &str) -> LogLine {
        let mut line = LogLine {
            lineno,
            raw_text: raw.to_string(),
            text: raw.to_string(),
            ..Default::default()
        };

        if let Some(caps) = BUFFER_BEGIN_RE.captures(raw) {
            line.buffer_begin = Some(caps[1].to_string());
        } else if let Some(caps) = THREADTIME_RE.captures(raw) {
            match self.fill(&mut line, &caps) {
                Ok(()) => {}
                Err(e) => warn!("line {}: {}", lineno, e),
            }
        } else {
            trace!("not a logcat line [{}]", raw);
        }

        line
    }

    fn fill(&self, line: &mut LogLine, caps: &Captures) -> Result<(), ParseError> {
        line.time = Some(self.timestamp(caps)?);
        line.pid = Some(caps[7].parse()?);
        line.tid = Some(caps[8].parse()?);
        line.level = LogLevel::from_str(&caps[9]).ok();
        line.tag = Some(caps[10].to_string());
        line.text = caps.get(11).map_or("", |m| m.as_str()).to_string();
        Ok(())
    }

    fn timestamp(&self, caps: &Captures) -> Result<NaiveDateTime, ParseError> {
        let field = |i: usize| caps[i].parse::<u32>();
        let (month, day) = (field(1)?, field(2)?);
        let (hour, min, sec, milli) = (field(3)?, field(4)?, field(5)?, field(6)?);

        NaiveDate::from_ymd_opt(self.year, month, day)
            .and_then(|date| date.and_hms_milli_opt(hour, min, sec, milli))
            .ok_or_else(|| ParseError::OutOfRange(caps[0].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{LogLevel, LogcatParser};

    #[test]
    fn threadtime_line() {
        let line = LogcatParser::default().parse_line(
            3,
            "05-03 12:34:56.789  1234  5678 E ActivityManager: ANR in com.example.app",
        );

        assert_eq!(line.lineno, 3);
        assert_eq!(
            line.time.map(|t| t.to_string()).as_deref(),
            Some("1970-05-03 12:34:56.789")
        );
        assert_eq!(line.pid, Some(1234));
        assert_eq!(line.tid, Some(5678));
        assert_eq!(line.level, Some(LogLevel::Error));
        assert_eq!(line.tag.as_deref(), Some("ActivityManager"));
        assert_eq!(line.text, "ANR in com.example.app");
        assert!(line.is("ActivityManager", LogLevel::Error));
    }

    #[test]
    fn padded_tag_and_empty_message() {
        let parser = LogcatParser::default();
        let line = parser.parse_line(1, "05-03 12:34:56.789  1000  1000 I am_anr  : [0,1234,com.foo]");
        assert_eq!(line.tag.as_deref(), Some("am_anr"));
        assert_eq!(line.text, "[0,1234,com.foo]");

        let line = parser.parse_line(1, "05-03 12:34:56.789  1000  1000 D Empty:");
        assert_eq!(line.tag.as_deref(), Some("Empty"));
        assert_eq!(line.text, "");
    }

    #[test]
    fn markers_and_junk_are_untimed() {
        let logcat = LogcatParser::default().parse_text(concat!(
            "--------- beginning of system\n",
            "this is not logcat\n",
            "13-45 12:34:56.789  1  1 I Bad: month out of range\n",
        ));
        assert_eq!(logcat.lines.len(), 3);
        assert_eq!(logcat.lines[0].buffer_begin.as_deref(), Some("system"));
        assert!(logcat.lines.iter().all(|l| l.time.is_none()));
        assert_eq!(logcat.lines[2].lineno, 3);
    }

    #[test]
    fn filter_by_tag_and_level() {
        let logcat = LogcatParser::default().parse_text(concat!(
            "05-03 12:34:56.789  1  1 E ActivityManager: one\n",
            "05-03 12:34:56.789  1  1 I ActivityManager: two\n",
            "05-03 12:34:56.789  1  1 E Other: three\n",
            "05-03 12:34:56.790  1  1 E ActivityManager: four\n",
        ));
        let texts: Vec<_> = logcat
            .filter("ActivityManager", LogLevel::Error)
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert_eq!(texts, vec!["one", "four"]);
    }
}
