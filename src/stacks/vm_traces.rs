use tracing::{debug, trace};

use super::{process::BEGIN_PROCESS_RE, ProcessSnapshotParser, VmTraces};
use crate::{
    config::InspectorConfig,
    lines::{Line, Lines},
};

/// Parses every process in one traces dump.
#[derive(Debug, Default)]
pub struct VmTracesParser {
    processes: ProcessSnapshotParser,
}

impl VmTracesParser {
    pub fn new(config: &InspectorConfig) -> Self {
        Self {
            processes: ProcessSnapshotParser::new(config),
        }
    }

    pub fn parse<T: Line>(&self, lines: &mut Lines<T>) -> VmTraces {
        let mut result = VmTraces::default();

        while let Some(line) = lines.peek() {
            if !BEGIN_PROCESS_RE.is_match(line.text()) {
                trace!("skipping [{}]", line.text());
                lines.next();
                continue;
            }

            match self.processes.parse(lines) {
                Ok(process) => result.processes.push(process),
                Err(e) => debug!("dropping process: {}", e),
            }
        }

        debug!("parsed {} processes", result.processes.len());
        result
    }

    pub fn parse_text(&self, text: &str) -> VmTraces {
        let lines = crate::lines::TextLine::split(text);
        self.parse(&mut Lines::new(&lines))
    }
}
