use std::{fs, path::PathBuf};

use anrtrace::{
    bugreport::Bugreport,
    config::InspectorConfig,
    inspector,
    logcat::LogcatParser,
    report::Summary,
    stacks::{process::PROCESS_DATE_FORMAT, VmTracesParser},
};
use anyhow::Context;
use chrono::NaiveDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(argh::FromArgs)]
/// inspect the stack traces and logs of an android bugreport for ANRs
struct Arguments {
    #[argh(option, short = 's')]
    /// system log, in threadtime format
    system_log: Option<PathBuf>,

    #[argh(option, short = 'e')]
    /// event log, in threadtime format
    event_log: Option<PathBuf>,

    #[argh(option, short = 't')]
    /// vm traces dumped while taking the bugreport
    traces_just_now: Option<PathBuf>,

    #[argh(option, short = 'a')]
    /// vm traces dumped at the last ANR
    traces_last_anr: Option<PathBuf>,

    #[argh(option, default = "1970")]
    /// year to put on log timestamps, which don't carry one
    year: i32,

    #[argh(option, from_str_fn(parse_time))]
    /// when the bugreport started, as "YYYY-MM-DD HH:MM:SS"
    start: Option<NaiveDateTime>,

    #[argh(option, from_str_fn(parse_time))]
    /// when the bugreport finished, as "YYYY-MM-DD HH:MM:SS"
    end: Option<NaiveDateTime>,

    #[argh(switch)]
    /// print the summary as json
    json: bool,

    #[argh(switch)]
    /// log every parsed thread at debug level
    dump_threads: bool,

    #[argh(switch)]
    /// drop log lines far away from the bugreport start
    trim_logcat: bool,
}

fn parse_time(value: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, PROCESS_DATE_FORMAT).map_err(|e| e.to_string())
}

fn read(path: &Option<PathBuf>) -> anyhow::Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Some(text))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Arguments = argh::from_env();
    let config = InspectorConfig {
        dump_threads: args.dump_threads,
        log_year: args.year,
        trim_logcat: args.trim_logcat,
    };

    let logs = LogcatParser::new(&config);
    let traces = VmTracesParser::new(&config);

    let mut bugreport = Bugreport {
        start_time: args.start,
        end_time: args.end,
        ..Default::default()
    };
    if let Some(text) = read(&args.system_log)? {
        bugreport.system_log = logs.parse_text(&text);
    }
    if let Some(text) = read(&args.event_log)? {
        bugreport.event_log = logs.parse_text(&text);
    }
    bugreport.vm_traces_just_now = read(&args.traces_just_now)?.map(|t| traces.parse_text(&t));
    bugreport.vm_traces_last_anr = read(&args.traces_last_anr)?.map(|t| traces.parse_text(&t));

    inspector::inspect(&mut bugreport, &config);
    info!("inspected {} processes", bugreport.all_known_processes.len());

    let summary = Summary::from_bugreport(&bugreport);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary);
    }

    Ok(())
}
