/// Knobs for the parsers and the inspector. Handed down explicitly, there
/// are no process-wide toggles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectorConfig {
    /// Dump every parsed thread at debug level
    pub dump_threads: bool,
    /// Logcat timestamps carry no year, so this one is assumed
    pub log_year: i32,
    /// Cut the merged logcat down to the interval around the bugreport
    pub trim_logcat: bool,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            dump_threads: false,
            log_year: 1970,
            trim_logcat: false,
        }
    }
}
