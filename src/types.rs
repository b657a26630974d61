#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// How a dataset's modification time is compared against the watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SelectionRule {
    /// Select datasets modified strictly before the watermark. This is the
    /// behaviour existing deployments rely on, even though it re-selects
    /// unchanged datasets on every run.
    #[default]
    #[value(name = "modified-before")]
    ModifiedBefore,
    /// Select datasets modified at or after the watermark.
    #[value(name = "modified-since")]
    ModifiedSince,
}

/// How output filenames are derived from a dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FilenamePolicy {
    /// `<Title_With_Underscores>.csv`
    #[default]
    #[value(name = "title")]
    Title,
    /// `<Title_With_Underscores>_<identifier>.csv`
    #[value(name = "title-id")]
    TitleId,
}
