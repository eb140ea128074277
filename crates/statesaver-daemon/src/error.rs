//! Error types for the daemon binary.

/// Top-level error for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: statesaver_core::ConfigError,
    },

    /// Reading from stdin failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A command line could not be understood.
    #[error("bad command `{line}`: {message}")]
    Command {
        /// The offending line.
        line: String,
        /// What was wrong with it.
        message: String,
    },

    /// The control loop stopped before the daemon did.
    #[error("control loop is not running: {message}")]
    ControlClosed {
        /// Description of the channel failure.
        message: String,
    },
}
