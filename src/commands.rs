//! CLI command definitions
//!
//! Defines the clap commands for the testbed CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the whole pipeline: bring the environment up, test, tear down
    Run {
        /// Run configuration (default: ./testbed.toml, then the user config)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Start the secondary service even if the config leaves it disabled
        #[arg(long)]
        secondary: bool,

        /// Do not run the install command
        #[arg(long)]
        skip_install: bool,

        /// Write the run report as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Kill whatever is bound to the given TCP ports
    ReclaimPort {
        #[arg(required = true, num_args = 1..)]
        ports: Vec<u16>,
    },

    /// List the processes bound to a TCP port
    PortOwners { port: u16 },

    /// Follow a log file until a marker appears and print its value
    Extract {
        /// Log file to follow (may not exist yet)
        #[arg(long)]
        file: PathBuf,

        /// Literal label; the value is the text after it
        #[arg(long, conflicts_with = "regex")]
        label: Option<String>,

        /// Regex with a `value` group or one capture group
        #[arg(long)]
        regex: Option<String>,

        /// Seconds to wait before giving up
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Log in and print the session token
    Login {
        /// Base URL of the service (the request goes to <URL>/login)
        #[arg(long)]
        url: String,

        #[arg(long, default_value = "admin")]
        username: String,

        #[arg(long)]
        password: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Apply mutations to a JSON or YAML template and write the result
    ///
    /// Mutations apply in the order: --ensure, --merge, --set.
    Synthesize {
        #[arg(long)]
        template: PathBuf,

        /// Output file; its extension picks the output format
        #[arg(long)]
        output: PathBuf,

        /// Set a scalar: path=value (value is JSON, or a plain string)
        #[arg(long, value_name = "PATH=VALUE")]
        set: Vec<String>,

        /// Merge entries into a map: path={"key": ...}
        #[arg(long, value_name = "PATH=OBJECT")]
        merge: Vec<String>,

        /// Make sure a map exists at the path
        #[arg(long, value_name = "PATH")]
        ensure: Vec<String>,
    },
}
