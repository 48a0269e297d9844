use clap::Subcommand;

/// The operations `cellar` dispatches against a running secrets server.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the configured server is reachable.
    Server,

    /// List every secret's name, active version, and known versions.
    List,

    /// Show one secret's metadata without its values.
    Info { name: String },

    /// Fetch a secret's value and write it to stdout as raw bytes.
    Get {
        name: String,

        /// Fetch a specific version instead of the active one.
        #[clap(long)]
        version: Option<u64>,

        /// Only fetch and print if the active version differs from this
        /// one; exits 0 with no output on an unchanged 304.
        #[clap(long = "if-changed")]
        if_changed: Option<u64>,
    },

    /// Create a new version of a secret from a file or stdin.
    Put {
        name: String,

        /// Read the value from this file instead of stdin.
        #[clap(long = "from-file")]
        from_file: Option<std::path::PathBuf>,
    },

    /// Activate an existing version of a secret.
    #[clap(name = "set-active")]
    SetActive { name: String, version: u64 },
}
