use std::path::PathBuf;

/// The domdbg guest debugger.
#[derive(clap::Parser)]
pub struct CliOpts {
    /// The command to run.
    #[clap(subcommand)]
    pub action: CliAction,
}

/// The command to run.
#[derive(clap::Subcommand)]
pub enum CliAction {
    /// Command to list the guest domains known to the store.
    List,

    /// Command to attach to a guest domain and serve remote debugger
    /// clients.
    Serve {
        /// Domain to attach to (numeric ID, or a name resolved through
        /// the store).
        domain: String,

        /// TCP port to listen on.
        #[clap(short, long, default_value_t = 1234)]
        port: u16,

        /// ELF file to load function symbols from.
        #[clap(short, long, value_name = "PATH")]
        symbols: Option<PathBuf>,

        /// Plant a breakpoint at this symbol before serving.
        ///
        /// May be repeated; requires --symbols.
        #[clap(long = "break-at", value_name = "NAME")]
        break_at: Vec<String>,

        /// Emit the full 64-bit flags register in batch register reads.
        ///
        /// GDB expects the narrowed 32-bit form, which is the default.
        #[clap(long)]
        wide_rflags: bool,
    },
}

impl CliOpts {
    /// Parses the CLI from the command-line.
    ///
    /// # Warning
    ///
    /// Exits on error.
    pub fn parse_from_cmdline() -> Self {
        <Self as clap::Parser>::parse()
    }
}
