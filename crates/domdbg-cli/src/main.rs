#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use domdbg_cli::{CliAction, CliOpts};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DOMDBG_LOG")
                .from_env_lossy(),
        )
        .init();

    let res = match cli.action {
        CliAction::List => domdbg_cli::evaluate_list(&mut std::io::stdout()),
        CliAction::Serve {
            domain,
            port,
            symbols,
            break_at,
            wide_rflags,
        } => domdbg_cli::evaluate_serve(domain, port, symbols, break_at, wide_rflags),
    };

    if let Err(e) = res {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
