//! This crate provides the command-line surface of the `domdbg` guest
//! debugger: domain listing and the remote-protocol server.

mod cli;
mod server;

pub use self::cli::{CliAction, CliOpts};

use std::io::Write;
use std::path::PathBuf;

use domdbg_core::control::Debugger;
use domdbg_protocol::Encoding;
use domdbg_symbol::SymbolTable;
use domdbg_xen::{XenDomain, XenStore};
use miette::IntoDiagnostic;

/// Lists the guest domains known to the store.
pub fn evaluate_list(output: &mut dyn Write) -> miette::Result<()> {
    let mut store = XenStore::connect().into_diagnostic()?;

    for domid in store.guest_domain_ids().into_diagnostic()? {
        // dom0 is not a debuggable guest
        if domid == 0 {
            continue;
        }

        let name = store
            .domain_name(domid)
            .unwrap_or_else(|_| "<unnamed>".to_owned());

        writeln!(output, "{domid}\t{name}").into_diagnostic()?;
    }

    Ok(())
}

/// Attaches to a domain and serves remote debugger clients on the given
/// port.
pub fn evaluate_serve(
    domain: String,
    port: u16,
    symbols: Option<PathBuf>,
    break_at: Vec<String>,
    wide_rflags: bool,
) -> miette::Result<()> {
    let domid = match domain.parse::<u32>() {
        Ok(domid) => domid,
        Err(_) => XenStore::connect()
            .into_diagnostic()?
            .domain_id_by_name(&domain)
            .into_diagnostic()?,
    };

    let symbols = symbols
        .map(SymbolTable::from_file)
        .transpose()
        .into_diagnostic()?;

    let domain = XenDomain::open(domid).into_diagnostic()?;

    let mut debugger = Debugger::new(domain);
    debugger.attach().into_diagnostic()?;

    for name in &break_at {
        let Some(table) = symbols.as_ref() else {
            return Err(miette::miette!("--break-at requires --symbols"));
        };

        let symbol = table.lookup(name).into_diagnostic()?;
        let id = debugger
            .create_breakpoint(symbol.addr)
            .into_diagnostic()?;

        tracing::info!(
            id,
            name = %symbol.name,
            addr = format_args!("{:#x}", symbol.addr),
            "breakpoint planted"
        );
    }

    let encoding = Encoding {
        narrow_rflags: !wide_rflags,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(server::serve(debugger, encoding, port))
}
