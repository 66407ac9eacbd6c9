//! Remote-protocol endpoint over a TCP stream.
//!
//! One client connection at a time. Framing, acknowledgement bytes and
//! the 0x03 interrupt are handled here; everything else is delegated to
//! the protocol codec and the execution controller.

use std::future::Future;
use std::pin::Pin;

use domdbg_core::Error as CoreError;
use domdbg_core::control::Debugger;
use domdbg_core::domain::{Domain, WordSize};
use domdbg_core::regs::{REGS32_INFO, REGS64_INFO, RegisterInfo};
use domdbg_protocol::frame::{self, FrameDecoder, FrameEvent};
use domdbg_protocol::{Encoding, Error as ProtocolError, Request, Response};
use domdbg_xen::XenDomain;
use miette::IntoDiagnostic;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const SIGINT: u8 = 2;
const SIGTRAP: u8 = 5;

const ERR_GENERIC: u8 = 1;

/// Accepts one client and serves it until it disconnects or detaches.
///
/// The guest is detached (breakpoints drained, guest released) on every
/// exit path.
pub async fn serve(
    mut debugger: Debugger<XenDomain>,
    encoding: Encoding,
    port: u16,
) -> miette::Result<()> {
    let res = run_connection(&mut debugger, encoding, port).await;

    if let Err(e) = debugger.detach() {
        tracing::error!(error = %e, "failed to detach cleanly");
    }

    res
}

async fn run_connection(
    debugger: &mut Debugger<XenDomain>,
    encoding: Encoding,
    port: u16,
) -> miette::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await.into_diagnostic()?;

    tracing::info!(port, "waiting for a debugger client");

    tokio::select! {
        res = accept_and_run(&listener, debugger, encoding) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    }
}

async fn accept_and_run(
    listener: &TcpListener,
    debugger: &mut Debugger<XenDomain>,
    encoding: Encoding,
) -> miette::Result<()> {
    let (stream, peer) = listener.accept().await.into_diagnostic()?;

    tracing::info!(%peer, "client connected");

    Connection {
        stream,
        decoder: FrameDecoder::new(),
        ack_mode: true,
        done: false,
        debugger,
        encoding,
    }
    .run()
    .await
}

struct Connection<'a> {
    stream: TcpStream,
    decoder: FrameDecoder,

    /// Whether frames are still acknowledged with `+`/`-`.
    ack_mode: bool,

    /// Set once the client detached or killed the session.
    done: bool,

    debugger: &'a mut Debugger<XenDomain>,
    encoding: Encoding,
}

impl Connection<'_> {
    async fn run(&mut self) -> miette::Result<()> {
        let mut buf = [0u8; 4096];

        while !self.done {
            loop {
                match self.decoder.next_event() {
                    Ok(Some(FrameEvent::Packet(payload))) => {
                        if self.ack_mode {
                            self.stream.write_all(b"+").await.into_diagnostic()?;
                        }

                        self.handle_packet(&payload).await?;

                        if self.done {
                            return Ok(());
                        }
                    }
                    Ok(Some(FrameEvent::Ack)) => {}
                    Ok(Some(FrameEvent::Nack)) => {
                        tracing::warn!("client requested a retransmit");
                    }
                    Ok(Some(FrameEvent::Interrupt)) => {
                        // nothing to interrupt while stopped
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "bad frame");

                        if self.ack_mode {
                            self.stream.write_all(b"-").await.into_diagnostic()?;
                        }
                    }
                }
            }

            let n = self.stream.read(&mut buf).await.into_diagnostic()?;
            if n == 0 {
                tracing::info!("client disconnected");
                break;
            }

            self.decoder.extend(&buf[..n]);
        }

        Ok(())
    }

    async fn handle_packet(&mut self, payload: &str) -> miette::Result<()> {
        let request = match Request::parse(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, packet = payload, "malformed packet");
                return self.send(&Response::Error(ERR_GENERIC)).await;
            }
        };

        tracing::trace!(?request, "handling packet");

        let response = match request {
            Request::Continue => return self.handle_continue().await,
            Request::Step => return self.handle_step().await,
            Request::Detach | Request::Kill => {
                self.done = true;

                match self.debugger.detach() {
                    Ok(()) => Response::Ok,
                    Err(e) => {
                        tracing::error!(error = %e, "detach failed");
                        Response::Error(ERR_GENERIC)
                    }
                }
            }
            other => self.response_for(other),
        };

        self.send(&response).await
    }

    /// Responses that need no guest resumption.
    fn response_for(&mut self, request: Request) -> Response {
        match request {
            Request::QuerySupported(_) => Response::QuerySupported(vec![
                "PacketSize=1000".to_owned(),
                "QStartNoAckMode+".to_owned(),
            ]),

            Request::StartNoAckMode => {
                self.ack_mode = false;
                Response::Ok
            }

            Request::QueryHostInfo => Response::QueryHostInfo {
                word_size: self.debugger.domain().word_size().bytes(),
                hostname: nix::unistd::gethostname()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            },

            Request::QueryProcessInfo => Response::QueryProcessInfo {
                pid: self.debugger.domain().id(),
            },

            Request::QueryRegisterInfo(id) => {
                match self.register_table().get(usize::from(id)) {
                    Some(info) => Response::QueryRegisterInfo(*info),
                    None => Response::Error(ERR_GENERIC),
                }
            }

            // VCPUs are reported as threads, 1-based
            Request::QueryCurrentThread => Response::QueryCurrentThreadId(
                self.debugger.vcpu().map_or(0, |vcpu| i64::from(vcpu) + 1),
            ),

            Request::QueryThreadInfoFirst => Response::QueryThreadInfo(
                (1..=u64::from(self.debugger.domain().vcpu_count())).collect(),
            ),

            Request::QueryThreadInfoNext => Response::QueryThreadInfoEnd,

            Request::StopReason => Response::StopReasonSignal(SIGTRAP),

            Request::ReadGeneralRegisters => match self.debugger.cpu_context() {
                Ok(ctx) => Response::GeneralRegisters(ctx),
                Err(e) => {
                    tracing::error!(error = %e, "register batch read failed");
                    Response::Error(ERR_GENERIC)
                }
            },

            Request::ReadRegister(id) => self.read_register(id),

            Request::WriteRegister { id, bytes } => self.write_register(id, &bytes),

            Request::ReadMemory { addr, len } => {
                match self.debugger.read_memory_masking(addr, len) {
                    Ok(bytes) => Response::MemoryRead(bytes),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            addr = format_args!("{addr:#x}"),
                            "memory read failed"
                        );
                        Response::Error(ERR_GENERIC)
                    }
                }
            }

            Request::WriteMemory { addr, data } => {
                match self.debugger.write_memory_retaining(addr, &data) {
                    Ok(()) => Response::Ok,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            addr = format_args!("{addr:#x}"),
                            "memory write failed"
                        );
                        Response::Error(ERR_GENERIC)
                    }
                }
            }

            Request::InsertBreakpoint { addr } => match self.debugger.create_breakpoint(addr) {
                Ok(_) => Response::Ok,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        addr = format_args!("{addr:#x}"),
                        "breakpoint insertion failed"
                    );
                    Response::Error(ERR_GENERIC)
                }
            },

            Request::RemoveBreakpoint { addr } => {
                let found = self.debugger.find_breakpoint(addr);

                match found {
                    Ok(Some(bp)) => match self.debugger.delete_breakpoint(bp.id) {
                        Ok(()) => Response::Ok,
                        Err(e) => {
                            tracing::error!(error = %e, "breakpoint removal failed");
                            Response::Error(ERR_GENERIC)
                        }
                    },
                    Ok(None) | Err(_) => Response::Error(ERR_GENERIC),
                }
            }

            Request::Unknown(packet) => {
                tracing::debug!(packet = %packet, "unsupported packet");
                Response::NotSupported
            }

            // handled before dispatching here
            Request::Continue | Request::Step | Request::Detach | Request::Kill => {
                Response::NotSupported
            }
        }
    }

    fn read_register(&mut self, id: u16) -> Response {
        let Some(info) = self.register_table().get(usize::from(id)).copied() else {
            return Response::Error(ERR_GENERIC);
        };

        match self.debugger.cpu_context() {
            Ok(ctx) => match ctx.read_by_arch_id(id) {
                Some(value) => Response::RegisterRead {
                    value,
                    width: info.bitsize as usize / 8,
                },
                None => Response::Error(ERR_GENERIC),
            },
            Err(e) => {
                tracing::error!(error = %e, "register read failed");
                Response::Error(ERR_GENERIC)
            }
        }
    }

    fn write_register(&mut self, id: u16, bytes: &[u8]) -> Response {
        let Some(info) = self.register_table().get(usize::from(id)).copied() else {
            return Response::Error(ERR_GENERIC);
        };

        let width = info.bitsize as usize / 8;
        if bytes.len() != width {
            let e = ProtocolError::PacketSize {
                actual: bytes.len(),
                expected: width,
            };
            tracing::warn!(error = %e, register = info.name, "register write rejected");
            return Response::Error(ERR_GENERIC);
        }

        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(bytes);
        let value = u64::from_le_bytes(raw);

        let mut ctx = match self.debugger.cpu_context() {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(error = %e, "register write failed");
                return Response::Error(ERR_GENERIC);
            }
        };

        if ctx.write_by_name(info.name, value).is_none() {
            return Response::Error(ERR_GENERIC);
        }

        match self.debugger.set_cpu_context(&ctx) {
            Ok(()) => Response::Ok,
            Err(e) => {
                tracing::error!(error = %e, "register write failed");
                Response::Error(ERR_GENERIC)
            }
        }
    }

    /// Releases the guest and reports the next stop, honouring client
    /// interrupts.
    async fn handle_continue(&mut self) -> miette::Result<()> {
        let cancel = CancellationToken::new();

        if let Err(e) = self.debugger.resume_guest(&cancel).await {
            tracing::error!(error = %e, "continue failed");
            return self.send(&Response::Error(ERR_GENERIC)).await;
        }

        let response = {
            let Connection {
                stream,
                decoder,
                debugger,
                ..
            } = self;

            let wait = debugger.wait_for_stop(&cancel);
            tokio::pin!(wait);

            let res = watch_guest(wait, stream, decoder, &cancel).await;

            match res {
                Ok(addr) => {
                    tracing::info!(addr = format_args!("{addr:#x}"), "stopped on breakpoint");
                    Response::StopReasonSignal(SIGTRAP)
                }
                Err(CoreError::Cancelled) => Response::StopReasonSignal(SIGINT),
                Err(e) => {
                    tracing::error!(error = %e, "continue failed");
                    Response::Error(ERR_GENERIC)
                }
            }
        };

        self.send(&response).await
    }

    /// Executes one instruction and reports the stop, honouring client
    /// interrupts.
    async fn handle_step(&mut self) -> miette::Result<()> {
        let cancel = CancellationToken::new();

        let response = {
            let Connection {
                stream,
                decoder,
                debugger,
                ..
            } = self;

            let step = debugger.single_step(&cancel);
            tokio::pin!(step);

            let res = watch_guest(step, stream, decoder, &cancel).await;

            match res {
                Ok(addr) => {
                    tracing::debug!(addr = format_args!("{addr:#x}"), "single step stopped");
                    Response::StopReasonSignal(SIGTRAP)
                }
                Err(CoreError::Cancelled) => Response::StopReasonSignal(SIGINT),
                Err(e) => {
                    tracing::error!(error = %e, "single step failed");
                    Response::Error(ERR_GENERIC)
                }
            }
        };

        self.send(&response).await
    }

    fn register_table(&self) -> &'static [RegisterInfo] {
        match self.debugger.domain().word_size() {
            WordSize::Four => &REGS32_INFO,
            WordSize::Eight => &REGS64_INFO,
        }
    }

    async fn send(&mut self, response: &Response) -> miette::Result<()> {
        let payload = match response.encode(&self.encoding) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                Response::Error(ERR_GENERIC)
                    .encode(&self.encoding)
                    .into_diagnostic()?
            }
        };

        let frame = frame::encode_frame(&payload);

        tracing::trace!(frame = %frame, "sending");

        self.stream
            .write_all(frame.as_bytes())
            .await
            .into_diagnostic()
    }
}

/// Drives a guest-resuming future to completion while watching the
/// client stream for an interrupt.
///
/// An interrupt (or a dropped connection) cancels the pending operation
/// through its token; the operation's own cleanup path then runs before
/// it completes.
async fn watch_guest<F>(
    mut guest: Pin<&mut F>,
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
    cancel: &CancellationToken,
) -> F::Output
where
    F: Future,
{
    let mut buf = [0u8; 256];
    let mut eof = false;

    loop {
        tokio::select! {
            res = &mut guest => return res,
            read = stream.read(&mut buf), if !eof => {
                match read {
                    Ok(0) | Err(_) => {
                        // client gone; unwind the pending operation
                        eof = true;
                        cancel.cancel();
                    }
                    Ok(n) => {
                        decoder.extend(&buf[..n]);

                        while let Ok(Some(event)) = decoder.next_event() {
                            if event == FrameEvent::Interrupt {
                                tracing::debug!("client interrupt");
                                cancel.cancel();
                            }
                        }
                    }
                }
            }
        }
    }
}
