use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use riscv_gdb_server::{DebugModule, GdbServer, NullDmi, Xlen};

/// GDB remote-serial-protocol server for RISC-V harts debugged through a
/// v0.13 Debug Module.
///
/// The server as shipped uses a disconnected DMI transport; wire up your
/// hardware by implementing `DmiAccess` and swapping it in.
#[derive(clap::Parser)]
#[command(version, about)]
struct Cmd {
    /// Address to listen on for GDB connections.
    #[arg(long, default_value = "127.0.0.1:3333")]
    listen: String,

    /// Initial XLEN of the target, 32 or 64. A loaded ELF overrides it.
    #[arg(long, default_value_t = 64)]
    xlen: u32,

    /// Append diagnostics to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// ELF image to load into target memory before serving.
    #[arg(long)]
    elf: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cmd = Cmd::parse();
    init_tracing(cmd.log_file.as_deref())?;

    let xlen = Xlen::from_bits(cmd.xlen).context("--xlen must be 32 or 64")?;

    let mut backend = DebugModule::new(NullDmi);
    backend.set_xlen(xlen);
    backend.init();

    if let Some(elf) = &cmd.elf {
        backend
            .load_elf(elf)
            .with_context(|| format!("failed to load {}", elf.display()))?;
    }

    let server = GdbServer::bind(&cmd.listen)
        .with_context(|| format!("failed to bind {}", cmd.listen))?;
    tracing::info!("listening for GDB on {} ({})", server.local_addr()?, backend.xlen());

    server.serve(&mut backend)?;
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
