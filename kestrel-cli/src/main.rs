//! Executes Uxn ROMs on a Varvara machine.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use varvara::{symbols::Symbols, Runner, StateFn};

mod status;

/// Uxn runner
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// ROM to load and execute
    rom: PathBuf,

    /// Disable the GUI and run headless against the console only
    #[clap(long)]
    cli: bool,

    /// Symbol file for debug annotations (defaults to `<rom>.sym`)
    #[clap(long)]
    symbols: Option<PathBuf>,

    /// Initial break address (hex address, label, or `label*`)
    #[clap(long = "break")]
    break_ref: Option<String>,

    /// Initial debug address (hex address, label, or `label*`)
    #[clap(long = "debug")]
    debug_ref: Option<String>,
}

fn load_symbols(args: &Args) -> Result<Symbols> {
    let path = match &args.symbols {
        Some(p) => p.clone(),
        None => {
            let mut p = args.rom.clone().into_os_string();
            p.push(".sym");
            let p = PathBuf::from(p);
            if !p.exists() {
                return Ok(Symbols::default());
            }
            p
        }
    };
    let bytes =
        std::fs::read(&path).with_context(|| format!("failed to read symbols {path:?}"))?;
    Symbols::parse(&bytes).with_context(|| format!("failed to parse symbols {path:?}"))
}

fn resolve(syms: &Symbols, text: &str) -> Result<u16> {
    match syms.resolve(text).first() {
        Some(s) => Ok(s.addr),
        None => bail!("unknown reference {text:?}"),
    }
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("KESTREL_LOG", "info")
        .write_style_or("KESTREL_LOG", "always");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let mut f = std::fs::File::open(&args.rom)
        .with_context(|| format!("failed to open {:?}", args.rom))?;
    let mut rom = vec![];
    f.read_to_end(&mut rom).context("failed to read file")?;
    info!("loaded {} byte ROM from {:?}", rom.len(), args.rom);

    let syms = Arc::new(load_symbols(&args)?);
    if !syms.is_empty() {
        info!("loaded {} symbols", syms.len());
    }

    let state: StateFn = {
        let syms = Arc::clone(&syms);
        Arc::new(move |m, k| {
            if let Some(line) = status::state_line(&syms, m, k) {
                eprintln!("{line}");
            }
        })
    };

    let mut runner = Runner::new(!args.cli, false, Some(state));
    if let Some(r) = &args.break_ref {
        runner.set_break(resolve(&syms, r)?);
    }
    if let Some(r) = &args.debug_ref {
        runner.set_debug(resolve(&syms, r)?);
    }

    let code = if args.cli {
        runner.run(rom)
    } else {
        let bridge = runner.bridge();
        let exec = std::thread::spawn(move || runner.run(rom));
        let window = kestrel_gui::Window::new()
            .map_err(|e| anyhow::anyhow!("failed to open window: {e}"))?;
        window.run(bridge);
        exec.join().unwrap_or(1)
    };
    std::process::exit(code);
}
