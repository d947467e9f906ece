//! `vlc`: a thin demo CLI around `vlvm` — load a `.vlbc` image, optionally
//! disassemble it, and run it to completion (or to a step limit).

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use vlvm::{Context, ContextConfig, Image, RunOutcome, Value};

#[derive(Parser)]
#[command(name = "vlc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Load and run VitteLight bytecode images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a .vlbc image
    Run {
        /// Path to a .vlbc image
        input: PathBuf,

        /// Stop after this many instructions (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        max_steps: usize,

        /// Print the image's instruction stream before running it
        #[arg(long)]
        disasm: bool,
    },

    /// Disassemble a .vlbc image without running it
    Disasm {
        /// Path to a .vlbc image
        input: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("vlc=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            max_steps,
            disasm,
        } => run(&input, max_steps, disasm),
        Commands::Disasm { input } => disasm(&input),
    }
}

fn read_image_bytes(path: &std::path::Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| {
        eprintln!("error reading {}: {e}", path.display());
        process::exit(1);
    })
}

fn disasm(path: &std::path::Path) {
    let bytes = read_image_bytes(path);
    match Image::load(&bytes) {
        Ok(image) => print!("{}", image.disassemble()),
        Err(err) => {
            eprintln!("failed to load {}: {err}", path.display());
            process::exit(1);
        }
    }
}

/// Registers the handful of natives the demo CLI exposes to running
/// bytecode: `print` (write a value's canonical form to stdout, the same
/// rendering the `Print` opcode itself uses) and `argc`/`argv` stand-ins are
/// deliberately omitted — this CLI only needs to prove the embedding API,
/// not provide a standard library.
fn register_demo_natives(ctx: &mut Context) {
    ctx.register_native("print", |_ctx, args| {
        let text = args.first().map(|v| v.display_canonical()).unwrap_or_default();
        println!("{text}");
        Ok(Value::Nil)
    })
    .expect("registering a native on a fresh context cannot fail");
}

fn run(path: &std::path::Path, max_steps: usize, disasm_first: bool) {
    let bytes = read_image_bytes(path);

    let mut ctx = Context::create(ContextConfig::default());
    if let Err(code) = ctx.load_from_memory(&bytes) {
        let msg = ctx
            .last_error()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        eprintln!("{path}: {code}: {msg}", path = path.display());
        process::exit(1);
    }

    if disasm_first {
        if let Some(image) = ctx.image() {
            print!("{}", image.disassemble());
        }
    }

    register_demo_natives(&mut ctx);

    match vlvm::run(&mut ctx, max_steps) {
        Ok(RunOutcome::Halted) => {}
        Ok(RunOutcome::StepLimitReached) => {
            eprintln!("stopped after {max_steps} steps (ip = {})", ctx.ip());
        }
        Err(code) => {
            let msg = ctx
                .last_error()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            eprintln!("{code}: {msg}");
            process::exit(1);
        }
    }
}
