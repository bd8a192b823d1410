use std::{
    error::Error,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use tracing::Level;
use xisasm::{Assembler, OpcodeTable};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source file
    source: PathBuf,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Opcode table file (default: the built-in Xia table)
    #[arg(short = 't', long)]
    opcodes: Option<PathBuf>,

    /// Pre-declared labels (repeatable)
    #[arg(short = 'D', long, value_name="LABEL=addr", value_parser = xisasm::parse_defines::<String, u64>)]
    define: Vec<(String, u64)>,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    match main_real(args) {
        Ok(true) => ExitCode::SUCCESS,
        // the buffer was emitted but references went unresolved
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn main_real(args: Args) -> Result<bool, Box<dyn Error>> {
    let table = match args.opcodes {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("cant open file: {e}"))?;
            OpcodeTable::from_toml_str(&text)?
        }
        None => OpcodeTable::default(),
    };

    let src = fs::read(&args.source).map_err(|e| format!("cant open file: {e}"))?;
    tracing::trace!("assembling {} bytes of source", src.len());

    let mut asm = Assembler::new(&table, &src);
    for (name, addr) in &args.define {
        asm.declare(name.as_bytes(), *addr);
    }
    let out = asm.assemble()?;

    let mut output: Box<dyn Write> = match args.output {
        Some(path) => Box::new(BufWriter::new(
            File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| format!("cant open file: {e}"))?,
        )),
        None => Box::new(io::stdout()),
    };

    tracing::trace!("writing {} bytes of bytecode", out.bytes.len());
    output.write_all(&out.bytes)?;
    output.flush()?;

    for name in &out.unresolved {
        tracing::error!("unresolved label: {name}");
    }
    Ok(out.unresolved.is_empty())
}
