use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use tmplvm::interpreter::TemplateInfo;
use tmplvm::runtime::barrier::{BarrierSet, CARD_SHIFT};
use tmplvm::runtime::bytecodes::{Bytecode, BytecodeInfo};
use tmplvm::{RuntimeConfig, Universe, VmError, VmResult};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BarrierArg {
    CardTable,
    G1,
}

#[derive(Parser)]
#[command(name = "tmplvm")]
#[command(about = "Template interpreter and stub generator for 32-bit x86", long_about = None)]
struct Cli {
    /// Load the runtime configuration from a TOML file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, global = true, default_value = "human")]
    format: FormatArg,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Flags applied on top of the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// SSE level of the target CPU (0-4)
    #[arg(long, global = true)]
    sse: Option<u8>,
    /// AVX level of the target CPU (0 or 2)
    #[arg(long, global = true)]
    avx: Option<u8>,
    /// Garbage collector barrier set
    #[arg(long, value_enum, global = true)]
    barrier: Option<BarrierArg>,
    /// Disable interpreter profiling
    #[arg(long, global = true)]
    no_profile: bool,
    /// Disable bytecode rewriting
    #[arg(long, global = true)]
    no_rewrite: bool,
    /// Emit oop verification calls
    #[arg(long, global = true)]
    verify_oops: bool,
    /// Generate for a uniprocessor (no lock prefixes)
    #[arg(long, global = true)]
    up: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate stubs and the template interpreter and print a summary
    Generate {
        /// List every code blob
        #[arg(long)]
        blobs: bool,
        /// Write the raw code section to a file
        #[arg(long, value_name = "FILE")]
        dump: Option<PathBuf>,
    },
    /// Dump the template table with entry addresses
    Table {
        /// Only show this bytecode (name or opcode)
        bytecode: Option<String>,
        /// Show the `wide` templates
        #[arg(long)]
        wide: bool,
    },
    /// List the published stub table
    Stubs,
    /// List bytecode metadata
    Bytecodes,
    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(path: Option<&PathBuf>, o: &Overrides) -> VmResult<RuntimeConfig> {
    let mut config = match path {
        Some(p) => RuntimeConfig::load(p)?,
        None => RuntimeConfig::default(),
    };
    if let Some(sse) = o.sse {
        config.cpu.use_sse = sse;
    }
    if let Some(avx) = o.avx {
        config.cpu.use_avx = avx;
    }
    if let Some(barrier) = o.barrier {
        let byte_map_base = config.barrier.byte_map_base();
        config.barrier = match barrier {
            BarrierArg::CardTable => BarrierSet::CardTable {
                byte_map_base,
                card_shift: CARD_SHIFT,
            },
            BarrierArg::G1 => BarrierSet::G1Satb {
                byte_map_base,
                card_shift: CARD_SHIFT,
                region_log: 20,
            },
        };
    }
    if o.no_profile {
        config.profile_interpreter = false;
    }
    if o.no_rewrite {
        config.rewrite_bytecodes = false;
        config.rewrite_frequent_pairs = false;
    }
    if o.verify_oops {
        config.verify_oops = true;
    }
    if o.up {
        config.is_mp = false;
    }
    config.validate()
}

fn print_json<T: Serialize>(value: &T) -> VmResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| VmError::Config(e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn parse_bytecode(text: &str) -> VmResult<Bytecode> {
    let code = if let Some(hex) = text.strip_prefix("0x") {
        u8::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<u8>().ok()
    };
    code.and_then(Bytecode::from_u8)
        .or_else(|| Bytecode::ALL.iter().copied().find(|bc| bc.name() == text))
        .ok_or_else(|| VmError::Config(format!("unknown bytecode '{text}'")))
}

#[derive(Serialize)]
struct TableRow {
    #[serde(flatten)]
    info: TemplateInfo,
    entry: u32,
    size: u32,
}

fn run_generate(universe: &Universe, format: FormatArg, blobs: bool, dump: Option<PathBuf>) -> VmResult<()> {
    let summary = universe.summary();
    if let Some(path) = dump {
        let cache = universe.code_cache();
        let mut image = vec![0u8; cache.used() as usize];
        for blob in cache.blobs() {
            let at = (blob.begin - cache.base()) as usize;
            image[at..at + blob.code.len()].copy_from_slice(&blob.code);
        }
        std::fs::write(&path, &image).map_err(|e| VmError::Config(format!("{}: {e}", path.display())))?;
        log::info!("wrote {} bytes to {}", image.len(), path.display());
    }
    if format == FormatArg::Json {
        return print_json(&summary);
    }
    println!("code section    {:#010x} ({:#x} bytes used)", summary.code_base, summary.code_used);
    println!("blobs           {}", summary.blobs);
    println!("stubs           {} ({} bytes)", summary.stubs, summary.stub_bytes);
    println!(
        "interpreter     {:#010x}..{:#010x}",
        summary.interpreter_begin, summary.interpreter_end
    );
    println!(
        "templates       {} + {} wide ({} bytes)",
        summary.interpreter.templates, summary.interpreter.wide_templates, summary.interpreter.template_bytes
    );
    println!("largest templates:");
    for (name, size) in &summary.interpreter.largest_templates {
        println!("  {name:<28} {size:>6}");
    }
    if blobs {
        println!();
        for blob in universe.code_cache().blobs() {
            println!("{:#010x}..{:#010x}  {:?}  {}", blob.begin, blob.end(), blob.kind, blob.name);
        }
    }
    Ok(())
}

fn run_table(universe: &Universe, format: FormatArg, filter: Option<Bytecode>, wide: bool) -> VmResult<()> {
    let interp = universe.interpreter();
    let table = tmplvm::interpreter::TemplateTable::new();
    let templates: Vec<_> = if wide {
        table.wide_templates().collect()
    } else {
        table.templates().collect()
    };
    let rows: Vec<TableRow> = templates
        .into_iter()
        .filter(|t| filter.is_none_or(|bc| bc == t.bytecode))
        .map(|t| {
            let entry = if wide {
                interp.tables().wentry[t.bytecode.code() as usize]
            } else {
                interp.tables().normal.entry(t.tos_in, t.bytecode.code())
            };
            let size = interp.codelet_at(entry).map_or(0, |c| c.size());
            TableRow {
                info: TemplateInfo::from(t),
                entry,
                size,
            }
        })
        .collect();
    if format == FormatArg::Json {
        return print_json(&rows);
    }
    for row in &rows {
        println!(
            "{:#04x} {:<28} {} -> {}  {:#010x} {:>5}",
            row.info.code, row.info.name, row.info.tos_in, row.info.tos_out, row.entry, row.size
        );
    }
    Ok(())
}

fn run(cli: Cli) -> VmResult<()> {
    let config = load_config(cli.config.as_ref(), &cli.overrides)?;
    match cli.command {
        Commands::Generate { blobs, dump } => {
            let universe = Universe::generate(config)?;
            run_generate(&universe, cli.format, blobs, dump)
        }
        Commands::Table { bytecode, wide } => {
            let filter = bytecode.as_deref().map(parse_bytecode).transpose()?;
            let universe = Universe::generate(config)?;
            run_table(&universe, cli.format, filter, wide)
        }
        Commands::Stubs => {
            let universe = Universe::generate(config)?;
            let entries = universe.stub_entries();
            if cli.format == FormatArg::Json {
                return print_json(&entries);
            }
            for e in &entries {
                let size = universe
                    .code_cache()
                    .find_blob(e.address)
                    .map_or(0, |b| b.end() - e.address);
                println!("{:#010x} {:>6}  {}", e.address, size, e.name);
            }
            Ok(())
        }
        Commands::Bytecodes => {
            let infos: Vec<BytecodeInfo> = Bytecode::ALL.iter().map(|&bc| bc.into()).collect();
            if cli.format == FormatArg::Json {
                return print_json(&infos);
            }
            for i in &infos {
                let flags = match (i.can_trap, i.can_rewrite) {
                    (true, true) => "trap,rewrite",
                    (true, false) => "trap",
                    (false, true) => "rewrite",
                    (false, false) => "",
                };
                println!(
                    "{:#04x} {:<28} len {:>2} wide {:>2}  {:<14} {}",
                    i.code, i.name, i.length, i.wide_length, flags, i.java_code
                );
            }
            Ok(())
        }
        Commands::Config => {
            if cli.format == FormatArg::Json {
                return print_json(&config);
            }
            let text = toml::to_string_pretty(&config).map_err(|e| VmError::Config(e.to_string()))?;
            print!("{text}");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
