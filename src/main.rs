use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use mintvm::metadata::TypeDesc;
use mintvm::vm::dump;
use mintvm::{Program, Runtime, Value, VmError};

#[derive(Parser)]
#[command(name = "mintvm")]
#[command(about = "Run and inspect mintvm program files", long_about = None)]
struct Cli {
    /// Log the disassembly of every compiled method
    #[arg(long, global = true)]
    trace_transform: bool,

    /// Log every executed instruction
    #[arg(long, global = true)]
    trace_exec: bool,

    /// Frame chain depth at which calls raise StackOverflowException
    #[arg(long, global = true)]
    max_depth: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program file
    Run {
        /// The program file (TOML, or JSON by extension)
        file: PathBuf,

        /// Method to run instead of the program's entry
        #[arg(long, value_name = "Class::Method")]
        entry: Option<String>,

        /// Argument for the entry method (repeatable)
        #[arg(long = "arg", value_name = "VALUE", allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the compiled form of methods
    Dump {
        /// The program file (TOML, or JSON by extension)
        file: PathBuf,

        /// Only this method
        #[arg(long, value_name = "Class::Method")]
        method: Option<String>,
    },
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let mut filter = EnvFilter::try_from_env("MINTVM_LOG")
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_default();
    if cli.trace_transform {
        if let Ok(directive) = "mintvm::transform=trace".parse() {
            filter = filter.add_directive(directive);
        }
    }
    if cli.trace_exec {
        if let Ok(directive) = "mintvm::exec=trace".parse() {
            filter = filter.add_directive(directive);
        }
    }
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load(cli: &Cli, path: &Path) -> Result<(Program, Runtime), String> {
    let mut program = Program::load(path).map_err(|e| format!("error: {e}"))?;
    program.config.trace_transform |= cli.trace_transform;
    program.config.trace_exec |= cli.trace_exec;
    if let Some(depth) = cli.max_depth {
        program.config.max_frame_depth = depth;
    }
    let runtime = Runtime::with_config(program.metadata.clone(), program.config.clone());
    Ok((program, runtime))
}

/// Convert a command-line argument to a value of the parameter type.
fn parse_arg(rt: &Runtime, ty: &TypeDesc, text: &str) -> Result<Value, String> {
    let bad = || format!("error: `{text}` is not a valid {} argument", rt.metadata().type_name(ty));
    Ok(match ty {
        TypeDesc::Bool => Value::I32(text.parse::<bool>().map_err(|_| bad())? as i32),
        TypeDesc::I1 | TypeDesc::I2 | TypeDesc::I4 | TypeDesc::Char => {
            Value::I32(text.parse().map_err(|_| bad())?)
        }
        TypeDesc::U1 | TypeDesc::U2 | TypeDesc::U4 => Value::I32(text.parse::<u32>().map_err(|_| bad())? as i32),
        TypeDesc::I8 | TypeDesc::I => Value::I64(text.parse().map_err(|_| bad())?),
        TypeDesc::U8 | TypeDesc::U => Value::I64(text.parse::<u64>().map_err(|_| bad())? as i64),
        TypeDesc::R4 | TypeDesc::R8 => Value::F64(text.parse().map_err(|_| bad())?),
        TypeDesc::String => Value::Ref(rt.string(text)),
        _ => return Err(bad()),
    })
}

fn run(cli: &Cli, path: &Path, entry: Option<&str>, args: &[String]) -> Result<(), String> {
    let (program, rt) = load(cli, path)?;
    let method = match entry {
        Some(spec) => rt
            .metadata()
            .find_method(spec)
            .ok_or_else(|| format!("error: no such method: {spec}"))?,
        None => program
            .entry
            .ok_or_else(|| "error: the program has no entry; pass --entry Class::Method".to_string())?,
    };
    let desc = rt.metadata().method(method);
    if !desc.flags.is_static {
        return Err(format!("error: {} is not static", rt.metadata().method_name(method)));
    }
    if desc.sig.params.len() != args.len() {
        return Err(format!(
            "error: {} takes {} arguments, {} given",
            rt.metadata().method_name(method),
            desc.sig.params.len(),
            args.len()
        ));
    }
    let values = desc
        .sig
        .params
        .iter()
        .zip(args)
        .map(|(ty, text)| parse_arg(&rt, ty, text))
        .collect::<Result<Vec<_>, _>>()?;

    match rt.invoke(method, &values) {
        Ok(Value::Void) => Ok(()),
        Ok(Value::Ref(r)) if desc.sig.ret == TypeDesc::String => {
            println!("{}", rt.read_string(r).unwrap_or_else(|| "null".to_string()));
            Ok(())
        }
        Ok(value) => {
            println!("{value}");
            Ok(())
        }
        Err(VmError::Unhandled(ex)) => Err(format!("unhandled exception: {ex}")),
        Err(e) => Err(format!("error: {e}")),
    }
}

fn dump_methods(cli: &Cli, path: &Path, only: Option<&str>) -> Result<(), String> {
    let (_, rt) = load(cli, path)?;
    let md = rt.metadata();
    let methods: Vec<_> = match only {
        Some(spec) => vec![md.find_method(spec).ok_or_else(|| format!("error: no such method: {spec}"))?],
        None => (0..md.method_count() as u32)
            .map(mintvm::metadata::MethodId)
            .filter(|&id| {
                let m = md.method(id);
                // Corlib and generic definitions have nothing to show.
                matches!(m.imp, mintvm::MethodImpl::Il(ref body) if !body.code.is_empty())
                    && m.generic_params == 0
            })
            .collect(),
    };
    for id in methods {
        let compiled = rt.compiled_method(id).map_err(|e| format!("error: {e}"))?;
        println!("{}", dump::disassemble(&compiled, md, rt.methods(), rt.heap()));
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run { file, entry, args } => run(&cli, file, entry.as_deref(), args),
        Commands::Dump { file, method } => dump_methods(&cli, file, method.as_deref()),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
