use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use sumatra::config::JitConfig;
use sumatra::jit::JitCompiler;
use sumatra::vm::{Function, FunctionDefinition, Module, Op, Type};

#[derive(Parser)]
#[command(name = "sumatra")]
#[command(about = "Native code generation demo for the sumatra VM", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hex-dump the generated code of each function
    #[arg(long)]
    dump_code: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => match JitConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => JitConfig::default(),
    };
    let dump = cli.dump_code || config.dump_code;

    match run(dump) {
        Ok(result) => {
            println!("main() = {}", result);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Compile and run a small demo program: `main` pushes two constants and
/// calls `add`, which adds its two arguments.
fn run(dump: bool) -> Result<i64, Box<dyn std::error::Error>> {
    let mut module = Module::new();

    let add = module.add_function(Function::new(
        FunctionDefinition::new("add", vec![Type::Int, Type::Int]),
        vec![],
        vec![Op::LoadArg(0), Op::LoadArg(1), Op::Add, Op::Ret],
    ));
    let main_fn = module.add_function(Function::new(
        FunctionDefinition::new("main", vec![]),
        vec![],
        vec![Op::PushInt(5), Op::PushInt(7), Op::Call(add), Op::Ret],
    ));

    let mut jit = JitCompiler::new();
    jit.compile(&mut module, add)?;
    jit.compile(&mut module, main_fn)?;
    jit.make_executable(&mut module)?;

    if dump {
        for id in [add, main_fn] {
            let func = module.function(id);
            println!("{}:", func.definition().name());
            dump_code(func.generated_code().code());
        }
    }

    if !cfg!(all(target_arch = "x86_64", unix)) {
        return Err("generated code can only be executed on x86-64 Unix hosts".into());
    }

    let entry: extern "C" fn() -> i64 =
        unsafe { jit.function_pointer(&module, main_fn) }.ok_or("entry point not available")?;
    Ok(entry())
}

fn dump_code(code: &[u8]) {
    for line in code.chunks(16) {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {}", bytes.join(" "));
    }
}
