//! Command-line front-end: load a `.wasm` (or `.wat`) file, wire up the
//! WASI/emscripten shim, and drive the discovered entry point.

use clap::Parser;
use std::fs;
use wasmtick::{env, Imports, Instance, Module, Trap, TrapCode};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Gas-metered WebAssembly interpreter",
    arg_required_else_help = true
)]
struct Args {
    /// Emit load and per-section diagnostics to stdout.
    #[arg(long = "logging-on")]
    logging_on: bool,

    /// Call the named export with the guest arguments converted to
    /// integers, instead of calling main.
    #[arg(long = "function_name", value_name = "NAME")]
    function_name: Option<String>,

    /// The `.wasm` (or `.wat`) file to execute.
    wasm_file: String,

    /// Arguments passed to the guest program.
    guest_args: Vec<String>,
}

fn main() {
    std::process::exit(run());
}

/// Exit status is the trap code or the guest return value, modulo 128.
fn exit_status(value: i64) -> i32 {
    (value.rem_euclid(128)) as i32
}

fn report_trap(inst: &Instance, trap: &Trap) -> i32 {
    println!("exception {} '{}'", trap.code(), inst.exception());
    exit_status(i64::from(trap.code()))
}

fn run() -> i32 {
    let args = Args::parse();

    if args.logging_on {
        tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    }

    let mut inst = Instance::new();

    let bytes = match load_file(&args.wasm_file) {
        Ok(bytes) => bytes,
        Err(message) => {
            inst.set_exception(&message);
            return report_trap(&inst, &Trap::new(TrapCode::FileNotFound));
        }
    };
    tracing::info!(file = args.wasm_file.as_str(), len = bytes.len(), "file loaded");

    let mut imports = Imports::new();
    if let Err(trap) = env::register_host_functions(&mut imports) {
        return report_trap(&inst, &trap);
    }

    let module = match Module::load(&bytes, &imports, &mut inst) {
        Ok(module) => module,
        Err(trap) => return report_trap(&inst, &trap),
    };
    if let Err(trap) = module.instantiate(&mut inst) {
        return report_trap(&inst, &trap);
    }
    if let Err(trap) = env::locate_errno(&module, &mut inst) {
        return report_trap(&inst, &trap);
    }
    if let Err(trap) = env::call_ctors(&module, &mut inst) {
        return report_trap(&inst, &trap);
    }

    let func_index = match &args.function_name {
        Some(name) => match module.export(name) {
            Some(index) => index,
            None => {
                inst.set_exception(&format!("did not find function '{}'", name));
                return report_trap(&inst, &Trap::new(TrapCode::FunctionNotFound));
            }
        },
        None => match env::find_entry_point(&module) {
            Some(index) => index,
            None => {
                inst.set_exception("did not find main or start function");
                return report_trap(&inst, &Trap::new(TrapCode::FunctionNotFound));
            }
        },
    };

    if args.function_name.is_some() {
        // Not a C main; the guest arguments go straight on the stack.
        for arg in &args.guest_args {
            let value = arg.parse::<i64>().unwrap_or(0);
            inst.push_result_i64(value);
        }
    } else {
        let mut argv = vec![args.wasm_file.clone()];
        argv.extend(args.guest_args.iter().cloned());
        if let Err(trap) = inst.set_command_line_arguments(&argv) {
            return report_trap(&inst, &trap);
        }
    }

    match env::call_and_run(&module, &mut inst, func_index, env::DEFAULT_MEMORY_QUOTA) {
        Ok(total_gas) => {
            let memory_usage = inst.total_memory_usage() + module.byte_len();
            let (return_value, values) = env::drain_results(&module, &mut inst, func_index);
            if args.logging_on {
                println!("Stack: {}", values.len());
                for value in &values {
                    println!("  {}", value);
                }
                println!("Return value from guest: {}", return_value);
                println!("Total gas and memory usage: {} {}", total_gas, memory_usage);
            }
            exit_status(return_value)
        }
        Err(trap) => report_trap(&inst, &trap),
    }
}

fn load_file(path: &str) -> Result<Vec<u8>, String> {
    let contents =
        fs::read(path).map_err(|_| format!("file not found (or unreadable): '{}'", path))?;
    if path.ends_with(".wat") {
        let text = String::from_utf8(contents)
            .map_err(|err| format!("failed to read utf-8 file '{}': {}", path, err))?;
        return wat::parse_str(&text).map_err(|err| format!("failed to parse '{}': {}", path, err));
    }
    Ok(contents)
}
