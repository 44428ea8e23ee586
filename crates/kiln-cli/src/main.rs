use std::{env, fs, process::ExitCode, thread, time::Instant};

use kiln::{
    Exception, Interpreter, NoLimitTracker, Object, Program, StdPrint,
    tracer::{ProfilingTracer, StderrTracer},
};
use tracing_subscriber::{EnvFilter, fmt};

/// Stack for the thread running bytecode; each VM frame recurses on the Rust stack.
const RUN_STACK_SIZE: usize = 256 << 20;

const USAGE: &str = "usage: kiln [--trace] [--profile] [--dis] [--recursion-limit N] <program.json>";

#[derive(Debug, Default)]
struct Options {
    path: String,
    trace: bool,
    profile: bool,
    dis: bool,
    recursion_limit: Option<usize>,
}

fn main() -> ExitCode {
    init_logging();

    let options = match parse_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    let source = match read_file(&options.path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let program = match Program::from_asm(&source) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("error:\n{err}");
            return ExitCode::FAILURE;
        }
    };

    if options.dis {
        print!("{}", program.disassemble());
        return ExitCode::SUCCESS;
    }

    let start = Instant::now();
    let runner = thread::Builder::new()
        .name("kiln-main".to_owned())
        .stack_size(RUN_STACK_SIZE)
        .spawn(move || run(&program, &options));
    let result = match runner.map(thread::JoinHandle::join) {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            eprintln!("error: interpreter thread panicked");
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("error: failed to start interpreter thread: {err}");
            return ExitCode::FAILURE;
        }
    };
    let elapsed = start.elapsed();

    match result {
        Ok(value) => {
            eprintln!("success after: {elapsed:?}");
            if value != Object::None {
                println!("{value}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error after: {elapsed:?}\n{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(program: &Program, options: &Options) -> Result<Object, Exception> {
    let tracker = match options.recursion_limit {
        Some(limit) => NoLimitTracker::with_recursion_limit(limit),
        None => NoLimitTracker::new(),
    };
    let interpreter = Interpreter::new();
    let mut context = interpreter.new_context();

    if options.profile {
        let (result, profiler) = context.run_with_tracer(program, tracker, &mut StdPrint, ProfilingTracer::new());
        eprint!("{}", profiler.report());
        let stats = context.call_stats();
        eprintln!();
        eprintln!("--- Calls ({} total) ---", stats.total());
        eprintln!("  fast path      {:>10}", stats.fast_path);
        eprintln!("  direct         {:>10}", stats.direct);
        eprintln!("  generator      {:>10}", stats.generator);
        eprintln!("  method         {:>10}", stats.method);
        eprintln!("  bound method   {:>10}", stats.bound_method);
        eprintln!("  builtin        {:>10}", stats.builtin);
        eprintln!("  other          {:>10}", stats.other);
        result
    } else if options.trace {
        context.run_with_tracer(program, tracker, &mut StdPrint, StderrTracer::new()).0
    } else {
        context.run(program, tracker, &mut StdPrint)
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--trace" => options.trace = true,
            "--profile" => options.profile = true,
            "--dis" => options.dis = true,
            "--recursion-limit" => {
                let value = args.next().ok_or("--recursion-limit needs a value")?;
                let limit = value
                    .parse::<usize>()
                    .map_err(|err| format!("invalid recursion limit '{value}': {err}"))?;
                options.recursion_limit = Some(limit);
            }
            flag if flag.starts_with("--") => return Err(format!("unknown option '{flag}'")),
            _ if path.is_some() => return Err(format!("unexpected argument '{arg}'")),
            _ => path = Some(arg),
        }
    }
    options.path = path.ok_or("missing program file")?;
    Ok(options)
}

/// Installs a stderr subscriber; `RUST_LOG` overrides the default `warn` filter.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) if !metadata.is_file() => return Err(format!("{file_path} is not a file")),
        Ok(_) => {}
        Err(err) => return Err(format!("reading {file_path}: {err}")),
    }
    fs::read_to_string(file_path).map_err(|err| format!("reading {file_path}: {err}"))
}
