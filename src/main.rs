/// tierstate - Tiered State CLI
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Barrier};
use std::thread;

use tierstate::codegen;
use tierstate::config::RuntimeConfig;
use tierstate::logging;
use tierstate::manifest::Manifest;
use tierstate::state::ProcessState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("tierstate v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    tierstate [OPTIONS] <COMMAND> [ARGS]");
    eprintln!();
    eprintln!("COMMANDS:");
    eprintln!("    table                Print the built-in synchronization policy table");
    eprintln!("    check <MANIFEST>     Validate a declaration manifest");
    eprintln!("    gen <MANIFEST>       Generate accessors from a declaration manifest");
    eprintln!("    stress               Create and bind instances from many threads");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help             Print this help message");
    eprintln!("    -v, --version          Print version information");
    eprintln!("    --verbose              Log at debug level");
    eprintln!("    --config <FILE>        Runtime configuration (default: $TIERSTATE_CONFIG,");
    eprintln!("                           then the user config directory)");
    eprintln!("    -o, --output <FILE>    gen: write Rust output to FILE (default: stdout)");
    eprintln!("    --exports <FILE>       gen: write a linker version script to FILE");
    eprintln!("    --prefix <PREFIX>      gen: symbol prefix for exported fields");
    eprintln!("    --threads <N>          stress: number of threads (default: CPU count)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    tierstate table");
    eprintln!("    tierstate check state.toml");
    eprintln!("    tierstate gen state.toml -o src/state_gen.rs --exports state.map --prefix PL_");
    eprintln!("    tierstate stress --threads 50");
}

fn print_version() {
    println!("tierstate {}", VERSION);
}

enum Command {
    Table,
    Check(PathBuf),
    Gen(PathBuf),
    Stress,
}

struct Options {
    command: Command,
    config: Option<PathBuf>,
    verbose: bool,
    output: Option<PathBuf>,
    exports: Option<PathBuf>,
    prefix: String,
    threads: usize,
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("Missing value after {}", flag))
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut positional = Vec::new();
    let mut config = None;
    let mut verbose = false;
    let mut output = None;
    let mut exports = None;
    let mut prefix = String::new();
    let mut threads = num_cpus::get();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                process::exit(0);
            }
            "--verbose" => {
                verbose = true;
            }
            "--config" => {
                config = Some(PathBuf::from(take_value(&args, &mut i, "--config")?));
            }
            "-o" | "--output" => {
                output = Some(PathBuf::from(take_value(&args, &mut i, "-o")?));
            }
            "--exports" => {
                exports = Some(PathBuf::from(take_value(&args, &mut i, "--exports")?));
            }
            "--prefix" => {
                prefix = take_value(&args, &mut i, "--prefix")?;
            }
            "--threads" => {
                let value = take_value(&args, &mut i, "--threads")?;
                threads = value
                    .parse()
                    .map_err(|_| format!("Invalid thread count: {}", value))?;
                if threads == 0 {
                    return Err("Thread count must be at least 1".to_string());
                }
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("table") => Command::Table,
        Some("check") => Command::Check(PathBuf::from(
            positional.next().ok_or("Missing manifest for check")?,
        )),
        Some("gen") => Command::Gen(PathBuf::from(
            positional.next().ok_or("Missing manifest for gen")?,
        )),
        Some("stress") => Command::Stress,
        Some(other) => return Err(format!("Unknown command: {}", other)),
        None => return Err("Missing command".to_string()),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    Ok(Options {
        command,
        config,
        verbose,
        output,
        exports,
        prefix,
        threads,
    })
}

fn write_output(output: Option<&Path>, content: &str) -> Result<(), String> {
    match output {
        Some(path) => fs::write(path, content)
            .map_err(|e| format!("Failed to write output file '{}': {}", path.display(), e)),
        None => {
            print!("{}", content);
            Ok(())
        }
    }
}

fn run_table() -> Result<(), String> {
    let policy = ProcessState::builtin_policy().map_err(|e| e.to_string())?;
    print!("{}", policy.render());
    Ok(())
}

fn run_check(path: &Path) -> Result<(), String> {
    let manifest = Manifest::load(path).map_err(|e| e.to_string())?;
    let policy = manifest.policy().map_err(|e| e.to_string())?;
    println!(
        "{}: {} locks, {} fields, {} exported",
        path.display(),
        policy.locks().len(),
        policy.len(),
        policy.exports().count()
    );
    Ok(())
}

fn run_gen(path: &Path, options: &Options) -> Result<(), String> {
    let manifest = Manifest::load(path).map_err(|e| e.to_string())?;
    let source = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let generated =
        codegen::generate(&manifest, &source, &options.prefix).map_err(|e| e.to_string())?;
    write_output(options.output.as_deref(), &generated.rust)?;
    if let Some(exports) = &options.exports {
        fs::write(exports, &generated.export_script).map_err(|e| {
            format!("Failed to write export script '{}': {}", exports.display(), e)
        })?;
    }
    Ok(())
}

fn run_stress(config: &RuntimeConfig, threads: usize) -> Result<(), String> {
    let state = ProcessState::new(config).map_err(|e| e.to_string())?;
    let barrier = Arc::new(Barrier::new(threads));

    let results: Vec<Result<(), String>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|n| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || -> Result<(), String> {
                    barrier.wait();
                    let instance = state.create_instance().map_err(|e| e.to_string())?;
                    state
                        .bind_current_thread(&instance)
                        .map_err(|e| e.to_string())?;
                    state
                        .with_instance(|vars| vars.set_exit_code(n as i32))
                        .map_err(|e| e.to_string())?;
                    state
                        .with_thread(|vars| vars.set_stack_depth(n))
                        .map_err(|e| e.to_string())?;
                    let seen = state
                        .with_instance(|vars| *vars.exit_code())
                        .map_err(|e| e.to_string())?;
                    let current = state.current().map_err(|e| e.to_string())?.id();
                    if current != instance.id() {
                        return Err(format!(
                            "thread {} resolved {} instead of its own {}",
                            n, current, instance.id()
                        ));
                    }
                    if seen != n as i32 {
                        return Err(format!(
                            "thread {} read exit code {} from {}, wrote {}",
                            n, seen, instance.id(), n
                        ));
                    }
                    state.release_current_thread().map_err(|e| e.to_string())?;
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(n, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(format!("thread {} panicked", n)))
            })
            .collect()
    });

    let failures = results.iter().filter(|r| r.is_err()).count();
    let live = state.instance_count().map_err(|e| e.to_string())?;
    println!(
        "threads: {}, instances registered: {}, failures: {}",
        threads, live, failures
    );
    let torn_down = state.shutdown().map_err(|e| e.to_string())?;
    println!("shut down {} instances", torn_down);

    if let Some(Err(err)) = results.into_iter().find(|r| r.is_err()) {
        return Err(err);
    }
    Ok(())
}

fn main() {
    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let config = match RuntimeConfig::discover(options.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = logging::init_from_config(&config.logging, options.verbose) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let result = match &options.command {
        Command::Table => run_table(),
        Command::Check(path) => run_check(path),
        Command::Gen(path) => run_gen(path, &options),
        Command::Stress => run_stress(&config, options.threads),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
