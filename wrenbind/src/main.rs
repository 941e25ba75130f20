use clap::Parser as ClapParser;
use std::{
    io::{self, Write},
    path::PathBuf,
    process,
    sync::Arc,
};

use wrenbind::{ErrorKind, ErrorReport, FsLoader, InterpretResult, Runtime, Vm, VMCreateInfo, engine};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Script files to run, in order
    #[arg(required = true, help = "The .wren files to run")]
    files: Vec<PathBuf>,

    /// Module name to run every file under instead of its file stem
    #[arg(long)]
    module: Option<String>,

    /// Directory imports are loaded from
    #[arg(long, default_value = ".")]
    import_root: PathBuf,

    /// Extra modules to load before running
    #[arg(long)]
    prefetch: Vec<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = Runtime::with_engine();
    if let Err(err) = runtime.start().await {
        eprintln!("Error starting runtime: {err}");
        process::exit(70);
    }

    let vm = match runtime.new_vm(VMCreateInfo {
        on_output: Arc::new(|text: &str| {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }),
        on_error: Arc::new(|report: &ErrorReport| match report.kind {
            ErrorKind::StackTrace => eprintln!("  {report}"),
            _ => eprintln!("{report}"),
        }),
        loader: Arc::new(FsLoader::new(&cli.import_root)),
    }) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error creating vm: {err}");
            process::exit(70);
        }
    };

    if let Err(err) = vm.prefetch_all(&cli.prefetch).await {
        eprintln!("Error loading module: {err}");
        process::exit(66);
    }

    let mut status = 0;
    for path in &cli.files {
        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Error reading file '{}': {}", path.display(), err);
                status = 66;
                break;
            }
        };
        let module = cli.module.clone().unwrap_or_else(|| {
            path.file_stem()
                .map_or_else(|| "main".to_owned(), |stem| stem.to_string_lossy().into_owned())
        });

        prefetch_imports(&vm, &source).await;
        match vm.interpret(&module, &source).await {
            Ok(InterpretResult::Success) => {}
            Ok(InterpretResult::CompileError) => {
                status = 65;
                break;
            }
            Ok(InterpretResult::RuntimeError) => {
                status = 70;
                break;
            }
            Err(err) => {
                eprintln!("Error running {}: {}", path.display(), err);
                status = 70;
                break;
            }
        }
    }

    if let Err(err) = vm.free() {
        log::warn!("vm not freed cleanly: {err}");
    }
    process::exit(status);
}

/// Loads every module `source` imports, and theirs, so the engine finds
/// them in the cache. Sources that fail to parse are left for the engine to
/// report.
async fn prefetch_imports(vm: &Vm, source: &str) {
    let mut pending = imports_of(source);
    while !pending.is_empty() {
        let fresh: Vec<String> = pending
            .drain(..)
            .filter(|name| !vm.shared().imports().is_cached(name))
            .collect();
        for name in fresh {
            match vm.prefetch(&name).await {
                Ok(()) => {
                    if let Some(imported) = vm.shared().imports().lookup(&name) {
                        pending.extend(imports_of(&imported));
                    }
                }
                Err(err) => log::debug!("prefetch of {name} failed: {err}"),
            }
        }
    }
}

fn imports_of(source: &str) -> Vec<String> {
    engine::parse(source)
        .map(|program| program.imports().into_iter().map(|(name, _)| name).collect())
        .unwrap_or_default()
}
