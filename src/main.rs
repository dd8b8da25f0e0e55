use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use thumbcache::config::Config;
use thumbcache::db::{SqliteDb, ThumbnailStore};
use thumbcache::logging;
use thumbcache::scanner::{ScanProgress, Scanner};
use thumbcache::thumbnails::{ClearScope, StandardDecoder, ThumbnailService};

#[derive(Debug)]
enum Command {
    Get {
        path: PathBuf,
        height: Option<u32>,
        out: Option<PathBuf>,
    },
    Warm {
        dir: PathBuf,
        height: Option<u32>,
    },
    Info {
        path: PathBuf,
    },
    Invalidate {
        path: PathBuf,
    },
    Clear {
        dir: Option<PathBuf>,
    },
    Stats,
}

#[derive(Debug)]
struct Cli {
    config_path: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_help();
    std::process::exit(1);
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut verbose = false;
    let mut height = None;
    let mut out = None;
    let mut dir = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("thumbcache {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--config requires a path argument");
                }
            }
            "--height" => {
                match args.get(i + 1).and_then(|v| v.parse::<u32>().ok()) {
                    Some(h) if h > 0 => height = Some(h),
                    _ => usage_error("--height requires a positive integer"),
                }
                i += 1;
            }
            "--out" | "-o" => {
                if i + 1 < args.len() {
                    out = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--out requires a path argument");
                }
            }
            "--dir" => {
                if i + 1 < args.len() {
                    dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--dir requires a path argument");
                }
            }
            arg if arg.starts_with('-') => {
                usage_error(&format!("Unknown argument: {}", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let Some(name) = positional.next() else {
        usage_error("missing command");
    };
    let mut operand = |what: &str| match positional.next() {
        Some(value) => PathBuf::from(value),
        None => usage_error(&format!("{} requires a {} argument", name, what)),
    };

    let command = match name.as_str() {
        "get" => Command::Get {
            path: operand("path"),
            height,
            out,
        },
        "warm" => Command::Warm {
            dir: operand("directory"),
            height,
        },
        "info" => Command::Info {
            path: operand("path"),
        },
        "invalidate" => Command::Invalidate {
            path: operand("path"),
        },
        "clear" => Command::Clear { dir },
        "stats" => Command::Stats,
        other => usage_error(&format!("Unknown command: {}", other)),
    };

    Cli {
        config_path,
        verbose,
        command,
    }
}

fn print_help() {
    println!(
        r#"thumbcache - thumbnail cache maintenance

USAGE:
    thumbcache [OPTIONS] <COMMAND>

COMMANDS:
    get <path> [--height N] [--out FILE]   Produce a thumbnail (optionally save it)
    warm <dir> [--height N]                Generate thumbnails for every image under dir
    info <path>                            Probe an image and record its metadata
    invalidate <path>                      Drop cached thumbnails of one file
    clear [--dir DIR]                      Drop all cached thumbnails (or those under DIR)
    stats                                  Show cache statistics

OPTIONS:
    --config, -c PATH   Path to config file
    --verbose, -v       Log to stderr
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    THUMBCACHE_CONFIG   Path to config file (overrides default location)
    THUMBCACHE_LOG      Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/thumbcache/config.toml"#
    );
}

fn main() -> Result<()> {
    let cli = parse_args();

    if cli.verbose {
        logging::init_stderr()?;
    } else {
        let _ = logging::init(Some(Config::config_dir().join("logs")));
    }

    let config = match cli.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let db = SqliteDb::open(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    db.initialize()?;
    let store: Arc<dyn ThumbnailStore> = Arc::new(db);

    let (service, _) =
        ThumbnailService::start(config.thumbnails.clone(), Arc::clone(&store), Arc::new(StandardDecoder))?;
    let default_height = config.thumbnails.default_height;

    match cli.command {
        Command::Get { path, height, out } => {
            let height = height.unwrap_or(default_height);
            let bitmap = service.load_thumbnail(&path, height)?;
            match out {
                Some(out) => {
                    bitmap
                        .pixels()
                        .save(&out)
                        .with_context(|| format!("Failed to write {}", out.display()))?;
                    println!("{}x{} -> {}", bitmap.width(), bitmap.height(), out.display());
                }
                None => println!("{}x{}", bitmap.width(), bitmap.height()),
            }
        }
        Command::Warm { dir, height } => {
            if !dir.is_dir() {
                bail!("{} is not a directory", dir.display());
            }
            let height = height.unwrap_or(default_height);
            let (tx, rx) = mpsc::channel();
            let printer = thread::spawn(move || {
                for progress in rx {
                    match progress {
                        ScanProgress::Started { total_files } => println!("Found {} images", total_files),
                        ScanProgress::Warmed { current, total, path } => {
                            println!("[{}/{}] {}", current, total, path)
                        }
                        ScanProgress::Failed { path, reason } => eprintln!("failed: {}: {}", path, reason),
                        ScanProgress::Completed { warmed, failed } => {
                            println!("Done: {} warmed, {} failed", warmed, failed)
                        }
                    }
                }
            });

            let scanner = Scanner::new(config.scanner.clone());
            let result = scanner.warm_directory(&dir, &service, height, config.thumbnails.worker_count, Some(tx));
            let _ = printer.join();
            result?;
        }
        Command::Info { path } => {
            let record = service.record_metadata(&path)?;
            println!("path:        {}", record.path);
            println!("size:        {} bytes", record.size_bytes);
            if let (Some(w), Some(h)) = (record.width, record.height) {
                println!("dimensions:  {}x{}", w, h);
            }
            if let Some(ref format) = record.format {
                println!("format:      {}", format);
            }
            println!("orientation: {}", record.orientation);
            if let Some(ref taken) = record.taken_at {
                println!("taken:       {}", taken);
            }
            if let Some(ref modified) = record.modified_at {
                println!("modified:    {}", modified);
            }
            let cached = store.thumbnail_digests_for_path(&record.path)?.len();
            println!("thumbnails:  {} cached", cached);
        }
        Command::Invalidate { path } => {
            let removed = service.invalidate(&path)?;
            println!("Removed {} cached thumbnails", removed.persisted);
        }
        Command::Clear { dir } => {
            let scope = match dir {
                Some(dir) => ClearScope::Directory(dir),
                None => ClearScope::All,
            };
            let removed = service.clear_all(scope)?;
            println!("Removed {} cached thumbnails", removed.persisted);
        }
        Command::Stats => {
            println!("database:    {}", config.db_path.display());
            println!("thumbnails:  {}", store.count_thumbnails()?);
            for (height, count) in store.thumbnail_counts_by_height()? {
                println!("  {:>5}px:   {}", height, count);
            }
            println!("workers:     {}", config.thumbnails.worker_count);
            println!("l1 capacity: {}", config.thumbnails.l1_capacity);
        }
    }

    service.shutdown();
    Ok(())
}
