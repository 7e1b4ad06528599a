//! osport - completion-based native I/O
//!
//! CLI entry point exercising the runtime: watching directories, copying
//! files to stdout, running watched children, hashing and host info.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use osport::runtime::IoResult;
use osport::{
    error_string, fs_ops, info, logging, Disposition, FileAccess, HashAlgorithm, IoBuffer, OsportConfig, Runtime,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

const CHUNK: usize = 64 * 1024;
const TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "osport")]
#[command(version)]
#[command(about = "Completion-based native I/O", long_about = None)]
struct Cli {
    /// Configuration file (default: search upward for osport.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a file to stdout through positional reads
    Cat {
        /// File to read
        path: PathBuf,
    },

    /// Hash a file
    Hash {
        /// File to hash
        path: PathBuf,

        /// Digest algorithm (sha1, sha256, sha384, sha512)
        #[arg(short, long, default_value = "sha256")]
        algorithm: HashAlgorithm,
    },

    /// Show host and runtime information
    Info,

    /// Run a command, echoing its output, and exit with its exit code
    Run {
        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },

    /// Print changes made under a directory
    Watch {
        /// Directory to watch
        path: PathBuf,

        /// Include subdirectories
        #[arg(short, long)]
        subtree: bool,

        /// Stop after this many batches
        #[arg(short, long)]
        count: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OsportConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => OsportConfig::find_and_load(&std::env::current_dir()?)?,
    };
    logging::init(&config.log);
    let rt = Runtime::with_config(config);

    match cli.command {
        Commands::Cat { path } => cmd_cat(&rt, path),
        Commands::Hash { path, algorithm } => cmd_hash(&rt, path, algorithm),
        Commands::Info => cmd_info(&rt),
        Commands::Run { argv } => cmd_run(&rt, &argv),
        Commands::Watch { path, subtree, count } => cmd_watch(&rt, path, subtree, count),
    }
}

/// Pump the dispatch step until `rx` yields a value.
fn wait_for<T>(rt: &Runtime, rx: &Receiver<T>) -> Result<T> {
    loop {
        if let Ok(value) = rx.try_recv() {
            return Ok(value);
        }
        rt.run_once(TICK);
    }
}

fn check(result: IoResult, what: &str) -> Result<u32> {
    if result.is_ok() {
        Ok(result.count)
    } else {
        bail!("{}: {}", what, error_string(result.error))
    }
}

fn cmd_cat(rt: &Runtime, path: PathBuf) -> Result<()> {
    let file = rt.open_file(&path, FileAccess::Read, Disposition::OpenExisting)?;
    let buffer = IoBuffer::new(CHUNK);
    let (tx, rx) = unbounded();
    let mut stdout = io::stdout().lock();
    let mut position = 0u64;
    loop {
        let tx = tx.clone();
        rt.read_port(
            file,
            buffer.clone(),
            0,
            CHUNK,
            Some(position),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        let count = check(wait_for(rt, &rx)?, "read")? as usize;
        if count == 0 {
            break;
        }
        stdout.write_all(&buffer.copy_range(0, count))?;
        position += count as u64;
    }
    rt.close_port(file)?;
    Ok(())
}

fn cmd_hash(rt: &Runtime, path: PathBuf, algorithm: HashAlgorithm) -> Result<()> {
    let file = rt.open_file(&path, FileAccess::Read, Disposition::OpenExisting)?;
    let hash = rt.open_hash(algorithm)?;
    let buffer = IoBuffer::new(CHUNK);
    let (tx, rx) = unbounded();
    let mut position = 0u64;
    loop {
        let read_tx = tx.clone();
        rt.read_port(
            file,
            buffer.clone(),
            0,
            CHUNK,
            Some(position),
            Box::new(move |result| {
                let _ = read_tx.send(result);
            }),
        )?;
        let count = check(wait_for(rt, &rx)?, "read")? as usize;
        if count == 0 {
            break;
        }
        let hash_tx = tx.clone();
        rt.hash_data_async(
            hash,
            buffer.copy_range(0, count),
            Box::new(move |result| {
                let _ = hash_tx.send(result);
            }),
        )?;
        check(wait_for(rt, &rx)?, "hash")?;
        position += count as u64;
    }
    let digest = rt.hash_value(hash)?;
    rt.close_hash(hash)?;
    rt.close_port(file)?;
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    println!("{}  {}", hex, path.display());
    Ok(())
}

fn cmd_info(rt: &Runtime) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let space = fs_ops::disk_free_space(&cwd)?;
    println!("Computer:    {}", info::computer_name()?);
    println!("Executable:  {}", fs_ops::executable_path()?.display());
    println!("Tick count:  {} ms", info::tick_count());
    println!("GUID:        {}", info::create_guid());
    println!(
        "Disk space:  {} of {} bytes available under {}",
        space.available,
        space.total,
        cwd.display()
    );
    println!("USB devices: {}", osport::port::usb_device_names()?.len());
    println!("Handles:     {:?}", rt.handle_counts());
    Ok(())
}

enum RunEvent {
    Output(IoResult),
    Exit(u32),
}

fn cmd_run(rt: &Runtime, argv: &[String]) -> Result<()> {
    let (tx, rx) = unbounded();
    let exit_tx = tx.clone();
    let child = rt.create_watched_process(
        argv,
        Box::new(move |exit| {
            let _ = exit_tx.send(RunEvent::Exit(exit.exit_code));
        }),
    )?;
    rt.close_port(child.stdin)?;

    let buffer = IoBuffer::new(CHUNK);
    let mut stdout = io::stdout().lock();
    let mut exit_code = None;
    let mut reading = true;
    let read_next = |tx: crossbeam_channel::Sender<RunEvent>| {
        rt.read_port(
            child.stdout,
            buffer.clone(),
            0,
            CHUNK,
            None,
            Box::new(move |result| {
                let _ = tx.send(RunEvent::Output(result));
            }),
        )
    };
    read_next(tx.clone())?;

    while reading || exit_code.is_none() {
        match wait_for(rt, &rx)? {
            RunEvent::Exit(code) => exit_code = Some(code),
            RunEvent::Output(result) if result.is_ok() && result.count > 0 => {
                stdout.write_all(&buffer.copy_range(0, result.count as usize))?;
                stdout.flush()?;
                read_next(tx.clone())?;
            }
            RunEvent::Output(_) => reading = false,
        }
    }
    rt.close_port(child.stdout)?;

    let code = exit_code.ok_or_else(|| anyhow!("child exit not observed"))?;
    log::debug!("{} exited with {}", argv[0], code);
    std::process::exit(code.min(255) as i32);
}

fn cmd_watch(rt: &Runtime, path: PathBuf, subtree: bool, count: Option<usize>) -> Result<()> {
    let (tx, rx) = unbounded();
    let watcher = rt.watch_directory(
        &path,
        subtree,
        Box::new(move |batch| {
            let _ = tx.send(batch);
        }),
    )?;
    println!("Watching {} (Ctrl-C to stop)", path.display());

    let mut batches = 0;
    while count.map_or(true, |limit| batches < limit) {
        match wait_for(rt, &rx)? {
            Ok(changes) => {
                for change in changes {
                    println!("{:?}\t{}", change.action, change.name);
                }
                batches += 1;
            }
            Err(code) => bail!("watcher stopped: {}", error_string(code)),
        }
    }
    rt.close_directory_watcher(watcher)?;
    // drain the cancelled read
    let _ = wait_for(rt, &rx)?;
    Ok(())
}
