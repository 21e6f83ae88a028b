//! # perchdb CLI Entry Point
//!
//! Opens (or creates) a tree at the given path prefix and runs the
//! command script from stdin against it.
//!
//! ## Usage
//!
//! ```bash
//! # Open or create the tree backed by ./data/index.dat + .bin
//! perchdb ./data/index < commands.txt
//!
//! # Fail instead of opening when the files already exist
//! perchdb --create ./data/index < commands.txt
//! ```
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`
//! (default `perchdb=warn`); command output goes to stdout.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use eyre::{bail, Result, WrapErr};
use tracing_subscriber::EnvFilter;

use perchdb::cli;
use perchdb::BPlusTree;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut create_mode = false;
    let mut prefix: Option<PathBuf> = None;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("perchdb {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--create" | "-c" => create_mode = true,
            _ if arg.starts_with('-') => bail!("unknown option: {}", arg),
            _ => {
                if let Some(earlier) = prefix.replace(PathBuf::from(&arg)) {
                    bail!(
                        "expected one path prefix, got '{}' and '{}'",
                        earlier.display(),
                        arg
                    );
                }
            }
        }
    }

    let Some(prefix) = prefix else {
        print_usage();
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "perchdb=warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    let data_path = {
        let mut p = prefix.as_os_str().to_os_string();
        p.push(".dat");
        PathBuf::from(p)
    };
    if create_mode && data_path.exists() {
        bail!("'{}' already exists", data_path.display());
    }
    if let Some(parent) = prefix.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create directory '{}'", parent.display()))?;
        }
    }

    let mut tree = BPlusTree::open(&prefix)
        .wrap_err_with(|| format!("failed to open tree at prefix '{}'", prefix.display()))?;

    let stdin = io::stdin().lock();
    let stdout = io::stdout();
    let mut output = stdout.lock();
    cli::run_script(&mut tree, stdin, &mut output)?;
    output.flush()?;

    tree.close()
}

fn print_usage() {
    println!("perchdb - embedded on-disk B+ tree index");
    println!();
    println!("USAGE:");
    println!("    perchdb [OPTIONS] <PATH_PREFIX>");
    println!();
    println!("ARGS:");
    println!("    <PATH_PREFIX>    Tree files live at <PATH_PREFIX>.dat and <PATH_PREFIX>.bin");
    println!();
    println!("OPTIONS:");
    println!("    -c, --create     Fail if the tree files already exist");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
    println!();
    println!("The command script is read from stdin: a count line, then one");
    println!("insert/delete/find command per line. find results go to stdout.");
}
