use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{self, Context};
use clap::Parser;
use log::info;
use parking_lot::Mutex;
use squashwalk::squashfs::{ExtractOptions, FileNode, LogSink, OffsetSource, SquashFS};

#[derive(Parser, Debug)]
struct Args {
    filesystem: PathBuf,
    /// Limit the operation to these paths inside the image
    files: Vec<PathBuf>,

    #[clap(short, long="dest", default_value="squashfs-root")]
    dir: PathBuf,

    #[clap(short, action)]
    list_filesystem: bool,

    #[clap(long="cat", action)]
    cat_files: bool,

    /// Byte offset of the image inside FILESYSTEM
    #[clap(short, long, default_value_t = 0)]
    offset: u64,

    /// Extraction threads, 0 for one per CPU
    #[clap(short, long, default_value_t = 0)]
    jobs: usize,

    /// Extract the targets of symlinks in place of the links
    #[clap(long, action)]
    deref: bool,

    /// Also extract symlink targets that lie outside the extracted paths
    #[clap(long, action)]
    unbreak: bool,

    /// Apply the permissions stored in the image
    #[clap(short, action)]
    preserve_permissions: bool,

    #[clap(short, action)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let file = File::open(&args.filesystem)
        .with_context(|| format!("Failed to open {}", args.filesystem.display()))?;
    let root = SquashFS::new(OffsetSource::new(file, args.offset))
        .context("Failed to read SquashFS")?
        .root()?;

    if args.list_filesystem {
        list_filesystem(&args, &root)
    } else if args.cat_files {
        cat_files(&args, &root)
    } else {
        extract_files(&args, &root)
    }
}

// The image paths selected on the command line, or the whole image
fn selected(args: &Args) -> Vec<PathBuf> {
    if args.files.is_empty() {
        vec![PathBuf::from("/")]
    } else {
        args.files.iter()
            .map(|f| Path::new("/").join(f))
            .collect()
    }
}

fn is_selected(files: &[PathBuf], path: &Path) -> bool {
    files.iter().any(|p| path.starts_with(p) || p.starts_with(path))
}

fn list_filesystem(args: &Args, root: &FileNode) -> anyhow::Result<()> {
    let files = selected(args);
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", args.dir.display())?;
    print_and_descend_dir(&mut stdout, &files, &args.dir, root)
}

fn print_and_descend_dir(out: &mut impl Write, files: &[PathBuf], dest: &Path, node: &FileNode) -> anyhow::Result<()> {
    for de in node.entries()? {
        let child = node.open_child(de)?;
        let path = child.path();
        if !is_selected(files, &path) {
            continue;
        }
        writeln!(out, "{}", dest.join(path.strip_prefix("/")?).display())?;
        if child.stat().is_dir() {
            print_and_descend_dir(out, files, dest, &child)?;
        }
    }
    Ok(())
}

fn cat_files(args: &Args, root: &FileNode) -> anyhow::Result<()> {
    let files = selected(args);
    let mut stdout = io::stdout().lock();
    cat_and_descend_dir(&mut stdout, &files, root)?;
    stdout.flush()?;
    Ok(())
}

fn cat_and_descend_dir(out: &mut impl Write, files: &[PathBuf], node: &FileNode) -> anyhow::Result<()> {
    for de in node.entries()? {
        let child = node.open_child(de)?;
        if !is_selected(files, &child.path()) {
            continue;
        }
        let stat = child.stat();
        if stat.is_file() {
            child.write_to(out)
                .with_context(|| format!("Failed to read {}", child.path().display()))?;
        } else if stat.is_dir() {
            cat_and_descend_dir(out, files, &child)?;
        }
    }
    Ok(())
}

fn extract_files(args: &Args, root: &FileNode) -> anyhow::Result<()> {
    let mut options = ExtractOptions {
        dereference_symlinks: args.deref,
        unbreak_symlinks: args.unbreak,
        verbose: args.verbose,
        preserve_permissions: args.preserve_permissions,
        workers: args.jobs,
        ..ExtractOptions::default()
    };
    if args.verbose {
        let sink: LogSink = Arc::new(Mutex::new(io::stderr()));
        options.log_output = Some(sink);
    }

    for path in selected(args) {
        let node = root.open(&path)
            .with_context(|| format!("Cannot open {}", path.display()))?;
        let relative = path.strip_prefix("/")?;
        // Directories are extracted into their own folder, anything else next to its siblings
        let folder = if node.stat().is_dir() {
            args.dir.join(relative)
        } else {
            args.dir.join(relative.parent().unwrap_or(Path::new("")))
        };
        node.extract_with_options(&folder, &options)
            .with_context(|| format!("Failed to extract {}", path.display()))?;
        info!("extracted {} to {}", path.display(), folder.display());
    }
    Ok(())
}
