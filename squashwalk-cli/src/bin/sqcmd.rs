use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{self, Context};
use clap::{Args, Parser, Subcommand};
use squashwalk::squashfs::{FileKind, FileNode, SquashFS};
use termion;

#[derive(Parser, Debug)]
struct Cli {
    /// The SquashFS Filesystem to operate on
    filesystem: PathBuf,

    /// The command to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print file contents
    Cat(CatArgs),
    /// List files
    Ls(LsArgs),
    /// Show inode details
    Stat(StatArgs),
}

#[derive(Args, Debug)]
struct CatArgs {
    files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct LsArgs {
    #[arg(short)]
    long: bool,
    files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct StatArgs {
    files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let root = SquashFS::open(&cli.filesystem)
        .context("Failed to open SquashFS")?
        .root()?;
    match &cli.command {
        Command::Cat(args) => { cmd_cat(&root, args) },
        Command::Ls(args) => { cmd_ls(&root, args) },
        Command::Stat(args) => { cmd_stat(&root, args) },
    }
}

fn cmd_cat(root: &FileNode, args: &CatArgs) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    for file_arg in &args.files {
        let node = root.open(file_arg)
            .context("Cannot open inode")?;
        if !node.stat().is_dir() {
            node.write_to(&mut stdout)?;
        }
    }
    Ok(())
}

fn cmd_ls(root: &FileNode, args: &LsArgs) -> anyhow::Result<()> {
    let mut first = true;
    let single_path = args.files.len() <= 1;
    let paths = if args.files.is_empty() { vec![PathBuf::from("/")] } else { args.files.clone() };

    // First, print non-directories that directly appeared as arguments, then the contents of
    // each directory argument
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for file_arg in &paths {
        match root.open(file_arg) {
            Ok(node) if node.stat().is_dir() => dirs.push((file_arg, node)),
            Ok(node) => files.push((file_arg.display().to_string(), node)),
            Err(e) => eprintln!("cannot access '{}': {}", file_arg.display(), e),
        }
    }
    if !files.is_empty() {
        display(files, args.long)?;
        first = false;
    }
    // Each directory is preceded by "<NAME>:", unless it is the only path argument
    for (file_arg, dir) in dirs {
        let files = dir.entries()?
            .iter()
            .map(|de| -> anyhow::Result<(String, FileNode)> { Ok((de.file_name(), dir.open_child(de)?)) })
            .collect::<anyhow::Result<Vec<_>>>()?;
        if !first { println!(); }
        if !single_path {
            println!("{}:", file_arg.display());
        }
        display(files, args.long)?;
        first = false;
    }
    Ok(())
}

fn cmd_stat(root: &FileNode, args: &StatArgs) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    for file_arg in &args.files {
        let node = match root.open(file_arg) {
            Ok(node) => node,
            Err(e) => {
                eprintln!("cannot stat '{}': {}", file_arg.display(), e);
                continue;
            }
        };
        let stat = node.stat();
        writeln!(stdout, "  File: {}", node.path().display())?;
        writeln!(stdout, "  Size: {:<12} Type: {:?}", stat.size, stat.inode_type)?;
        writeln!(stdout, " Inode: {:<12} Access: ({:04o}/{})", stat.inode_number, stat.permissions, mode_string(stat.kind, stat.permissions))?;
        writeln!(stdout, "   Uid: {:<12} Gid: {}", stat.uid, stat.gid)?;
        writeln!(stdout, " Mtime: {}", stat.mtime)?;
        if let Some((major, minor)) = node.device_numbers() {
            writeln!(stdout, "Device: {major},{minor}")?;
        }
        if stat.kind == FileKind::Symlink {
            writeln!(stdout, "Target: {}", node.symlink_target()?.display())?;
        }
    }
    Ok(())
}

fn display(files: Vec<(String, FileNode)>, long: bool) -> anyhow::Result<()> {
    if long {
        display_files_long(files)
    } else {
        display_files(files)
    }
}

// Pick the most columns that fit `width`, filling column by column. Returns the number of
// rows and the width of each column, gap included.
fn column_layout(lengths: &[usize], width: usize) -> (usize, Vec<usize>) {
    const GAP: usize = 3;
    for columns in (1..=lengths.len()).rev() {
        let rows = lengths.len().div_ceil(columns);
        let widths: Vec<usize> = lengths.chunks(rows)
            .map(|col| col.iter().max().copied().unwrap_or(0) + GAP)
            .collect();
        if widths.iter().sum::<usize>() <= width + GAP {
            return (rows, widths);
        }
    }
    (lengths.len(), vec![0])
}

fn display_files(files: Vec<(String, FileNode)>) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    if !termion::is_tty(&io::stdout()) {
        for (filename, _) in &files {
            writeln!(stdout, "{filename}")?;
        }
        return Ok(());
    }

    let (term_width, _) = termion::terminal_size()
        .context("Failed to read terminal size")?;
    let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
    let lengths: Vec<usize> = names.iter().map(|n| n.chars().count()).collect();
    let (rows, widths) = column_layout(&lengths, usize::from(term_width));

    for row in 0..rows {
        let line: Vec<&str> = names.iter().skip(row).step_by(rows.max(1)).copied().collect();
        for (col, name) in line.iter().enumerate() {
            if col + 1 == line.len() {
                writeln!(stdout, "{name}")?;
            } else {
                write!(stdout, "{:width$}", name, width = widths[col])?;
            }
        }
    }
    Ok(())
}

fn display_files_long(files: Vec<(String, FileNode)>) -> anyhow::Result<()> {
    for (filename, node) in files {
        let stat = node.stat();
        let link_postfix = if stat.kind == FileKind::Symlink {
            format!(" -> {}", node.symlink_target()?.display())
        } else {
            String::new()
        };
        let size = match node.device_numbers() {
            Some((major, minor)) => format!("{major}, {minor}"),
            None => stat.size.to_string(),
        };
        println!("{} {:>5} {:>5} {:>9} {}{}", mode_string(stat.kind, stat.permissions), stat.uid, stat.gid, size, filename, link_postfix);
    }
    Ok(())
}

// `ls -l` style mode string, e.g. "drwxr-xr-x"
fn mode_string(kind: FileKind, permissions: u16) -> String {
    let type_char = match kind {
        FileKind::Fifo => 'p',
        FileKind::CharDevice => 'c',
        FileKind::Directory => 'd',
        FileKind::BlockDevice => 'b',
        FileKind::File => '-',
        FileKind::Symlink => 'l',
        FileKind::Socket => 's',
    };
    let mut s = String::with_capacity(10);
    s.push(type_char);
    for shift in [6, 3, 0] {
        let bits = (permissions >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}
