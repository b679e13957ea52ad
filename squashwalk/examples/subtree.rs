/// Walk a SquashFS starting at a specified path, reading every file along the way
use std::env;
use std::io;

use anyhow::{self, Context};
use squashwalk::squashfs::{FileNode, SquashFS};

fn main() -> anyhow::Result<()> {
    let sqfs_path = env::args().nth(1).context("usage: subtree <image> [path]")?;
    let p = env::args().nth(2).unwrap_or_else(|| "/".to_string());

    let root = SquashFS::open(&sqfs_path)?.root()?;
    let top = root.open(&p)?;
    let (nodes, bytes) = read_tree(top, true)?;
    println!("{nodes} nodes, {bytes} bytes of file content under {p}");
    Ok(())
}

fn read_tree(top_node: FileNode, content: bool) -> anyhow::Result<(u32, u64)> {
    let mut nodes = vec![top_node];
    let mut count = 0;
    let mut bytes = 0;

    while let Some(node) = nodes.pop() {
        count += 1;
        if content && node.stat().is_file() {
            bytes += node.write_to(&mut io::sink())?;
        } else if node.stat().is_dir() {
            for de in node.entries()? {
                nodes.push(node.open_child(de)?);
            }
        }
    }
    Ok((count, bytes))
}
