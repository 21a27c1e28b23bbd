#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use fdfs_block::{DirBlockStore, MemBlockStore};
use fdfs_harness::{ImageFixture, load_image_fixture};
use fdfs_repair::{Checker, now_epoch_secs};
use fdfs_types::{BlockNumber, Layout};
use std::env;
use std::fs;
use std::path::Path;

const FIXTURES: [&str; 2] = [
    "conformance/fixtures/healthy_small.json",
    "conformance/fixtures/damaged_small.json",
];

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("check-fixtures") => {
            for path in FIXTURES {
                let fixture = load_image_fixture(Path::new(path))?;
                let layout = fixture.layout();
                let store = MemBlockStore::new(layout.block_size, layout.max_blocks);
                fixture.write_to(&store)?;
                let report = Checker::new(&store, layout)
                    .run(now_epoch_secs())
                    .with_context(|| format!("check of {path} failed"))?;
                println!("{path}: {report}");
            }
            Ok(())
        }
        Some("generate-image") => generate_image(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

/// Write a fixture image into a directory as `fusedata.<n>` units.
fn generate_image(args: &[String]) -> Result<()> {
    let Some(out) = args.first() else {
        bail!("usage: fdfs-harness generate-image <dir> [fixture.json]");
    };
    let out = Path::new(out);

    let fixture = match args.get(1) {
        Some(path) => load_image_fixture(Path::new(path))?,
        None => sample_image()?,
    };
    let layout = fixture.layout();

    fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
    let store = DirBlockStore::open(out, layout.block_size, layout.max_blocks)?;
    fixture.write_to(&store)?;
    println!(
        "wrote image to {} (max_blocks={})",
        out.display(),
        layout.max_blocks
    );
    Ok(())
}

/// Full-size image with a handful of files.
fn sample_image() -> Result<ImageFixture> {
    let layout = Layout::DEFAULT;
    let root = layout.root_block();
    let mut fixture = ImageFixture::new(layout);
    fixture.add_file(
        root,
        "README",
        BlockNumber(27),
        BlockNumber(28),
        b"fusedata sample image\n",
    )?;
    fixture.add_dir(root, "src", BlockNumber(29))?;
    fixture.add_file(
        BlockNumber(29),
        "main.c",
        BlockNumber(30),
        BlockNumber(31),
        b"int main(void) { return 0; }\n",
    )?;
    fixture.add_indirect_file(
        root,
        "archive.bin",
        BlockNumber(32),
        BlockNumber(33),
        &[BlockNumber(34), BlockNumber(35)],
        6000,
    )?;
    Ok(fixture)
}

fn print_usage() {
    println!("fdfs-harness");
    println!();
    println!("USAGE:");
    println!("  fdfs-harness check-fixtures");
    println!("  fdfs-harness generate-image <dir> [fixture.json]");
}
