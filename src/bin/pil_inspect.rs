// CLASSIFICATION: COMMUNITY
// Filename: pil_inspect.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pil::config::ReservedRegion;
use pil::image::ImageDescriptor;
use pil::region::{self, RegionPlan};

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(about = "Inspect a firmware segment table (.mdt)")]
struct Cli {
    /// Segment table blob
    mdt: PathBuf,
    /// Base of the reserved region for relocatable images
    #[arg(long, value_parser = parse_u64)]
    region_base: Option<u64>,
    /// Size of the reserved region
    #[arg(long, value_parser = parse_u64)]
    region_size: Option<u64>,
    /// Accept any entry point
    #[arg(long)]
    skip_entry_check: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let name = cli
        .mdt
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    let bytes = fs::read(&cli.mdt).with_context(|| format!("reading {}", cli.mdt.display()))?;
    let image = ImageDescriptor::parse(&bytes)?;

    println!("entry {:#x}, {} program headers", image.entry, image.segments.len());
    for seg in &image.segments {
        println!(
            "  [{:02}] paddr {:#010x} filesz {:#x} memsz {:#x} flags {:#x}{}{}",
            seg.index,
            seg.paddr,
            seg.file_size,
            seg.mem_size,
            seg.flags,
            if seg.is_relocatable() { " reloc" } else { "" },
            if seg.is_loadable() { "" } else { " skipped" },
        );
    }

    let reserved = match (cli.region_base, cli.region_size) {
        (Some(base), Some(size)) => Some(ReservedRegion { base, size }),
        (None, None) => None,
        _ => anyhow::bail!("--region-base and --region-size go together"),
    };
    let layout = region::plan(&name, &image, &RegionPlan::default(), reserved, cli.skip_entry_check)?;
    println!(
        "region {:#x}-{:#x} ({:#x} bytes, aligned {:#x}){}",
        layout.region.start,
        layout.region.end,
        layout.region.size(),
        layout.region.aligned_size,
        if layout.region.allocated { " relocated" } else { "" },
    );
    for seg in &layout.segments {
        println!(
            "  {}.b{:02} -> {:#x}-{:#x} ({:#x} from file)",
            name,
            seg.num,
            seg.paddr,
            seg.end(),
            seg.file_size
        );
    }
    println!("entry {:#x}", layout.entry);
    Ok(())
}
