use anyhow::{bail, Context, Result};
use clap::Parser;
use snapfs::{SnapFs, Tunables};

use crate::cli::{Cli, Command};

mod cli;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let tunables =
		Tunables { dopersistence: cli.persist, snapdebug: cli.debug_snap, collectsnapstats: cli.stats };

	match cli.command {
		Command::Create { image, name } => {
			let mut fs = open(&image, tunables)?;
			let inr = fs.create_snapshot(&name)?;
			println!("created snapshot {name:?} (inode {inr})");
		}
		Command::List { image } => {
			let fs = open(&image, tunables)?;
			for (i, (name, inr)) in fs.list_snapshots().into_iter().enumerate() {
				match name {
					Some(name) => println!("{i}: {name:?} (inode {inr})"),
					None => println!("{i}: <unnamed> (inode {inr})"),
				}
			}
		}
		Command::Rm { image, name } => {
			let mut fs = open(&image, tunables)?;
			fs.remove_snapshot(&name)?;
			println!("removed snapshot {name:?}");
		}
		Command::Stat { image, name } => {
			let mut fs = open(&image, tunables)?;
			let Some(inr) = fs.list_snapshots().into_iter().find(|(n, _)| n.as_deref() == Some(&name[..])) else {
				bail!("no snapshot named {name:?}");
			};
			let (real, nocopy) = fs.snapshot_stats(inr.1)?;
			println!("snapshot {name:?}: {real} block(s) copied, {nocopy} block(s) NoCopy");
		}
		Command::Write { image, inode, offset, hex_bytes } => {
			let mut fs = open(&image, tunables)?;
			let bytes = decode_hex(&hex_bytes)?;
			fs.write(inode, offset, &bytes)?;
			println!("wrote {} byte(s) at offset {offset} to inode {inode}", bytes.len());
		}
		Command::FsckSnap { image } => {
			// `SnapFs::open` already runs `mount_associate`, which is the
			// consistency scan: every `fs_snapinum` slot whose inode no
			// longer carries SF_SNAPSHOT is logged and dropped, and the
			// superblock's name table is recompacted to match.
			let fs = open(&image, tunables)?;
			let snaps = fs.list_snapshots();
			println!("fsck-snap: {} snapshot(s) consistent", snaps.len());
			for (name, inr) in snaps {
				match name {
					Some(name) => println!("  {name:?} (inode {inr})"),
					None => println!("  <unnamed> (inode {inr})"),
				}
			}
		}
	}

	Ok(())
}

fn open(image: &std::path::Path, tunables: Tunables) -> Result<SnapFs<std::fs::File>> {
	SnapFs::open(image, tunables).with_context(|| format!("opening {}", image.display()))
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
	if s.len() % 2 != 0 {
		bail!("hex-bytes must have an even number of digits");
	}
	(0..s.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(&s[i..i + 2], 16).with_context(|| format!("invalid hex byte {:?}", &s[i..i + 2])))
		.collect()
}
