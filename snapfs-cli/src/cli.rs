use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Command,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,

	/// Flush every materialized COW copy synchronously (crash-visible
	/// snapshots); maps to `Tunables::dopersistence`.
	#[arg(long, global = true)]
	pub persist: bool,

	/// Extra per-block/per-inode trace logging; maps to `Tunables::snapdebug`.
	#[arg(long, global = true)]
	pub debug_snap: bool,

	/// Log suspension-window and accounting summaries; maps to
	/// `Tunables::collectsnapstats`.
	#[arg(long, global = true)]
	pub stats: bool,
}

#[derive(Subcommand)]
pub enum Command {
	/// Create a new snapshot named `name` of `image`.
	Create { image: PathBuf, name: String },
	/// List the live snapshots on `image`, in creation order.
	List { image: PathBuf },
	/// Remove the snapshot named `name` from `image`.
	Rm { image: PathBuf, name: String },
	/// Print per-snapshot block accounting for `name` on `image`.
	Stat { image: PathBuf, name: String },
	/// Write `hex-bytes` at `offset` into the file identified by inode
	/// number `inode`, exercising the COW hook against every live snapshot.
	Write { image: PathBuf, inode: u32, offset: u64, hex_bytes: String },
	/// Re-associate `image`'s on-disk snapshot metadata (`fs_snapinum` and
	/// the name table) and report any entry that didn't survive the check.
	FsckSnap { image: PathBuf },
}
