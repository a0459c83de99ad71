//! Shared mechanics for materializing a private copy of a logical block
//! inside a snapshot's own block map. Used by both the COW hook (`cow.rs`)
//! and `TreeWalker`'s final inode-expunge step (`treewalker.rs`) — both are
//! "this snapshot needs its own copy of block `lbn`", just triggered from
//! different call sites.

use std::io::Result as IoResult;

use crate::decoder::Backend;
use crate::geom::{BlockRef, Inode};
use crate::host::{HostFs, InodeNum};

/// Ensure snapshot `snap_inr` (whose in-memory inode is `snap_ino`) owns a
/// private copy of logical block `lbn`, copying the pre-image from the
/// block's home fragment-address if none exists yet. Returns the copy's
/// physical address.
pub fn ensure_private_copy<T: Backend>(
	host: &mut HostFs<T>,
	snap_inr: InodeNum,
	snap_ino: &mut Inode,
	lbn: u64,
) -> IoResult<u64> {
	if let BlockRef::Real(addr) = host.resolve_block(snap_ino, lbn)? {
		return Ok(addr);
	}

	let bsize = host.superblock().bsize as u64;
	let home = host.superblock().blocks_to_frags(lbn);
	let mut buf = vec![0u8; bsize as usize];
	if home != 0 {
		host.read_data(home, &mut buf)?;
	}

	let addr = host.blk_alloc(bsize)?.get();
	host.write_data(addr, &buf)?;
	host.set_block(snap_ino, lbn, BlockRef::Real(addr))?;
	host.write_inode(snap_inr, snap_ino)?;
	Ok(addr)
}
