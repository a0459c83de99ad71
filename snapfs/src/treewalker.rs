//! `expunge` + `indiracct`: traversal of an inode's direct and
//! (triply-)indirect block tree, invoking an [`Accountant`] on each block
//! slice.

use crate::accountant::{Accountant, AccountSink};
use crate::blockio;
use crate::decoder::{decode_slice, encode_slice, Backend};
use crate::error::SnapResult;
use crate::geom::{BlockRef, Inode, Superblock, NDADDR, NIADDR};
use crate::host::{HostFs, InodeNum};
use crate::snapstore::ensure_private_copy;

/// Hides the negative-logical-block-number convention noted in the design
/// notes: indirect blocks are metadata, addressed below a file's data
/// logical-block space. Only used for logging/diagnostics here — no call
/// site outside this module manipulates negative lbns directly.
pub fn indirect_lbn(level: usize, index: u64) -> i64 {
	-(NDADDR as i64) - (level as i64) - index as i64
}

struct Sink<'a, T: Backend> {
	host:      &'a mut HostFs<T>,
	snap_inr:  InodeNum,
	snap_ino:  Inode,
	/// When `false`, `free_block` is a bookkeeping no-op instead of actually
	/// returning the address to the live allocator — used by the
	/// self-expunge phase of snapshot creation, where the blocks being
	/// "freed" are the snapshot's own private copies and the free-bitmap
	/// being updated is conceptually the snapshot's embedded copy, not the
	/// live filesystem's. See DESIGN.md.
	free_live: bool,
}

impl<T: Backend> AccountSink for Sink<'_, T> {
	fn snap_get(&mut self, lbn: u64) -> SnapResult<BlockRef> {
		Ok(self.host.resolve_block(&self.snap_ino, lbn)?)
	}

	fn snap_set(&mut self, lbn: u64, val: BlockRef) -> SnapResult<()> {
		self.host.set_block(&mut self.snap_ino, lbn, val)?;
		self.host.write_inode(self.snap_inr, &self.snap_ino)?;
		Ok(())
	}

	fn free_block(&mut self, addr: u64, size: u64) -> SnapResult<()> {
		if self.free_live {
			self.host.blk_free(addr, size)?;
		} else {
			log::trace!("expunge: block {addr} ({size} bytes) returned to embedded free bitmap");
		}
		Ok(())
	}
}

/// Walk every block reachable from `cancel`, running `accountant` over it,
/// then overwrite `cancel`'s on-disk slot within the snapshot being built.
/// `free_live` controls whether `Accountant::Map`'s frees reach the live
/// allocator (see [`Sink::free_block`]'s doc comment).
#[allow(clippy::too_many_arguments)]
pub fn expunge<T: Backend>(
	host: &mut HostFs<T>,
	snap_inr: InodeNum,
	snap_ino: &mut Inode,
	cancel_inr: InodeNum,
	cancel: &Inode,
	accountant: Accountant,
	tag: BlockRef,
	free_live: bool,
) -> SnapResult<()> {
	let sb = host.superblock().clone();
	let mut sink = Sink { host, snap_inr, snap_ino: snap_ino.clone(), free_live };

	let mut header: Vec<i64> = Vec::with_capacity(NDADDR + NIADDR);
	header.extend(cancel.direct.iter().copied());
	header.extend(cancel.indirect.iter().copied());
	accountant.visit(&mut sink, &header, 0, tag, &sb)?;

	let bsize = sb.bsize as u64;
	let numblks = if bsize > 0 { cancel.size.div_ceil(bsize) } else { 0 };

	let nindir = sink.host.nindir();
	let mut rlbn = NDADDR as u64;
	let mut blksperindir = nindir;
	for level in 0..NIADDR {
		let root = cancel.indirect[level];
		if root != 0 {
			let remblks = numblks.saturating_sub(rlbn);
			// `blksperindir` here is the *total* span this level's root
			// covers (used to step `rlbn` below); `indiracct` wants the
			// per-entry span of the pointers inside that root block, one
			// factor of `nindir` smaller.
			indiracct(&mut sink, &sb, level, root as u64, rlbn, remblks, blksperindir / nindir, accountant, tag)?;
		}
		rlbn += blksperindir;
		blksperindir *= nindir;
	}

	*snap_ino = sink.snap_ino.clone();
	finalize_expunge(host, snap_inr, snap_ino, cancel_inr, tag)
}

/// Recursive descent through one indirect block. Reads straight off the
/// device via `blockio`, never through an inode's own resolution path
/// (which would try to resolve `lbn` against `cancel` and recurse).
/// `remblks` is the count of logical data blocks still unaccounted-for
/// starting at `rlbn` (spec.md §4.4); it bounds `last` so pointer slots past
/// the cancel inode's actual size are never visited or recursed into.
#[allow(clippy::too_many_arguments)]
fn indiracct<T: Backend>(
	sink: &mut Sink<T>,
	sb: &Superblock,
	level: usize,
	blkno: u64,
	rlbn: u64,
	remblks: u64,
	blksperindir: u64,
	accountant: Accountant,
	tag: BlockRef,
) -> SnapResult<()> {
	let nindir = sink.host.nindir();
	let mut raw = vec![0u8; sb.bsize as usize];
	blockio::read_block(sink.host.dev_mut(), sb, blkno, &mut raw)?;

	let ptrs: Vec<i64> =
		raw.chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect();

	let last = remblks.div_ceil(blksperindir).min(nindir) as usize;
	accountant.visit(sink, &ptrs[..last], rlbn, tag, sb)?;

	if level > 0 {
		let mut remaining = remblks;
		for (i, &p) in ptrs[..last].iter().enumerate() {
			if let BlockRef::Real(addr) = BlockRef::decode(p) {
				let child_rlbn = rlbn + i as u64 * blksperindir;
				indiracct(sink, sb, level - 1, addr, child_rlbn, remaining, blksperindir / nindir, accountant, tag)?;
			}
			remaining = remaining.saturating_sub(blksperindir);
		}
	}
	Ok(())
}

/// Overwrite `cancel_inr`'s on-disk inode slot within the snapshot: size and
/// block count go to 0, the block array is cleared, and the snapshot flag
/// is cleared. When `tag == NoCopy` the mode is zeroed too, rendering an
/// unlinked file invisible in the snapshot.
fn finalize_expunge<T: Backend>(
	host: &mut HostFs<T>,
	snap_inr: InodeNum,
	snap_ino: &mut Inode,
	cancel_inr: InodeNum,
	tag: BlockRef,
) -> SnapResult<()> {
	let sb = host.superblock().clone();
	let bsize = sb.bsize as u64;
	let off = sb.ino_to_fso(cancel_inr);
	let lbn = off / bsize;
	let in_block = (off % bsize) as usize;

	let addr = ensure_private_copy(host, snap_inr, snap_ino, lbn)?;

	let mut block = vec![0u8; bsize as usize];
	host.read_data(addr, &mut block)?;

	let mut ino: Inode = decode_slice(&block[in_block..in_block + crate::geom::INODE_SIZE as usize])?;
	ino.size = 0;
	ino.blocks = 0;
	ino.direct = [0; NDADDR];
	ino.indirect = [0; NIADDR];
	ino.flags &= !crate::geom::SF_SNAPSHOT;
	if matches!(tag, BlockRef::NoCopy) {
		ino.mode = 0;
	}
	encode_slice(&ino, &mut block[in_block..in_block + crate::geom::INODE_SIZE as usize])?;
	host.write_data(addr, &block)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::testutil::make_image;

	#[test]
	fn expunge_tags_direct_blocks_nocopy() {
		let img = make_image(1, 512, 4096);
		let mut host = HostFs::new(Cursor::new(img)).unwrap();

		let (file_inr, mut file_ino) = host.inode_alloc(0o100644, 0).unwrap();
		let data_addr = host.blk_alloc(host.superblock().bsize as u64).unwrap().get();
		host.set_block(&mut file_ino, 0, BlockRef::Real(data_addr)).unwrap();
		host.write_inode(file_inr, &file_ino).unwrap();

		let (snap_inr, mut snap_ino) = host.inode_alloc(0o100400, crate::geom::SF_SNAPSHOT).unwrap();

		expunge(&mut host, snap_inr, &mut snap_ino, file_inr, &file_ino, Accountant::Snap, BlockRef::NoCopy, true)
			.unwrap();

		let lbn = host.superblock().frags_to_blocks(data_addr);
		assert_eq!(host.resolve_block(&snap_ino, lbn).unwrap(), BlockRef::NoCopy);
	}

	/// spec.md §4.4's `remblks`/`last` clamp must stop `indiracct` from
	/// visiting or recursing into indirect-block slots past the cancel
	/// inode's actual logical size, even when those slots hold a stray
	/// pointer (e.g. left over from a truncated file).
	#[test]
	fn indiracct_ignores_pointers_past_the_inodes_logical_size() {
		let img = make_image(1, 512, 4096);
		let mut host = HostFs::new(Cursor::new(img)).unwrap();
		let bsize = host.superblock().bsize as u64;

		let (file_inr, mut file_ino) = host.inode_alloc(0o100644, 0).unwrap();
		let in_range_addr = host.blk_alloc(bsize).unwrap().get();
		host.set_block(&mut file_ino, NDADDR as u64, BlockRef::Real(in_range_addr)).unwrap();

		// A stray pointer several slots further into the same indirect
		// block, past what `file_ino.size` claims is live.
		let stray_addr = host.blk_alloc(bsize).unwrap().get();
		host.set_block(&mut file_ino, NDADDR as u64 + 5, BlockRef::Real(stray_addr)).unwrap();

		file_ino.size = (NDADDR as u64 + 1) * bsize;
		host.write_inode(file_inr, &file_ino).unwrap();

		let (snap_inr, mut snap_ino) = host.inode_alloc(0o100400, crate::geom::SF_SNAPSHOT).unwrap();

		expunge(&mut host, snap_inr, &mut snap_ino, file_inr, &file_ino, Accountant::Snap, BlockRef::NoCopy, true)
			.unwrap();

		let in_range_lbn = host.superblock().frags_to_blocks(in_range_addr);
		let stray_lbn = host.superblock().frags_to_blocks(stray_addr);
		assert_eq!(host.resolve_block(&snap_ino, in_range_lbn).unwrap(), BlockRef::NoCopy);
		assert_eq!(host.resolve_block(&snap_ino, stray_lbn).unwrap(), BlockRef::Hole);
	}
}
