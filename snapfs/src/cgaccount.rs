//! Copy one cylinder-group bitmap from the live filesystem into a snapshot,
//! tagging each free logical block as `NoCopy`. Two-pass protocol: pass 1
//! runs before filesystem suspension, pass 2 re-captures whichever groups
//! mutated between pass 1 and suspension.

use crate::decoder::Backend;
use crate::error::{SnapError, SnapResult};
use crate::geom::{BlockRef, CylGroup, Inode, CG_MAGIC};
use crate::host::{HostFs, InodeNum};
use crate::snapstore::ensure_private_copy;

/// One bit per cylinder group: cleared when a group's bitmap is first
/// captured, set each time that group is re-accounted. Per the design
/// notes, the real kernel uses an atomic-OR word; we preserve the
/// single-writer-per-pass discipline rather than the atomic itself.
#[derive(Debug, Clone)]
pub struct ActiveGroupBitmap(Vec<bool>);

impl ActiveGroupBitmap {
	pub fn new(ncg: u32) -> Self {
		Self(vec![false; ncg as usize])
	}

	pub fn is_captured(&self, cgi: u64) -> bool {
		self.0[cgi as usize]
	}

	fn mark(&mut self, cgi: u64) {
		self.0[cgi as usize] = true;
	}
}

/// Run one pass of cg capture for cylinder group `cgi` against the
/// snapshot inode `snap_inr`/`snap_ino`.
pub fn cg_account<T: Backend>(
	host: &mut HostFs<T>,
	snap_inr: InodeNum,
	snap_ino: &mut Inode,
	active: &mut ActiveGroupBitmap,
	cgi: u64,
	pass: u8,
) -> SnapResult<()> {
	let sb = host.superblock().clone();
	let cgo = host.cg_addr(cgi);
	let cg: CylGroup = host.dev_mut().decode_at(cgo)?;
	if cg.magic != CG_MAGIC {
		log::error!("cg_account: cg{cgi} has invalid magic");
		return Err(SnapError::Io);
	}

	active.mark(cgi);

	// private copy of this cg's own header+bitmap block, captured as of now.
	let header_lbn = cgo / sb.bsize as u64;
	ensure_private_copy(host, snap_inr, snap_ino, header_lbn)?;

	let fpg = sb.fpg as u64;
	let frag = sb.frag as u64;
	let nblk_in_cg = fpg / frag;
	let base = cgi * nblk_in_cg;
	let dblkno = sb.dblkno as u64;

	for i in 0..nblk_in_cg {
		let bno_in_cg = i * frag;
		let l = base + i;

		let free = bno_in_cg >= dblkno && host.cg_block_is_free(cgi, bno_in_cg)?;
		let cur = host.resolve_block(snap_ino, l)?;

		match pass {
			1 => {
				if free {
					host.set_block(snap_ino, l, BlockRef::NoCopy)?;
					host.write_inode(snap_inr, snap_ino)?;
				} else if cur == BlockRef::NoCopy {
					log::error!("cg_account pass1: cg{cgi} lbn {l} already NoCopy but now allocated");
					return Err(SnapError::Internal);
				}
			}
			2 => {
				if free {
					host.set_block(snap_ino, l, BlockRef::NoCopy)?;
					host.write_inode(snap_inr, snap_ino)?;
				} else if cur == BlockRef::NoCopy {
					// freed -> allocated since pass 1: revert so COW copies it.
					host.set_block(snap_ino, l, BlockRef::Hole)?;
					host.write_inode(snap_inr, snap_ino)?;
				}
			}
			_ => unreachable!("invalid cg_account pass: {pass}"),
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::testutil::make_image;

	#[test]
	fn pass_one_tags_free_blocks_nocopy() {
		let img = make_image(1, 512, 4096);
		let mut host = HostFs::new(Cursor::new(img)).unwrap();
		let (snap_inr, mut snap_ino) = host.inode_alloc(0o100400, crate::geom::SF_SNAPSHOT).unwrap();
		let mut active = ActiveGroupBitmap::new(host.superblock().ncg);

		cg_account(&mut host, snap_inr, &mut snap_ino, &mut active, 0, 1).unwrap();
		assert!(active.is_captured(0));

		let dblkno = host.superblock().dblkno as u64;
		let frag = host.superblock().frag as u64;
		let free_lbn = dblkno / frag; // first data block, untouched so far
		assert_eq!(host.resolve_block(&snap_ino, free_lbn).unwrap(), BlockRef::NoCopy);
	}

	#[test]
	fn pass_two_reverts_nocopy_when_reallocated() {
		let img = make_image(1, 512, 4096);
		let mut host = HostFs::new(Cursor::new(img)).unwrap();
		let (snap_inr, mut snap_ino) = host.inode_alloc(0o100400, crate::geom::SF_SNAPSHOT).unwrap();
		let mut active = ActiveGroupBitmap::new(host.superblock().ncg);
		cg_account(&mut host, snap_inr, &mut snap_ino, &mut active, 0, 1).unwrap();

		let bsize = host.superblock().bsize as u64;
		let addr = host.blk_alloc(bsize).unwrap().get(); // consumes the previously-free block
		let lbn = host.superblock().frags_to_blocks(addr);

		cg_account(&mut host, snap_inr, &mut snap_ino, &mut active, 0, 2).unwrap();
		assert_eq!(host.resolve_block(&snap_ino, lbn).unwrap(), BlockRef::Hole);
	}
}
