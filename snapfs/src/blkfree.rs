//! `snap_blk_free`: invoked by the block allocator before it frees a range
//! belonging to some inode. Gives every live snapshot a chance to claim or
//! copy the block before it disappears from the live filesystem.
//!
//! Grounded in spec.md §4.7; no teacher equivalent exists, so this follows
//! the crate's own `cow.rs`/`cgaccount.rs` shape (typed `SnapResult`,
//! `log::trace!` per block) rather than a ported algorithm.

use crate::decoder::Backend;
use crate::error::{SnapError, SnapResult};
use crate::geom::BlockRef;
use crate::host::{HostFs, InodeNum};
use crate::registry::Registry;

/// Returns `true` iff some snapshot claimed `bno` outright, meaning the
/// live free of `bno` must be cancelled by the caller.
///
/// `dopersistence` mirrors `cow::copy_on_write`'s rule (§4.6 step 5, applied
/// by §4.7's closing line to the final copy of the loop): when set, a
/// snapshot with a non-zero link count is synced right after it captures a
/// copy of the freed block, so the copy is crash-safe.
pub fn snap_blk_free<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	bno: u64,
	size: u64,
	_inum: InodeNum,
	dopersistence: bool,
) -> SnapResult<bool> {
	let sb = host.superblock().clone();
	let bsize = sb.bsize as u64;
	let lbn = sb.frags_to_blocks(bno);

	let mut claimed = false;
	let mut saved_copy: Option<Vec<u8>> = None;

	for snap_inr in registry.snapshots() {
		let mut snap_ino = host.read_inode(snap_inr)?;
		match host.resolve_block(&snap_ino, lbn)? {
			BlockRef::NoCopy | BlockRef::Real(_) => {}

			BlockRef::SnapOwn => {
				// An older snapshot already claimed this block at its home
				// address (see the `Hole if !claimed` arm below, which only
				// ever fires for the first, oldest claimant). A younger
				// snapshot still tagged BLK_SNAP for the same block at this
				// point means two snapshots both think they own bno's home
				// address — `ffs_snapblkfree`'s `claimedblk` check.
				if claimed {
					log::error!("snap_blk_free: lbn {lbn} tagged SnapOwn after an older snapshot already claimed {bno}");
					return Err(SnapError::Internal);
				}
				host.set_block(&mut snap_ino, lbn, BlockRef::NoCopy)?;
				host.write_inode(snap_inr, &snap_ino)?;
			}

			BlockRef::Hole if !claimed && size == bsize => {
				host.set_block(&mut snap_ino, lbn, BlockRef::Real(bno))?;
				host.write_inode(snap_inr, &snap_ino)?;
				claimed = true;
				log::trace!("snap_blk_free: snapshot {snap_inr} claimed {bno} at home address");
			}

			BlockRef::Hole => {
				let bytes = match &saved_copy {
					Some(b) => b.clone(),
					None => {
						let mut buf = vec![0u8; bsize as usize];
						host.read_data(bno, &mut buf)?;
						saved_copy = Some(buf.clone());
						buf
					}
				};
				let addr = host.blk_alloc(bsize)?.get();
				host.write_data(addr, &bytes)?;
				host.set_block(&mut snap_ino, lbn, BlockRef::Real(addr))?;
				host.write_inode(snap_inr, &snap_ino)?;
				log::trace!("snap_blk_free: snapshot {snap_inr} copied {bno} ({size} bytes) to {addr}");
				if dopersistence && snap_ino.nlink > 0 {
					host.sync()?;
					log::debug!("snap_blk_free: synced snapshot {snap_inr} after copying {bno}");
				}
			}
		}
	}
	Ok(claimed)
}
