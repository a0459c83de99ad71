//! Pluggable block-visitor strategies over a contiguous slice of block
//! pointers, replacing the `acctfunc` function pointer the source used.
//!
//! Each variant processes `[first, last)` of some inode's direct or
//! indirect pointer array. They act through an [`AccountSink`] rather than
//! reaching into `HostFs`/`Registry` directly, so `TreeWalker` can drive
//! them against whichever snapshot inode is being built without this module
//! knowing about either.

use crate::error::{SnapError, SnapResult};
use crate::geom::{BlockRef, Superblock};

/// What an [`Accountant`] needs from its caller: the snapshot inode's own
/// block map, and the live free-list.
pub trait AccountSink {
	/// Current contents of the snapshot's own logical block `lbn`.
	fn snap_get(&mut self, lbn: u64) -> SnapResult<BlockRef>;
	/// Overwrite the snapshot's logical block `lbn`, allocating metadata
	/// blocks along the way as needed.
	fn snap_set(&mut self, lbn: u64, val: BlockRef) -> SnapResult<()>;
	/// Return a physical block to the live free-list.
	fn free_block(&mut self, addr: u64, size: u64) -> SnapResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accountant {
	Full,
	Snap,
	Map,
}

impl Accountant {
	pub fn visit(
		self,
		sink: &mut dyn AccountSink,
		ptrs: &[i64],
		starting_lbn: u64,
		tag: BlockRef,
		sb: &Superblock,
	) -> SnapResult<()> {
		match self {
			Self::Full => {
				snap_account(sink, ptrs, tag, sb)?;
				map_account(sink, ptrs, starting_lbn, sb)
			}
			Self::Snap => snap_account(sink, ptrs, tag, sb),
			Self::Map => map_account(sink, ptrs, starting_lbn, sb),
		}
	}
}

fn snap_account(sink: &mut dyn AccountSink, ptrs: &[i64], tag: BlockRef, sb: &Superblock) -> SnapResult<()> {
	for &raw in ptrs {
		let p = BlockRef::decode(raw);
		let BlockRef::Real(addr) = p else { continue };

		let lbn = sb.frags_to_blocks(addr);
		let cur = sink.snap_get(lbn)?;

		match (tag, cur) {
			(BlockRef::SnapOwn, BlockRef::NoCopy) => {
				// allocated to this snapshot after the reference snapshot: leave it.
			}
			(_, BlockRef::Hole) => sink.snap_set(lbn, tag)?,
			_ => {
				log::error!("snap_account: lbn={lbn} already {cur:?}, expected hole");
				return Err(SnapError::Internal);
			}
		}
	}
	Ok(())
}

fn map_account(sink: &mut dyn AccountSink, ptrs: &[i64], starting_lbn: u64, sb: &Superblock) -> SnapResult<()> {
	for (i, &raw) in ptrs.iter().enumerate() {
		let p = BlockRef::decode(raw);
		if matches!(p, BlockRef::Hole | BlockRef::NoCopy) {
			continue;
		}
		let addr = match p {
			BlockRef::SnapOwn => sb.blocks_to_frags(starting_lbn + i as u64),
			BlockRef::Real(addr) => addr,
			BlockRef::Hole | BlockRef::NoCopy => unreachable!(),
		};
		sink.free_block(addr, sb.bsize as u64)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::testutil::make_image;
	use std::io::Cursor;

	struct FakeSink {
		map:  HashMap<u64, BlockRef>,
		freed: Vec<(u64, u64)>,
	}

	impl AccountSink for FakeSink {
		fn snap_get(&mut self, lbn: u64) -> SnapResult<BlockRef> {
			Ok(*self.map.get(&lbn).unwrap_or(&BlockRef::Hole))
		}
		fn snap_set(&mut self, lbn: u64, val: BlockRef) -> SnapResult<()> {
			self.map.insert(lbn, val);
			Ok(())
		}
		fn free_block(&mut self, addr: u64, size: u64) -> SnapResult<()> {
			self.freed.push((addr, size));
			Ok(())
		}
	}

	fn sb() -> Superblock {
		let img = make_image(1, 512, 4096);
		let mut dev = crate::decoder::Decoder::new(Cursor::new(img));
		dev.decode_at(0).unwrap()
	}

	#[test]
	fn snap_account_tags_fresh_holes() {
		let sb = sb();
		let mut sink = FakeSink { map: HashMap::new(), freed: vec![] };
		let ptrs = [sb.blocks_to_frags(5) as i64, 0, 1];
		Accountant::Snap.visit(&mut sink, &ptrs, 0, BlockRef::NoCopy, &sb).unwrap();
		assert_eq!(sink.map.get(&5), Some(&BlockRef::NoCopy));
	}

	#[test]
	fn snap_account_rejects_conflicting_contents() {
		let sb = sb();
		let mut sink = FakeSink { map: HashMap::new(), freed: vec![] };
		sink.map.insert(5, BlockRef::Real(999));
		let ptrs = [sb.blocks_to_frags(5) as i64];
		let err = Accountant::Snap.visit(&mut sink, &ptrs, 0, BlockRef::NoCopy, &sb).unwrap_err();
		assert_eq!(err, SnapError::Internal);
	}

	#[test]
	fn map_account_frees_snap_owned_blocks() {
		let sb = sb();
		let mut sink = FakeSink { map: HashMap::new(), freed: vec![] };
		let ptrs = [BlockRef::SnapOwn.encode()];
		Accountant::Map.visit(&mut sink, &ptrs, 7, BlockRef::Hole, &sb).unwrap();
		assert_eq!(sink.freed, vec![(sb.blocks_to_frags(7), sb.bsize as u64)]);
	}
}
