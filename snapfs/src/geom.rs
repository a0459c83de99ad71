//! On-disk geometry: superblock, cylinder-group, and inode layouts.
//!
//! Field layouts mirror FreeBSD's `struct fs` / `struct cg` / `struct ufs2_dinode`
//! closely enough that the snapshot bookkeeping they carry (`fs_snapinum`,
//! cylinder-group bitmaps, direct/indirect block pointers) behaves the same
//! way the spec describes it. Unrelated on-disk fields (rotational layout,
//! historic `fs_old_*` members) are dropped; this is a deliberately smaller
//! surface than real UFS2, see `SPEC_FULL.md`.

use bincode::{Decode, Encode};

/// Direct block pointers per inode (`NDADDR`).
pub const NDADDR: usize = 12;
/// Indirect block-tree roots per inode (`NIADDR`): single, double, triple.
pub const NIADDR: usize = 3;
/// Maximum number of snapshot inodes recorded in the superblock.
pub const FSMAXSNAP: usize = 20;
/// Size in bytes of an on-disk inode slot.
pub const INODE_SIZE: u64 = 256;

/// `di_flags` bit marking a regular file as a snapshot.
pub const SF_SNAPSHOT: u32 = 0x0001_0000;

/// Hole / unallocated logical block.
pub const BLK_HOLE: i64 = 0;
/// Sentinel: this logical block was free when the snapshot was taken and
/// will never need a copy.
pub const BLK_NOCOPY: i64 = 1;
/// Sentinel: this logical block is owned by a snapshot's own storage.
/// Transient — must never be observed outside of snapshot creation.
pub const BLK_SNAP: i64 = 2;
/// The allocator never hands out an address below this; 0/1/2 are reserved
/// for the sentinels above.
pub const FIRST_REAL_ADDR: i64 = 3;

/// Tagged view of a block-pointer slot, per the REDESIGN FLAGS note: internal
/// code matches on this instead of comparing raw sentinel integers, and the
/// bit-exact `0`/`1`/`2`/address encoding only happens at the on-disk
/// boundary (`BlockRef::decode`/`BlockRef::encode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
	Hole,
	NoCopy,
	SnapOwn,
	Real(u64),
}

impl BlockRef {
	pub fn decode(raw: i64) -> Self {
		match raw {
			BLK_HOLE => Self::Hole,
			BLK_NOCOPY => Self::NoCopy,
			BLK_SNAP => Self::SnapOwn,
			addr => Self::Real(addr as u64),
		}
	}

	pub fn encode(self) -> i64 {
		match self {
			Self::Hole => BLK_HOLE,
			Self::NoCopy => BLK_NOCOPY,
			Self::SnapOwn => BLK_SNAP,
			Self::Real(addr) => addr as i64,
		}
	}

	pub fn is_real(self) -> bool {
		matches!(self, Self::Real(_))
	}

	pub fn real_addr(self) -> Option<u64> {
		match self {
			Self::Real(addr) => Some(addr),
			_ => None,
		}
	}
}

/// Per cylinder group free/inode/dir counts. `struct csum` in FreeBSD.
#[derive(Debug, Clone, Copy, Default, Decode, Encode)]
pub struct Csum {
	pub ndir: i32,
	pub nbfree: i32,
	pub nifree: i32,
	pub nffree: i32,
}

/// Filesystem-wide accumulation of [`Csum`]. `struct csum_total` in FreeBSD.
#[derive(Debug, Clone, Copy, Default, Decode, Encode)]
pub struct CsumTotal {
	pub ndir: i64,
	pub nbfree: i64,
	pub nifree: i64,
	pub nffree: i64,
}

/// Superblock. `struct fs` in FreeBSD, trimmed to what the engine and its
/// `HostFs` stand-in actually consult. `snapinum` is carried bit-exact as
/// the spec requires (I5).
#[derive(Debug, Clone, Decode, Encode)]
pub struct Superblock {
	pub magic: i32,
	pub sblkno: i32,
	pub cblkno: i32,
	pub iblkno: i32,
	pub dblkno: i32,

	pub ncg: u32,
	pub bsize: i32,
	pub fsize: i32,
	pub frag: i32,

	pub bshift: i32,
	pub fshift: i32,
	pub fragshift: i32,

	pub ipg: u32,
	pub fpg: i32,
	pub inopb: u32,

	pub size: i64,
	pub dsize: i64,

	pub cstotal: CsumTotal,

	/// 0 = clean, 1 = unclean/needs fsck, matches the spirit of `FS_*` flags.
	pub clean: i32,

	pub contigsumsize: i32,

	/// dense, 0-terminated array of live snapshot inode numbers (I5).
	pub snapinum: [u32; FSMAXSNAP],

	/// Ambient addition: `HostFs` has no directory layer, so `snapfs-cli`
	/// needs *some* persistent way to address a snapshot by name across
	/// process invocations. Parallel-indexed to `snapinum`, null-padded.
	/// Not part of the engine's own invariants.
	pub snapnames: [[u8; 16]; FSMAXSNAP],
}

impl Superblock {
	pub fn cgsize(&self) -> u64 {
		self.fpg as u64 * self.fsize as u64
	}

	/// inode number -> cylinder group number.
	pub fn ino_to_cg(&self, inr: u32) -> u64 {
		inr as u64 / self.ipg as u64
	}

	/// inode number -> offset within its cylinder group.
	pub fn ino_in_cg(&self, inr: u32) -> u64 {
		inr as u64 % self.ipg as u64
	}

	/// blocks -> fragments, per §3 of spec.md: `blocks_to_frags(b) = b * N`.
	pub fn blocks_to_frags(&self, blocks: u64) -> u64 {
		blocks << self.fragshift as u32
	}

	/// fragments -> blocks, per §3 of spec.md: `frags_to_blocks(a) = a / N`.
	pub fn frags_to_blocks(&self, frags: u64) -> u64 {
		frags >> self.fragshift as u32
	}

	/// byte offset of inode `inr`'s on-disk slot.
	pub fn ino_to_fso(&self, inr: u32) -> u64 {
		let cg = self.ino_to_cg(inr);
		let cg_start_frag = self.cblkno as u64 + cg * self.fpg as u64 + self.iblkno as u64;
		let within_cg = self.ino_in_cg(inr);
		let inopb = self.inopb as u64;
		let frag_off = (within_cg / inopb) * self.frag as u64;
		let addr = (cg_start_frag + frag_off) * self.fsize as u64;
		addr + (within_cg % inopb) * INODE_SIZE
	}

	/// number of logical fs-blocks needed to hold `fs_size` bytes.
	pub fn nblocks(&self) -> u64 {
		(self.size as u64 * self.fsize as u64).div_ceil(self.bsize as u64)
	}
}

pub const FS_MAGIC: i32 = 0x0195_4101;
pub const CG_MAGIC: i32 = 0x0909_0255;

/// Cylinder group descriptor. `struct cg` in FreeBSD, trimmed to the fields
/// the engine's bitmap walk (`cg_account`, `blk_alloc`/`blk_free`) needs.
#[derive(Debug, Clone, Decode, Encode)]
pub struct CylGroup {
	pub magic: i32,
	pub cgx: u32,
	pub ndblk: u32,
	pub cs: Csum,
	/// byte offset (from the start of this cg's block) of the free-block bitmap.
	pub freeoff: u32,
	/// byte offset of the used-inode bitmap.
	pub iusedoff: u32,
	pub niblk: u32,
}

/// How a logical block index resolves into an inode's pointer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeBlock {
	Direct(usize),
	Indirect1(usize),
	Indirect2(usize, usize),
	Indirect3(usize, usize, usize),
}

/// An on-disk inode. `struct ufs2_dinode` in FreeBSD, trimmed to regular
/// files: no device numbers, no shortlink union, no extended attributes.
#[derive(Debug, Clone, Decode, Encode)]
pub struct Inode {
	pub mode: u16,
	pub nlink: u16,
	pub uid: u32,
	pub gid: u32,
	pub size: u64,
	pub blocks: u64,
	pub flags: u32,
	pub gen: u32,
	pub direct: [i64; NDADDR],
	pub indirect: [i64; NIADDR],
}

impl Inode {
	pub fn is_snapshot(&self) -> bool {
		self.flags & SF_SNAPSHOT != 0
	}
}
