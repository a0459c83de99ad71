//! Synthetic `HostFs` image builder for tests. Mirrors the way the teacher's
//! `blockreader.rs` tests build a throwaway backing file, but in memory —
//! nothing here ships in non-test builds.

use std::io::Cursor;

use crate::decoder::Decoder;
use crate::geom::*;

const FRAG: i32 = 8;
const INODE_BYTES: u64 = INODE_SIZE;

/// Build a small, internally-consistent `HostFs` image: `ncg` cylinder
/// groups of `fpg` fragments each, `bsize`-byte blocks. Every fragment is
/// free except the metadata area each cg reserves for its own header,
/// bitmaps, and inode table.
pub fn make_image(ncg: u32, fpg: u32, bsize: u32) -> Vec<u8> {
	let fsize = bsize / FRAG;
	let ipg: u32 = 64;
	let inopb = fsize as u64 / INODE_BYTES;
	let cblkno_global = 1u64; // one fragment reserved for the superblock

	let freeoff: u32 = 64;
	let bitmap_bytes = fpg / 8;
	let iusedoff = freeoff + bitmap_bytes;
	assert!((iusedoff + ipg / 8) as u64 <= fsize as u64, "cg header overflows its fragment");

	let frags_for_inodes = (ipg as u64).div_ceil(inopb);
	let iblkno: u32 = 1; // fragment offset within cg, right after the header fragment
	let dblkno = (iblkno as u64 + frags_for_inodes).div_ceil(FRAG as u64) as u32 * FRAG as u32;
	assert!(dblkno < fpg, "cg too small to hold its own metadata");

	let total_frags = cblkno_global + ncg as u64 * fpg as u64;
	let buf = vec![0u8; (total_frags * fsize as u64) as usize];
	let mut dev = Decoder::new(Cursor::new(buf));

	let mut cstotal = CsumTotal::default();
	for cgi in 0..ncg {
		let cgo = (cblkno_global + cgi as u64 * fpg as u64) * fsize as u64;

		let nbfree = ((fpg - dblkno) / FRAG as u32) as i32;
		let cs = Csum { ndir: 0, nbfree, nifree: ipg as i32, nffree: 0 };
		let cg = CylGroup { magic: CG_MAGIC, cgx: cgi, ndblk: fpg, cs, freeoff, iusedoff, niblk: ipg };
		dev.encode_at(cgo, &cg).unwrap();

		let mut freebits = vec![0xffu8; bitmap_bytes as usize];
		for frag in 0..dblkno {
			freebits[(frag / 8) as usize] &= !(1 << (frag % 8));
		}
		dev.write_at(cgo + freeoff as u64, &freebits).unwrap();

		let usedbits = vec![0u8; (ipg / 8) as usize];
		dev.write_at(cgo + iusedoff as u64, &usedbits).unwrap();

		cstotal.nbfree += nbfree as i64;
		cstotal.nifree += ipg as i64;
	}

	let sb = Superblock {
		magic: FS_MAGIC,
		sblkno: 0,
		cblkno: cblkno_global as i32,
		iblkno: iblkno as i32,
		dblkno: dblkno as i32,
		ncg,
		bsize: bsize as i32,
		fsize: fsize as i32,
		frag: FRAG,
		bshift: bsize.trailing_zeros() as i32,
		fshift: fsize.trailing_zeros() as i32,
		fragshift: FRAG.trailing_zeros() as i32,
		ipg,
		fpg: fpg as i32,
		inopb: inopb as u32,
		size: total_frags as i64,
		dsize: (ncg as u64 * (fpg - dblkno) as u64) as i64,
		cstotal,
		clean: 1,
		contigsumsize: 0,
		snapinum: [0; FSMAXSNAP],
		snapnames: [[0; 16]; FSMAXSNAP],
	};
	dev.encode_at(0, &sb).unwrap();

	dev.inner_mut().get_ref().clone()
}
