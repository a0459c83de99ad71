//! End-to-end CLI coverage, in the style of the teacher's own
//! `tests/integration.rs` (`assert_cmd` driving the built binary against a
//! throwaway image) but with a synthetic image instead of a golden `.img.zst`
//! fixture, since this engine has no real-world UFS2 images to borrow.

use std::io::Cursor;

use assert_cmd::Command;
use predicates::prelude::*;
use snapfs::decoder::Decoder;
use snapfs::geom::*;
use snapfs::host::HostFs;
use tempfile::NamedTempFile;

const FRAG: i32 = 8;

/// Build a small, internally-consistent image with one pre-allocated regular
/// file inode, and return its path plus that inode's number.
fn build_image() -> (NamedTempFile, u32) {
	let ncg = 2u32;
	let fpg = 8192u32;
	let bsize = 1024u32;
	let fsize = bsize / FRAG;
	let ipg: u32 = 64;
	let inopb = fsize as u64 / INODE_SIZE;
	let cblkno_global = 1u64;

	let freeoff: u32 = 64;
	let bitmap_bytes = fpg / 8;
	let iusedoff = freeoff + bitmap_bytes;

	let frags_for_inodes = (ipg as u64).div_ceil(inopb);
	let iblkno: u32 = 1;
	let dblkno = (iblkno as u64 + frags_for_inodes).div_ceil(FRAG as u64) as u32 * FRAG as u32;

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
		dev.write_at(cgo + iusedoff as u64, &vec![0u8; (ipg / 8) as usize]).unwrap();

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

	let raw = dev.inner_mut().get_ref().clone();
	let mut host = HostFs::new(Cursor::new(raw)).unwrap();
	let (inr, _) = host.inode_alloc(0o100644, 0).unwrap();

	let file = NamedTempFile::new().unwrap();
	std::fs::write(file.path(), host.dev_mut().inner_mut().get_ref()).unwrap();
	(file, inr)
}

#[test]
fn create_list_stat_rm_roundtrip() {
	let (img, _inode) = build_image();

	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["create", img.path().to_str().unwrap(), "nightly"])
		.assert()
		.success();

	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["list", img.path().to_str().unwrap()])
		.assert()
		.success()
		.stdout(predicate::str::contains("nightly"));

	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["stat", img.path().to_str().unwrap(), "nightly"])
		.assert()
		.success();

	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["rm", img.path().to_str().unwrap(), "nightly"])
		.assert()
		.success();

	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["list", img.path().to_str().unwrap()])
		.assert()
		.success()
		.stdout(predicate::str::contains("nightly").not());
}

#[test]
fn write_materializes_a_copy_under_a_live_snapshot() {
	let (img, inode) = build_image();
	let path = img.path().to_str().unwrap();

	// Allocate and populate lbn 0 of the live file *before* the snapshot
	// exists, so `cg_account` finds it in-use and leaves the snapshot's own
	// slot as a `Hole` (a block that's free at snapshot time is tagged
	// `NoCopy` instead and never needs capturing — see cgaccount.rs).
	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["write", path, &inode.to_string(), "0", "01020304"])
		.assert()
		.success();

	Command::cargo_bin("snapfs").unwrap().args(["create", path, "before"]).assert().success();

	// Overwriting that same block now must trip the COW hook.
	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["write", path, &inode.to_string(), "0", "deadbeef"])
		.assert()
		.success();

	Command::cargo_bin("snapfs")
		.unwrap()
		.args(["stat", path, "before"])
		.assert()
		.success()
		.stdout(predicate::str::contains("1 block(s) copied"));
}

#[test]
fn duplicate_snapshot_name_is_rejected() {
	let (img, _inode) = build_image();
	let path = img.path().to_str().unwrap();

	Command::cargo_bin("snapfs").unwrap().args(["create", path, "dup"]).assert().success();
	Command::cargo_bin("snapfs").unwrap().args(["create", path, "dup"]).assert().failure();
}
