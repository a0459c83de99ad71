//! Synchronous physical-block access that bypasses any inode-relative
//! resolution path. Needed so indirect-block reads during `TreeWalker`'s
//! descent never recurse back through an inode's own block map.

use std::io::Result as IoResult;

use crate::decoder::{Backend, Decoder};
use crate::geom::Superblock;

/// logical filesystem block number -> fragment address.
pub fn lbn_to_frag(sb: &Superblock, lbn: u64) -> u64 {
	sb.blocks_to_frags(lbn)
}

/// Read `buf.len()` bytes starting at fragment-address `frag` straight off
/// the device.
pub fn read_block<T: Backend>(dev: &mut Decoder<T>, sb: &Superblock, frag: u64, buf: &mut [u8]) -> IoResult<()> {
	dev.read_at(frag * sb.fsize as u64, buf)
}

/// Write `buf` at fragment-address `frag`, bypassing any cache.
pub fn write_block<T: Backend>(dev: &mut Decoder<T>, sb: &Superblock, frag: u64, buf: &[u8]) -> IoResult<()> {
	dev.write_at(frag * sb.fsize as u64, buf)
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::testutil::make_image;

	#[test]
	fn read_write_bypasses_resolution() {
		let img = make_image(1, 512, 4096);
		let mut dev = Decoder::new(Cursor::new(img));
		let sb: Superblock = dev.decode_at(0).unwrap();

		let data = vec![0xabu8; sb.fsize as usize];
		write_block(&mut dev, &sb, 20, &data).unwrap();
		let mut out = vec![0u8; sb.fsize as usize];
		read_block(&mut dev, &sb, 20, &mut out).unwrap();
		assert_eq!(data, out);
	}
}
