//! Typed, seekable access to the backing device.
//!
//! Adapted from the teacher's `Decoder<T>` (`rufs::decoder`). The buffer
//! cache itself is an external collaborator per spec.md §1 ("out of
//! scope"), so unlike the teacher we don't interpose a block-buffering
//! layer here — `Decoder` talks straight to the `Backend`. `BlockIO`
//! (`blockio.rs`) reads through the same backend but never through an
//! inode's own resolution path, which is the bypass the spec actually
//! cares about (see SPEC_FULL.md §4).
//!
//! Unlike the teacher, we don't auto-detect big/little-endian superblocks:
//! `HostFs` is our own stand-in format, not a real cross-platform UFS2
//! image, so there's only one encoding.

use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};

use bincode::{Decode, Encode};

use crate::err;

/// Anything the engine can treat as a random-access device.
pub trait Backend: Read + Write + Seek {}
impl<T: Read + Write + Seek> Backend for T {}

fn codec() -> impl bincode::config::Config {
	bincode::config::standard().with_fixed_int_encoding().with_little_endian()
}

/// Decode a value out of an in-memory buffer (a block already read off the
/// device), rather than the stream directly — used when a caller needs to
/// patch a single struct inside a larger block it already holds.
pub fn decode_slice<X: Decode>(buf: &[u8]) -> IoResult<X> {
	bincode::decode_from_slice(buf, codec()).map(|(v, _)| v).map_err(|_| err!(EIO))
}

/// Encode a value into an in-memory buffer at its start.
pub fn encode_slice<X: Encode>(val: &X, buf: &mut [u8]) -> IoResult<()> {
	bincode::encode_into_slice(val, buf, codec()).map(|_| ()).map_err(|_| err!(EIO))
}

pub struct Decoder<T: Backend> {
	inner: T,
}

impl<T: Backend> Decoder<T> {
	pub fn new(inner: T) -> Self {
		Self { inner }
	}

	pub fn inner_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn seek(&mut self, pos: u64) -> IoResult<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}

	pub fn read(&mut self, buf: &mut [u8]) -> IoResult<()> {
		self.inner.read_exact(buf)
	}

	pub fn write(&mut self, buf: &[u8]) -> IoResult<()> {
		self.inner.write_all(buf)
	}

	pub fn decode<X: Decode>(&mut self) -> IoResult<X> {
		bincode::decode_from_std_read(&mut self.inner, codec()).map_err(|_| err!(EIO))
	}

	pub fn encode<X: Encode>(&mut self, val: &X) -> IoResult<()> {
		bincode::encode_into_std_write(val, &mut self.inner, codec())
			.map(|_| ())
			.map_err(|_| err!(EIO))
	}

	pub fn decode_at<X: Decode>(&mut self, pos: u64) -> IoResult<X> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn encode_at<X: Encode>(&mut self, pos: u64, val: &X) -> IoResult<()> {
		self.seek(pos)?;
		self.encode(val)
	}

	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> IoResult<()> {
		self.seek(pos)?;
		self.read(buf)
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> IoResult<()> {
		self.seek(pos)?;
		self.write(buf)
	}

	/// Fill `len` bytes starting at `pos` with a repeated byte; used to
	/// clear a freed inode's on-disk slot.
	pub fn fill_at(&mut self, pos: u64, byte: u8, len: usize) -> IoResult<()> {
		self.seek(pos)?;
		let buf = vec![byte; len];
		self.write(&buf)
	}
}
