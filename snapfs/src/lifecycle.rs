//! Snapshot-lifecycle orchestration: `create_snapshot`, `snap_remove`,
//! `snap_gone`, `mount_associate`, `unmount_dissociate`.
//!
//! `create_snapshot` is a sequence of private phase methods on
//! [`CreateBuilder`], each able to bail out through a single `rollback()` —
//! the builder-with-explicit-rollback the design notes call for in place
//! of the source's `goto` chain. No teacher file has anything like this
//! procedure; the shape (private phase methods, `log::info!` at phase
//! boundaries, one rollback path) follows the crate's own idiom rather
//! than a ported algorithm.

use std::collections::HashMap;

use crate::accountant::Accountant;
use crate::blkfree::snap_blk_free;
use crate::cgaccount::{cg_account, ActiveGroupBitmap};
use crate::decoder::{encode_slice, Backend};
use crate::error::{SnapError, SnapResult};
use crate::geom::{BlockRef, Inode, FSMAXSNAP, NDADDR, NIADDR, SF_SNAPSHOT};
use crate::host::{HostFs, InodeNum};
use crate::registry::Registry;
use crate::snapstore::ensure_private_copy;
use crate::treewalker::expunge;

/// `HostFs` has no directories (see `SPEC_FULL.md` §3), so `snapfs-cli`
/// needs somewhere to key `create`/`rm`/`stat` by name. Not part of the
/// engine's own invariants — purely a convenience the CLI layers on top.
#[derive(Default)]
pub struct NameTable(HashMap<String, InodeNum>);

impl NameTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, name: &str) -> Option<InodeNum> {
		self.0.get(name).copied()
	}

	pub fn insert(&mut self, name: &str, inr: InodeNum) {
		self.0.insert(name.to_string(), inr);
	}

	pub fn remove(&mut self, name: &str) -> Option<InodeNum> {
		self.0.remove(name)
	}

	pub fn remove_by_inode(&mut self, inr: InodeNum) {
		self.0.retain(|_, &mut v| v != inr);
	}

	pub fn name_of(&self, inr: InodeNum) -> Option<String> {
		self.0.iter().find(|(_, &v)| v == inr).map(|(k, _)| k.clone())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, InodeNum)> {
		self.0.iter().map(|(k, &v)| (k.as_str(), v))
	}
}

/// Builds one snapshot through the 15-phase procedure, phase-by-phase, with
/// a single rollback path on any failure after the inode is created.
pub struct CreateBuilder<'a, T: Backend> {
	host:     &'a mut HostFs<T>,
	registry: &'a Registry,
	names:    &'a mut NameTable,
	name:     String,
	snap_inr: Option<InodeNum>,
}

impl<'a, T: Backend> CreateBuilder<'a, T> {
	pub fn new(
		host: &'a mut HostFs<T>,
		registry: &'a Registry,
		names: &'a mut NameTable,
		name: &str,
	) -> Self {
		Self { host, registry, names, name: name.to_string(), snap_inr: None }
	}

	pub fn run(mut self) -> SnapResult<InodeNum> {
		if self.names.get(&self.name).is_some() {
			return Err(SnapError::Exists);
		}
		if self.registry.snapshots().len() >= FSMAXSNAP {
			return Err(SnapError::NoSpace);
		}
		match self.try_run() {
			Ok(inr) => Ok(inr),
			Err(e) => {
				self.rollback();
				Err(e)
			}
		}
	}

	fn try_run(&mut self) -> SnapResult<InodeNum> {
		// phases 1-2: slot reservation already checked in `run`; create the
		// backing inode now ("exclusively", enforced by the `names` check).
		let (snap_inr, mut snap_ino) = self.host.inode_alloc(0o100400, 0)?;
		self.snap_inr = Some(snap_inr);
		log::info!("create_snapshot({}): reserved inode {snap_inr} (phases 1-2)", self.name);

		// phase 3: preallocate. The literal "meta-only indirect preallocation"
		// pass is subsumed by `set_block`'s lazy, idempotent allocation of
		// indirect blocks wherever cg_account/ensure_private_copy need one —
		// see DESIGN.md.
		snap_ino.size = self.host.superblock().nblocks() * self.host.superblock().bsize as u64;
		self.host.write_inode(snap_inr, &snap_ino)?;

		// phase 4: first-pass cg capture.
		let ncg = self.host.superblock().ncg;
		let mut active = ActiveGroupBitmap::new(ncg);
		for cgi in 0..ncg as u64 {
			cg_account(self.host, snap_inr, &mut snap_ino, &mut active, cgi, 1)?;
		}
		log::info!("create_snapshot({}): pass 1 cg capture done", self.name);

		// phase 5: mark as snapshot, fsync.
		snap_ino.flags |= SF_SNAPSHOT;
		self.host.write_inode(snap_inr, &snap_ino)?;

		// phase 6: suspend. The reference `HostFs` has exactly one caller in
		// flight at a time, so there is no concurrent writer to race against;
		// the log line stands in for the suspend/resume bracket a real
		// multi-threaded host would need.
		log::info!("create_snapshot({}): suspending filesystem writes (phase 6)", self.name);

		// phase 7: second-pass cg capture for groups that changed since pass 1.
		for cgi in 0..ncg as u64 {
			if !active.is_captured(cgi) {
				cg_account(self.host, snap_inr, &mut snap_ino, &mut active, cgi, 2)?;
			}
		}

		// phases 8 + 14: snapshot the superblock and embed it in the
		// snapshot file. Cylinder-summary embedding is not modeled — only
		// the dense `snapinum` array (invariant I5) is load-bearing for the
		// tested properties, and it's carried inside the `Superblock`
		// struct wholesale. See DESIGN.md.
		let sb_copy = self.host.superblock().clone();
		self.write_superblock_copy(snap_inr, &mut snap_ino, &sb_copy)?;

		// phase 9: un-suspend for housekeeping, expunge unlinked/typeless
		// inodes out of the snapshot. The reference `HostFs`'s inode table
		// cannot mutate mid-scan (no concurrent unlink path exists), so the
		// "restart on reclaim" rule is vacuous here.
		self.expunge_unlinked_inodes(snap_inr, &mut snap_ino)?;

		// phase 10: append to registry, install COW hook if needed.
		self.registry.append(snap_inr);
		self.names.insert(&self.name, snap_inr);
		sync_registry_meta(self.host, self.registry, self.names)?;
		log::info!("create_snapshot({}): appended to registry (phase 10)", self.name);

		// phase 11: resume (log only, see phase 6).
		log::info!("create_snapshot({}): resuming filesystem writes (phase 11)", self.name);

		// phase 12: expunge every older snapshot out of this one, tagging
		// their blocks `SnapOwn` so this snapshot never double-claims them.
		for older in self.registry.snapshots() {
			if older == snap_inr {
				continue;
			}
			let older_ino = self.host.read_inode(older)?;
			if let Err(e) = expunge(
				self.host,
				snap_inr,
				&mut snap_ino,
				older,
				&older_ino,
				Accountant::Snap,
				BlockRef::SnapOwn,
				true,
			) {
				log::error!("create_snapshot({}): expunge of older snapshot {older} failed: {e}", self.name);
				return Err(e);
			}
		}

		// phase 13: expunge self — return this snapshot's own private-copy
		// blocks to its embedded free bitmap, not the live allocator (see
		// `treewalker::Sink::free_block`'s doc comment and DESIGN.md).
		let self_ino = snap_ino.clone();
		expunge(
			self.host,
			snap_inr,
			&mut snap_ino,
			snap_inr,
			&self_ino,
			Accountant::Map,
			BlockRef::SnapOwn,
			false,
		)?;

		self.host.write_inode(snap_inr, &snap_ino)?;
		log::info!("create_snapshot({}): complete, inode {snap_inr}", self.name);
		Ok(snap_inr)
	}

	fn write_superblock_copy(
		&mut self,
		snap_inr: InodeNum,
		snap_ino: &mut Inode,
		sb_copy: &crate::geom::Superblock,
	) -> SnapResult<()> {
		let bsize = sb_copy.bsize as usize;
		let addr = ensure_private_copy(self.host, snap_inr, snap_ino, 0)?;
		let mut block = vec![0u8; bsize];
		self.host.read_data(addr, &mut block)?;
		encode_slice(sb_copy, &mut block)?;
		self.host.write_data(addr, &block)?;
		Ok(())
	}

	fn expunge_unlinked_inodes(&mut self, snap_inr: InodeNum, snap_ino: &mut Inode) -> SnapResult<()> {
		let ninodes = self.host.ninodes();
		for inr in 0..ninodes as u32 {
			if inr == snap_inr || !self.host.inode_in_use(inr)? {
				continue;
			}
			let mut ino = self.host.read_inode(inr)?;
			if ino.nlink == 0 || ino.mode == 0 {
				log::trace!("create_snapshot: expunging unlinked/typeless inode {inr} (phase 9)");
				self.expunge_with_fragment_tail(snap_inr, snap_ino, inr, &mut ino)?;
			}
		}
		Ok(())
	}

	/// Phase 9's fragment-tail special case: if `ino`'s last block is a
	/// fragment rather than a whole block, `expunge`'s block-level
	/// accounting (which treats every direct pointer as covering a full
	/// `fs_bsize`) would mis-tag it, so free just the fragment to the live
	/// allocator directly first, then run `expunge` with that direct
	/// pointer temporarily zeroed, and restore it afterward.
	fn expunge_with_fragment_tail(
		&mut self,
		snap_inr: InodeNum,
		snap_ino: &mut Inode,
		inr: InodeNum,
		ino: &mut Inode,
	) -> SnapResult<()> {
		let bsize = self.host.superblock().bsize as u64;
		let tail_frag = if ino.size == 0 { 0 } else { ino.size % bsize };
		let last_lbn = if ino.size == 0 { None } else { Some(((ino.size - 1) / bsize) as usize) };

		if let (Some(lbn), frag_size) = (last_lbn, tail_frag) {
			if frag_size != 0 && lbn < NDADDR {
				if let BlockRef::Real(addr) = BlockRef::decode(ino.direct[lbn]) {
					self.host.blk_free(addr, frag_size)?;
					log::trace!(
						"create_snapshot: inode {inr}'s tail fragment at lbn {lbn} ({frag_size} bytes) freed directly (phase 9)"
					);
					let saved = ino.direct[lbn];
					ino.direct[lbn] = BlockRef::Hole.encode();
					let result = expunge(self.host, snap_inr, snap_ino, inr, ino, Accountant::Full, BlockRef::NoCopy, true);
					ino.direct[lbn] = saved;
					return result;
				}
			}
		}
		expunge(self.host, snap_inr, snap_ino, inr, ino, Accountant::Full, BlockRef::NoCopy, true)
	}

	/// Phase 15: on any failure after the inode was created, free it and
	/// drop the reserved name. Blocks already copied into it by a failed
	/// cg-capture or expunge pass are not reclaimed — see DESIGN.md.
	fn rollback(&mut self) {
		if let Some(inr) = self.snap_inr.take() {
			log::warn!("create_snapshot({}): rolling back partially-built inode {inr}", self.name);
			let _ = self.host.inode_free(inr);
		}
		self.names.remove(&self.name);
	}
}

fn encode_name(name: &str) -> [u8; 16] {
	let mut slot = [0u8; 16];
	let bytes = name.as_bytes();
	let n = bytes.len().min(15);
	slot[..n].copy_from_slice(&bytes[..n]);
	slot
}

fn decode_name(slot: &[u8; 16]) -> Option<String> {
	let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
	if end == 0 {
		return None;
	}
	std::str::from_utf8(&slot[..end]).ok().map(String::from)
}

/// Rewrite both `fs_snapinum` and its parallel name table from the
/// in-memory registry/name-table, keeping them dense and in creation order.
fn sync_registry_meta<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	names: &NameTable,
) -> SnapResult<()> {
	let snaps = registry.snapshots();
	if snaps.len() > FSMAXSNAP {
		return Err(SnapError::Internal);
	}
	host.update_sb(|sb| {
		let mut inums = [0u32; FSMAXSNAP];
		let mut slots = [[0u8; 16]; FSMAXSNAP];
		for (i, &inr) in snaps.iter().enumerate() {
			inums[i] = inr;
			if let Some(name) = names.name_of(inr) {
				slots[i] = encode_name(&name);
			}
		}
		sb.snapinum = inums;
		sb.snapnames = slots;
	})?;
	Ok(())
}

/// Remove a snapshot: detach it from the registry, sweep its sentinel and
/// claimed-at-home pointers (letting a remaining snapshot inherit any
/// still-needed claim via `snap_blk_free`), then clear its snapshot flag.
pub fn snap_remove<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	names: &NameTable,
	inr: InodeNum,
	dopersistence: bool,
) -> SnapResult<()> {
	if !registry.contains(inr) {
		return Ok(()); // idempotent, per spec.md §7
	}
	registry.detach(inr);

	let mut ino = host.read_inode(inr)?;
	sweep_tree(host, registry, &mut ino, inr, dopersistence)?;
	ino.flags &= !SF_SNAPSHOT;
	host.write_inode(inr, &ino)?;
	sync_registry_meta(host, registry, names)?;
	log::info!("snap_remove: {inr} detached and swept");
	Ok(())
}

/// Called when the last name for a snapshot is unlinked: drop it from the
/// registry (idempotent if `snap_remove` already did), compact
/// `fs_snapinum`, and free the inode.
pub fn snap_gone<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	names: &mut NameTable,
	inr: InodeNum,
) -> SnapResult<()> {
	registry.detach(inr);
	names.remove_by_inode(inr);
	sync_registry_meta(host, registry, names)?;
	host.inode_free(inr)?;
	log::info!("snap_gone: {inr} freed");
	Ok(())
}

/// Mount time: rebuild the registry and name table from `fs_snapinum` /
/// its parallel name array, dropping (and logging) any entry whose inode
/// lost the snapshot flag.
pub fn mount_associate<T: Backend>(host: &mut HostFs<T>) -> SnapResult<(Registry, NameTable)> {
	let registry = Registry::new();
	let mut names = NameTable::new();
	let inums = host.superblock().snapinum;
	let slots = host.superblock().snapnames;
	for (inr, slot) in inums.into_iter().zip(slots.into_iter()) {
		if inr == 0 {
			continue;
		}
		match host.read_inode(inr) {
			Ok(ino) if ino.is_snapshot() => {
				registry.append(inr);
				if let Some(name) = decode_name(&slot) {
					names.insert(&name, inr);
				}
			}
			Ok(_) => log::warn!("mount_associate: inode {inr} lost SNAPSHOT flag, dropping"),
			Err(e) => log::warn!("mount_associate: failed to read inode {inr}: {e}"),
		}
	}
	sync_registry_meta(host, &registry, &names)?;
	log::info!("mount_associate: {} snapshot(s) associated", registry.snapshots().len());
	Ok((registry, names))
}

/// Unmount time: dissociate every snapshot inode and uninstall the COW hook.
pub fn unmount_dissociate(registry: &Registry) {
	registry.clear();
	log::info!("unmount_dissociate: registry cleared");
}

fn sweep_tree<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	ino: &mut Inode,
	inr: InodeNum,
	dopersistence: bool,
) -> SnapResult<()> {
	for (i, ptr) in ino.direct.iter_mut().enumerate() {
		sweep_ptr(host, registry, ptr, i as u64, inr, dopersistence)?;
	}

	let nindir = host.nindir();
	let mut rlbn = NDADDR as u64;
	let mut blksperindir = nindir;
	for level in 0..NIADDR {
		if ino.indirect[level] != 0 {
			let root = ino.indirect[level] as u64;
			sweep_indirect(host, registry, level, root, rlbn, blksperindir, inr, dopersistence)?;
			let bsize = host.superblock().bsize as u64;
			host.blk_free(root, bsize)?;
			ino.indirect[level] = 0;
		}
		rlbn += blksperindir;
		blksperindir *= nindir;
	}
	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sweep_ptr<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	ptr: &mut i64,
	lbn: u64,
	inr: InodeNum,
	dopersistence: bool,
) -> SnapResult<()> {
	match BlockRef::decode(*ptr) {
		BlockRef::Hole => {}
		BlockRef::NoCopy | BlockRef::SnapOwn => *ptr = BlockRef::Hole.encode(),
		BlockRef::Real(addr) => {
			let bsize = host.superblock().bsize as u64;
			let home = host.superblock().blocks_to_frags(lbn);
			if addr == home {
				if !snap_blk_free(host, registry, addr, bsize, inr, dopersistence)? {
					host.blk_free(addr, bsize)?;
				}
			} else {
				host.blk_free(addr, bsize)?;
			}
			*ptr = BlockRef::Hole.encode();
		}
	}
	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sweep_indirect<T: Backend>(
	host: &mut HostFs<T>,
	registry: &Registry,
	level: usize,
	blkno: u64,
	rlbn: u64,
	blksperindir: u64,
	inr: InodeNum,
	dopersistence: bool,
) -> SnapResult<()> {
	let nindir = host.nindir();
	let mut buf = vec![0i64; nindir as usize];
	host.read_pblock(blkno, &mut buf)?;
	for (i, ptr) in buf.iter_mut().enumerate() {
		let lbn = rlbn + i as u64 * blksperindir;
		if level > 0 {
			if let BlockRef::Real(addr) = BlockRef::decode(*ptr) {
				sweep_indirect(host, registry, level - 1, addr, lbn, blksperindir / nindir, inr, dopersistence)?;
				let bsize = host.superblock().bsize as u64;
				host.blk_free(addr, bsize)?;
				*ptr = 0;
			}
		} else {
			sweep_ptr(host, registry, ptr, lbn, inr, dopersistence)?;
		}
	}
	host.write_pblock(blkno, &buf)?;
	Ok(())
}
