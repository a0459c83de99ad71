//! Per-device ordered list of live snapshots and install/uninstall of the
//! COW hook.
//!
//! The engine models "the device" as owned by a single `Registry` guarded
//! by a mutex (see SPEC_FULL.md §5) — there is only one live call path in
//! the reference `HostFs`, but the mutex preserves the locking discipline a
//! real multi-threaded host would need.

use std::sync::{Mutex, MutexGuard};

use crate::error::SnapError;
use crate::host::InodeNum;

struct Inner {
	/// creation order, oldest first (invariant I4).
	snapshots:     Vec<InodeNum>,
	cow_installed: bool,
}

pub struct Registry {
	inner: Mutex<Inner>,
	/// Models the source's per-task `COW_IN_PROGRESS` flag as an explicit
	/// token instead of ambient thread-local state, per the design notes:
	/// held for the duration of one `copy_on_write` dispatch, and recursion
	/// attempts fail `try_lock` rather than silently reentering.
	cow_lock: Mutex<()>,
}

/// Proof that the COW hook is not already running on this device. Obtained
/// from [`Registry::begin_cow`]; `copy_on_write` requires one by reference.
pub struct CowGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	pub fn new() -> Self {
		Self {
			inner:    Mutex::new(Inner { snapshots: Vec::new(), cow_installed: false }),
			cow_lock: Mutex::new(()),
		}
	}

	/// Rebuild from a persisted `fs_snapinum` array (mount time).
	pub fn from_snapinum(entries: &[InodeNum]) -> Self {
		let reg = Self::new();
		let mut inner = reg.inner.lock().unwrap();
		inner.snapshots = entries.to_vec();
		inner.cow_installed = !inner.snapshots.is_empty();
		drop(inner);
		reg
	}

	/// Acquire the COW re-entry guard. Fails with `Internal` if the COW hook
	/// is already running on this device — recursion is a fatal invariant
	/// violation, never silent reentry.
	pub fn begin_cow(&self) -> Result<CowGuard<'_>, SnapError> {
		self.cow_lock.try_lock().map(CowGuard).map_err(|_| {
			log::error!("copy_on_write: recursive entry");
			SnapError::Internal
		})
	}

	/// Snapshots in creation order, oldest first.
	pub fn snapshots(&self) -> Vec<InodeNum> {
		self.inner.lock().unwrap().snapshots.clone()
	}

	pub fn contains(&self, inr: InodeNum) -> bool {
		self.inner.lock().unwrap().snapshots.contains(&inr)
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().unwrap().snapshots.is_empty()
	}

	/// Append a newly created snapshot to the end of the list, installing
	/// the COW hook if this is the device's first snapshot.
	pub fn append(&self, inr: InodeNum) {
		let mut inner = self.inner.lock().unwrap();
		inner.snapshots.push(inr);
		inner.cow_installed = true;
		log::info!("registry: snapshot {inr} appended ({} total)", inner.snapshots.len());
	}

	/// Detach a snapshot, uninstalling the COW hook if it was the last one.
	pub fn detach(&self, inr: InodeNum) {
		let mut inner = self.inner.lock().unwrap();
		inner.snapshots.retain(|&x| x != inr);
		if inner.snapshots.is_empty() {
			inner.cow_installed = false;
			log::info!("registry: last snapshot removed, COW hook uninstalled");
		}
	}

	pub fn cow_installed(&self) -> bool {
		self.inner.lock().unwrap().cow_installed
	}

	/// Drop all snapshots and uninstall the COW hook (unmount).
	pub fn clear(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.snapshots.clear();
		inner.cow_installed = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn append_installs_hook_detach_uninstalls() {
		let reg = Registry::new();
		assert!(!reg.cow_installed());
		reg.append(5);
		assert!(reg.cow_installed());
		reg.append(9);
		assert_eq!(reg.snapshots(), vec![5, 9]);
		reg.detach(5);
		assert!(reg.cow_installed());
		reg.detach(9);
		assert!(!reg.cow_installed());
	}
}
