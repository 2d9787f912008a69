//! Simultaneous remapping of file descriptors.

use nix::{
	fcntl::{self, FcntlArg, OFlag}, sys::stat::Mode, unistd
};
use serde::{Deserialize, Serialize};
use std::{
	collections::{btree_map, BTreeMap}, ffi::CStr, iter::FromIterator, os::unix::io::AsRawFd
};

use supervise_internal::Fd;

/// A batch of fd updates, mapping targets to sources.
///
/// The updates are all done "simultaneously": every target becomes a copy of what its source referred to *before*
/// the batch. So to point two fds at the same new file, instead of `{ 1: desired, 2: 1 }` write
/// `{ 1: desired, 2: desired }`.
///
/// This is only an update. Fds not mentioned as targets are inherited as normal; they are certainly not closed by
/// brute force. If you want them closed, mark them `FD_CLOEXEC`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct Fds(BTreeMap<Fd, Fd>);

impl Fds {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make `target` a copy of `source`. Either can be a raw fd or anything exposing one.
	pub fn insert<T, S>(&mut self, target: &T, source: &S) -> &mut Self
	where
		T: AsRawFd + ?Sized,
		S: AsRawFd + ?Sized,
	{
		let _ = self.0.insert(target.as_raw_fd(), source.as_raw_fd());
		self
	}

	/// Builder-style [`insert()`](Fds::insert).
	pub fn with<T, S>(mut self, target: &T, source: &S) -> Self
	where
		T: AsRawFd + ?Sized,
		S: AsRawFd + ?Sized,
	{
		let _ = self.insert(target, source);
		self
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Iterate over `(target, source)` pairs.
	pub fn iter(&self) -> impl Iterator<Item = (Fd, Fd)> + '_ {
		self.0.iter().map(|(&target, &source)| (target, source))
	}

	pub fn is_target(&self, fd: Fd) -> bool {
		self.0.contains_key(&fd)
	}

	pub(crate) fn max_target(&self) -> Option<Fd> {
		self.0.keys().next_back().copied()
	}
}

impl FromIterator<(Fd, Fd)> for Fds {
	fn from_iter<I: IntoIterator<Item = (Fd, Fd)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl IntoIterator for Fds {
	type Item = (Fd, Fd);
	type IntoIter = btree_map::IntoIter<Fd, Fd>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

/// Check whether `fd` refers to an open file descriptor.
pub fn is_valid_fd(fd: Fd) -> bool {
	fcntl::fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Apply `fds` to this process's fd table. See [Fds].
pub fn update_fds(fds: &Fds) -> nix::Result<()> {
	Remap::new(fds).apply()
}

/// A prepared [Fds] batch.
///
/// All storage is sized up front so that [`apply()`](Remap::apply) doesn't allocate, which lets it run between
/// `fork()` and `execve()`.
#[derive(Debug)]
pub struct Remap {
	updates: Vec<(Fd, Fd)>,
	// (source, dup(source)) for every fd that is both a source and a target
	copies: Vec<(Fd, Fd)>,
}

impl Remap {
	pub fn new(fds: &Fds) -> Self {
		let updates = fds.iter().collect::<Vec<_>>();
		let copies = Vec::with_capacity(updates.len());
		Self { updates, copies }
	}

	pub fn apply(&mut self) -> nix::Result<()> {
		let mut devnull = None;
		let result = self.remap(&mut devnull);
		// scratch fds are never visible to the caller, whatever happened
		for &(_, copy) in &self.copies {
			let _ = unistd::close(copy);
		}
		self.copies.clear();
		if let Some(devnull) = devnull {
			// if open() handed back a target, that slot has since been dup2'd over
			if !self.is_target(devnull) {
				let _ = unistd::close(devnull);
			}
		}
		result
	}

	fn remap(&mut self, devnull: &mut Option<Fd>) -> nix::Result<()> {
		let mut ensured = false;
		for i in 0..self.updates.len() {
			let source = self.updates[i].1;
			if self.is_target(source) && self.copy_of(source).is_none() {
				// dup() returns the lowest free fd, which could be a target we haven't yet written to. So before the
				// first dup make sure every target is open.
				if !ensured {
					self.ensure_targets_open(devnull)?;
					ensured = true;
				}
				let copy = unistd::dup(source)?;
				self.copies.push((source, copy));
			}
		}
		for &(target, source) in &self.updates {
			let source = self.copy_of(source).unwrap_or(source);
			let _ = unistd::dup2(source, target)?;
		}
		Ok(())
	}

	fn ensure_targets_open(&self, devnull: &mut Option<Fd>) -> nix::Result<()> {
		for &(target, _) in &self.updates {
			if !is_valid_fd(target) {
				let null = match *devnull {
					Some(null) => null,
					None => {
						let null = fcntl::open(dev_null(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
						*devnull = Some(null);
						null
					}
				};
				if null != target {
					let _ = unistd::dup2(null, target)?;
				}
			}
		}
		Ok(())
	}

	fn is_target(&self, fd: Fd) -> bool {
		self.updates.iter().any(|&(target, _)| target == fd)
	}

	fn copy_of(&self, source: Fd) -> Option<Fd> {
		self.copies
			.iter()
			.find(|&&(original, _)| original == source)
			.map(|&(_, copy)| copy)
	}
}

fn dev_null() -> &'static CStr {
	match CStr::from_bytes_with_nul(b"/dev/null\0") {
		Ok(path) => path,
		Err(_) => unreachable!(),
	}
}
