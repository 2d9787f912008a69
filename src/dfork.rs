//! Launching a process under the supervise utility.

use log::{debug, trace};
use more_asserts::*;
use nix::{
	errno::Errno, fcntl::{self, FcntlArg, FdFlag}, libc, sys::{
		signal::{self, SigHandler, Signal}, socket::{self, AddressFamily, SockFlag, SockProtocol, SockType}
	}, unistd::{self, ForkResult}
};
use serde::{Deserialize, Serialize};
use std::{
	collections::BTreeMap, env, ffi::{CStr, CString, OsStr, OsString}, os::unix::{
		ffi::OsStrExt, io::{AsRawFd, FromRawFd, OwnedFd, RawFd}
	}, ptr
};

use super::{
	fds::{Fds, Remap}, Error
};
use supervise_internal::{forbid_alloc, SUPERVISE};

/// Flags for the channel between us and the helper.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct ChannelFlags {
	/// Don't leak our end of the channel into other processes we exec.
	pub cloexec: bool,
	/// Create the channel non-blocking. [Process](crate::Process) makes its end non-blocking regardless.
	pub nonblock: bool,
}
impl Default for ChannelFlags {
	fn default() -> Self {
		Self {
			cloexec: true,
			nonblock: false,
		}
	}
}
impl From<ChannelFlags> for SockFlag {
	fn from(flags: ChannelFlags) -> Self {
		let mut sock_flags = SockFlag::empty();
		if flags.cloexec {
			sock_flags |= SockFlag::SOCK_CLOEXEC;
		}
		if flags.nonblock {
			sock_flags |= SockFlag::SOCK_NONBLOCK;
		}
		sock_flags
	}
}

/// How to launch a process.
///
/// ```
/// # use supervise_api::Options;
/// let options = Options {
/// 	cwd: Some(String::from("/tmp")),
/// 	..Options::default()
/// };
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Options {
	/// Updates to the environment. Only updates: clearing the environment is not supported.
	pub env: BTreeMap<String, String>,
	/// The working directory to change to.
	pub cwd: Option<String>,
	/// Updates to the fd table of the new process. See [Fds].
	pub fds: Fds,
	pub flags: ChannelFlags,
	/// The supervising helper, looked up on the `PATH` of the updated environment.
	pub helper: String,
}
impl Default for Options {
	fn default() -> Self {
		Self {
			env: BTreeMap::new(),
			cwd: None,
			fds: Fds::new(),
			flags: ChannelFlags::default(),
			helper: String::from(SUPERVISE),
		}
	}
}

/// Create an fd-managed process, and return the fd.
///
/// `args` is the command to run; the first should be locatable by `execvp`, with the `PATH` and cwd in `options`.
///
/// The returned fd is both the read end of the helper's status fd and the write end of its control fd. See the
/// documentation of the supervise utility for its usage; [Process](crate::Process) wraps it.
///
/// Note that just because this returns doesn't mean the process started successfully. The returned fd may
/// immediately hang up, without ever reporting a pid.
pub fn dfork<S: AsRef<str>>(args: &[S], options: &Options) -> Result<OwnedFd, Error> {
	// validate arguments so we don't spuriously fork
	let mut launch = Launch::new(args, options)?;

	let (parent_side, child_side) = socket::socketpair(
		AddressFamily::Unix,
		SockType::SeqPacket,
		None::<SockProtocol>,
		options.flags.into(),
	)?;
	let child_side = clear_of_targets(child_side, &options.fds)?;
	let commfd = CString::new(child_side.as_raw_fd().to_string())
		.map_err(|err| Error::InvalidArgument(err.to_string()))?;
	let _ = launch
		.argv
		.splice(1..1, vec![commfd.clone(), commfd]);
	debug!(
		"dfork: {:?} via {:?}, channel fd {}",
		launch.argv,
		launch.helper,
		child_side.as_raw_fd()
	);

	let args_p = Vec::with_capacity(launch.argv.len() + 1);
	let env_p = Vec::with_capacity(launch.envp.len() + 1);

	match unsafe { unistd::fork() } {
		// dropping both ends here releases the channel
		Err(err) => Err(Error::Fork(err)),
		Ok(ForkResult::Child) => {
			forbid_alloc(|| {
				// Memory can be in a weird state now. Imagine a thread has just taken out a lock,
				// but we've just forked. Lock still held. Avoid deadlock by doing nothing fancy here.
				// Including malloc.
				drop(parent_side);
				let failed = launch.exec(child_side.as_raw_fd(), args_p, env_p);
				write_stderr(&[b"supervise-api: ", failed.as_bytes(), b"\n"]);
			});
			unsafe { libc::_exit(127) }
		}
		Ok(ForkResult::Parent { child }) => {
			// we don't care about the pid we just forked off; the helper reports the one that matters
			trace!("dfork: forked {}", child);
			drop(child_side);
			Ok(parent_side)
		}
	}
}

/// Everything the child needs, computed in the parent so the child doesn't allocate.
#[derive(Debug)]
struct Launch {
	helper: CString,
	argv: Vec<CString>,
	envp: Vec<CString>,
	cwd: Option<CString>,
	remap: Remap,
}
impl Launch {
	fn new<S: AsRef<str>>(args: &[S], options: &Options) -> Result<Self, Error> {
		if args.is_empty() {
			return Err(Error::InvalidArgument(String::from("args must not be empty")));
		}
		let args = args
			.iter()
			.map(|arg| cstring(arg.as_ref(), "arg"))
			.collect::<Result<Vec<_>, _>>()?;
		let cwd = options
			.cwd
			.as_ref()
			.map(|cwd| cstring(cwd, "cwd"))
			.transpose()?;

		let mut vars = env::vars_os().collect::<BTreeMap<OsString, OsString>>();
		for (key, value) in &options.env {
			if key.is_empty() || key.contains('=') {
				return Err(Error::InvalidArgument(format!(
					"env key is not a valid variable name: {:?}",
					key
				)));
			}
			let _ = cstring(key, "env key")?;
			let _ = cstring(value, "env value")?;
			let _ = vars.insert(key.into(), value.into());
		}
		let envp = vars
			.iter()
			.map(|(key, value)| {
				let mut var = key.as_bytes().to_owned();
				var.push(b'=');
				var.extend_from_slice(value.as_bytes());
				CString::new(var).map_err(|_| {
					Error::InvalidArgument(format!("env var contains a nul byte: {:?}", key))
				})
			})
			.collect::<Result<Vec<_>, _>>()?;

		let helper = Self::find_helper(options, vars.get(OsStr::new("PATH")))?;
		let argv = Some(cstring(&options.helper, "helper"))
			.into_iter()
			.chain(args.into_iter().map(Ok))
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Self {
			helper,
			argv,
			envp,
			cwd,
			remap: Remap::new(&options.fds),
		})
	}

	/// Resolve the helper on the effective `PATH`: the updated environment's, else our own. A helper containing a
	/// `/` is resolved against the cwd instead.
	fn find_helper(options: &Options, path: Option<&OsString>) -> Result<CString, Error> {
		let not_found = || Error::HelperNotFound(options.helper.clone());
		// a helper given as a path doesn't need PATH
		if path.is_none() && !options.helper.contains('/') {
			return Err(not_found());
		}
		let mut cwd = env::current_dir()?;
		if let Some(dir) = &options.cwd {
			cwd.push(dir);
		}
		let helper = which::which_in(&options.helper, path, cwd).map_err(|_| not_found())?;
		CString::new(helper.into_os_string().as_bytes()).map_err(|_| not_found())
	}

	/// Runs in the child. Only returns on failure, saying what failed.
	fn exec(
		&mut self, channel: RawFd, args_p: Vec<*const libc::c_char>, env_p: Vec<*const libc::c_char>,
	) -> &'static str {
		// only the child's copy of the channel may outlive exec
		if fcntl::fcntl(channel, FcntlArg::F_SETFD(FdFlag::empty())).is_err() {
			return "failed to pass the channel";
		}
		// the helper waits on its children, so a SIG_IGN from ignore_sigchld() mustn't reach it
		if unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigDfl) }.is_err() {
			return "failed to reset SIGCHLD";
		}
		if let Some(cwd) = &self.cwd {
			if unistd::chdir(cwd.as_c_str()).is_err() {
				return "failed to change directory";
			}
		}
		if self.remap.apply().is_err() {
			return "failed to update fds";
		}
		let _ = execve(&self.helper, &self.argv, args_p, &self.envp, env_p);
		"failed to execve supervise"
	}
}

fn cstring(s: &str, what: &str) -> Result<CString, Error> {
	CString::new(s)
		.map_err(|_| Error::InvalidArgument(format!("{} contains a nul byte: {:?}", what, s)))
}

/// The child's end of the channel must survive the fd updates, so move it above every target.
fn clear_of_targets(fd: OwnedFd, fds: &Fds) -> nix::Result<OwnedFd> {
	if !fds.is_target(fd.as_raw_fd()) {
		return Ok(fd);
	}
	let above = fds.max_target().map_or(0, |max| max + 1);
	let moved = fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(above))?;
	Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

#[inline]
fn execve(
	path: &CStr, args: &[CString], mut args_p: Vec<*const libc::c_char>, env: &[CString],
	mut env_p: Vec<*const libc::c_char>,
) -> nix::Error {
	fn to_exec_array(args: &[CString], args_p: &mut Vec<*const libc::c_char>) {
		for arg in args.iter().map(|s| s.as_ptr()) {
			args_p.push(arg);
		}
		args_p.push(ptr::null());
	}
	assert_eq!(args_p.len(), 0);
	assert_eq!(env_p.len(), 0);
	assert_le!(args.len() + 1, args_p.capacity());
	assert_le!(env.len() + 1, env_p.capacity());
	to_exec_array(args, &mut args_p);
	to_exec_array(env, &mut env_p);

	let _ = unsafe { libc::execve(path.as_ptr(), args_p.as_ptr(), env_p.as_ptr()) };

	Errno::last()
}

fn write_stderr(parts: &[&[u8]]) {
	for part in parts {
		let _ = unsafe { libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len()) };
	}
}
