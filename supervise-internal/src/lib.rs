#![warn(
	missing_copy_implementations,
	missing_debug_implementations,
	// missing_docs,
	trivial_numeric_casts,
	unused_extern_crates,
	unused_import_braces,
	unused_qualifications,
	unused_results,
	clippy::pedantic,
)] // from https://github.com/rust-unofficial/patterns/blob/master/anti_patterns/deny-warnings.md
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod msg;

use nix::sys::signal::Signal;

#[cfg(target_family = "unix")]
pub type Fd = std::os::unix::io::RawFd;

#[cfg(feature = "alloc_counter")]
#[global_allocator]
static A: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;

pub use msg::{Command, Event, ParseError};

/// The name of the supervising helper, looked up on `PATH`.
pub const SUPERVISE: &str = "supervise";

/// The returncode recorded for a process whose handle was closed before it reported an exit.
pub const RETURNCODE_KILLED: i32 = -(Signal::SIGKILL as i32);

/// Size of the buffer a single message is received into. Messages are far shorter.
pub const MESSAGE_MAX: usize = 4096;

//////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// Run `f`, asserting (with the `no_alloc` feature) that it does not touch the allocator.
///
/// Used for the code that runs between `fork()` and `execve()`, where another thread may have held the allocator's lock.
pub fn forbid_alloc<F, R>(f: F) -> R
where
	F: FnOnce() -> R,
{
	#[cfg(feature = "alloc_counter")]
	{
		alloc_counter::forbid_alloc(f)
	}
	#[cfg(not(feature = "alloc_counter"))]
	{
		f()
	}
}
