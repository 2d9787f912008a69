//! These drive real processes through `supervise-stub`, which is put on the `PATH` of each launch.

use nix::{
	errno::Errno, fcntl::OFlag, poll::{self, PollFd, PollFlags, PollTimeout}, sys::{
		signal, socket::{self, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType}
	}, unistd
};
use std::{
	env, fs::File, io::Read, iter, os::unix::io::AsRawFd, path::Path, thread, time::{Duration, Instant}
};

use supervise_api::{dfork, Error, Event, Options, Pid, Process, RETURNCODE_KILLED};

fn options() -> Options {
	let stub = Path::new(env!("CARGO_BIN_EXE_supervise-stub"));
	let path = env::join_paths(
		iter::once(stub.parent().unwrap().to_owned())
			.chain(env::split_paths(&env::var_os("PATH").unwrap_or_default())),
	)
	.unwrap();
	let mut options = Options {
		helper: String::from("supervise-stub"),
		..Options::default()
	};
	let _ = options
		.env
		.insert(String::from("PATH"), path.into_string().unwrap());
	options
}

fn wait_readable(process: &Process) {
	if let Some(fd) = process.as_fd() {
		let _ = poll::poll(&mut [PollFd::new(fd, PollFlags::POLLIN)], PollTimeout::NONE).unwrap();
	}
}

/// Every event up to the channel closing.
fn drain(process: &mut Process) -> Vec<Event> {
	let mut events = Vec::new();
	loop {
		for event in process.events() {
			events.push(event.unwrap());
		}
		if process.closed() {
			break events;
		}
		wait_readable(process);
	}
}

#[test]
fn true_event_sequence() {
	let mut process = Process::from_fd(dfork(&["/bin/true"], &options()).unwrap()).unwrap();
	assert_eq!(process.pid(), None);
	let events = drain(&mut process);
	match events[0] {
		Event::Pid(pid) => assert_eq!(process.pid().map(|pid| pid.as_raw()), Some(pid)),
		ref event => panic!("expected a pid first, got {:?}", event),
	}
	assert_eq!(
		events[1..],
		[Event::Exited(0), Event::NoChildren, Event::Terminating]
	);
	assert_eq!(process.returncode(), Some(0));
	assert!(process.childfree());
	assert!(!process.hangup());
	assert_eq!(process.fileno(), -1);
}

#[test]
fn construction_waits_for_pid() {
	let mut process = Process::new(&["/bin/true"], &options()).unwrap();
	assert!(process.pid().is_some());
	assert_eq!(process.wait().unwrap(), Some(0));
	let _ = drain(&mut process);
	assert!(process.childfree());
	assert!(!process.hangup());
}

#[test]
fn exit_code() {
	let mut process = Process::new(&["/bin/sh", "-c", "exit 3"], &options()).unwrap();
	assert_eq!(process.wait().unwrap(), Some(3));
}

#[test]
fn killed_by_signal() {
	let mut process = Process::new(&["/bin/sh", "-c", "kill -TERM $$"], &options()).unwrap();
	assert_eq!(process.wait().unwrap(), Some(-15));
	let mut process = Process::new(&["/bin/sh", "-c", "kill -USR1 $$"], &options()).unwrap();
	assert_eq!(process.wait().unwrap(), Some(-10));
}

#[test]
fn poll_then_close() {
	let mut process = Process::new(&["sleep", "10"], &options()).unwrap();
	assert_eq!(process.poll().unwrap(), None);
	assert!(!process.closed());

	process.close();
	assert_eq!(process.returncode(), Some(RETURNCODE_KILLED));
	assert!(process.closed());
	assert_eq!(process.fileno(), -1);
	assert!(process.as_fd().is_none());
	process.close();
	assert_eq!(process.poll().unwrap(), Some(RETURNCODE_KILLED));
	assert_eq!(process.wait().unwrap(), Some(RETURNCODE_KILLED));
}

#[test]
fn close_after_exit_keeps_returncode() {
	let mut process = Process::new(&["/bin/sh", "-c", "exit 7"], &options()).unwrap();
	assert_eq!(process.wait().unwrap(), Some(7));
	process.close();
	assert_eq!(process.returncode(), Some(7));
}

#[test]
fn terminate_and_kill() {
	let mut process = Process::new(&["sleep", "10"], &options()).unwrap();
	process.terminate().unwrap();
	assert_eq!(process.wait().unwrap(), Some(-15));

	let mut process = Process::new(&["sleep", "10"], &options()).unwrap();
	process.kill().unwrap();
	assert_eq!(process.wait().unwrap(), Some(-9));

	let mut process = Process::new(&["sleep", "10"], &options()).unwrap();
	process.send_signal(signal::Signal::SIGINT as i32).unwrap();
	assert_eq!(process.wait().unwrap(), Some(-2));
}

#[test]
fn signal_after_close() {
	let mut process = Process::new(&["sleep", "10"], &options()).unwrap();
	process.close();
	match process.terminate() {
		Err(Error::Closed) => (),
		other => panic!("{:?}", other),
	}
}

#[test]
fn helper_hangup() {
	// the stub is the command's parent
	let mut process = Process::new(
		&["/bin/sh", "-c", "sleep 0.2; kill -KILL $PPID; sleep 1"],
		&options(),
	)
	.unwrap();
	assert_eq!(process.wait().unwrap(), None);
	assert!(process.hangup());
	assert!(process.closed());
	assert!(!process.childfree());
	assert_eq!(process.returncode(), None);
}

#[test]
fn helper_dies_before_pid() {
	// false exits without reporting anything
	let options = Options {
		helper: String::from("false"),
		..options()
	};
	match Process::new(&["/bin/true"], &options) {
		Err(Error::StartupFailed) => (),
		other => panic!("{:?}", other),
	}
}

#[test]
fn helper_not_found() {
	let options = Options {
		helper: String::from("supervise-api-missing-helper"),
		..options()
	};
	match Process::new(&["/bin/true"], &options) {
		Err(Error::HelperNotFound(_)) => (),
		other => panic!("{:?}", other),
	}
}

#[test]
fn env_and_cwd() {
	let mut options = Options {
		cwd: Some(String::from("/")),
		..options()
	};
	let _ = options.env.insert(
		String::from("SUPERVISE_API_TEST"),
		String::from("hello world"),
	);
	let mut process = Process::new(
		&[
			"/bin/sh",
			"-c",
			r#"test "$SUPERVISE_API_TEST" = "hello world" && test "$(pwd)" = /"#,
		],
		&options,
	)
	.unwrap();
	assert_eq!(process.wait().unwrap(), Some(0));
}

#[test]
fn fds_reach_the_command() {
	let (reader, writer) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
	let mut options = options();
	let _ = options.fds.insert(&1, &writer);
	let mut process = Process::new(&["/bin/sh", "-c", "echo hello"], &options).unwrap();
	drop(writer);
	assert_eq!(process.wait().unwrap(), Some(0));
	let _ = drain(&mut process);

	let mut output = String::new();
	let _ = File::from(reader).read_to_string(&mut output).unwrap();
	assert_eq!(output, "hello\n");
}

#[test]
fn drop_kills_the_tree() {
	let process = Process::new(&["sleep", "30"], &options()).unwrap();
	let pid = process.pid().unwrap();
	drop(process);

	let start = Instant::now();
	while signal::kill(pid, None) != Err(Errno::ESRCH) {
		assert!(start.elapsed() < Duration::from_secs(10), "{} outlived its Process", pid);
		thread::sleep(Duration::from_millis(10));
	}
}

#[test]
fn multiplexing() {
	let mut processes = (1..=3)
		.map(|code| {
			Process::new(
				&["/bin/sh", "-c", format!("sleep 0.{}; exit {}", code, code).as_str()],
				&options(),
			)
			.unwrap()
		})
		.collect::<Vec<_>>();
	while processes.iter().any(|process| process.returncode().is_none()) {
		let mut fds = processes
			.iter()
			.filter_map(Process::as_fd)
			.map(|fd| PollFd::new(fd, PollFlags::POLLIN))
			.collect::<Vec<_>>();
		let _ = poll::poll(&mut fds, PollTimeout::NONE).unwrap();
		drop(fds);
		for process in &mut processes {
			let _ = process.poll().unwrap();
		}
	}
	let codes = processes
		.iter()
		.map(Process::returncode)
		.collect::<Vec<_>>();
	assert_eq!(codes, [Some(1), Some(2), Some(3)]);
}

#[test]
fn event_handling_rules() {
	let (ours, helper) = socket::socketpair(
		AddressFamily::Unix,
		SockType::SeqPacket,
		None::<SockProtocol>,
		SockFlag::SOCK_CLOEXEC,
	)
	.unwrap();
	let mut process = Process::from_fd(ours).unwrap();
	for msg in &["pid 5", "pid 6", "exited 3", "killed 9", "bogus 1", "pid x", "no_children"] {
		let _ = socket::send(helper.as_raw_fd(), msg.as_bytes(), MsgFlags::empty()).unwrap();
	}

	let (mut events, mut malformed) = (Vec::new(), 0);
	for event in process.events() {
		match event {
			Ok(event) => events.push(event),
			Err(Error::Protocol(_)) => malformed += 1,
			Err(err) => panic!("{}", err),
		}
	}
	assert_eq!(
		events,
		[
			Event::Pid(5),
			Event::Pid(6),
			Event::Exited(3),
			Event::Killed(9),
			Event::Other(String::from("bogus"), Some(1)),
			Event::NoChildren
		]
	);
	assert_eq!(malformed, 1);
	// first pid and first exit win
	assert_eq!(process.pid(), Some(Pid::from_raw(5)));
	assert_eq!(process.returncode(), Some(3));
	assert!(process.childfree());
	assert!(!process.closed());

	drop(helper);
	assert_eq!(process.get_event().unwrap(), Some(Event::Hangup));
	assert!(process.hangup());
	assert!(process.closed());
	assert_eq!(process.returncode(), Some(3));
	assert_eq!(process.get_event().unwrap(), None);
}
