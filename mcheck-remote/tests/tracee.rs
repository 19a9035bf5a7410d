//! Signals delivered to a traced process while the controller waits for it.

use std::{
    os::unix::process::CommandExt,
    process::{Child, Command},
    time::Duration,
};

use mcheck_remote::{Channel, Controller, Message, ProtocolError, ResumeOutcome};
use nix::{
    sys::{
        ptrace,
        signal::{self, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

/// Start `program` traced by this process and let it run past its initial exec stop.
fn spawn_traced(program: &str, args: &[&str]) -> (Child, Pid) {
    let mut command = Command::new(program);
    command.args(args);
    // Safety: `traceme` is a single system call.
    unsafe {
        command.pre_exec(|| ptrace::traceme().map_err(std::io::Error::from));
    }
    let child = command.spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    match waitpid(pid, Some(WaitPidFlag::__WALL)).unwrap() {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        status => panic!("unexpected status after exec: {status:?}"),
    }
    ptrace::setoptions(pid, ptrace::Options::PTRACE_O_EXITKILL).unwrap();
    ptrace::cont(pid, None).unwrap();
    (child, pid)
}

#[test]
fn fatal_signal_is_reported() {
    let (_child, pid) = spawn_traced("sleep", &["10"]);
    let (local, _remote) = Channel::pair().unwrap();
    let mut controller = Controller::traced(local, pid);

    signal::kill(pid, Signal::SIGUSR1).unwrap();
    match controller.resume() {
        Err(ProtocolError::ProcessCrashed(signal)) => assert_eq!(signal, Signal::SIGUSR1),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn ignored_signal_is_reinjected() {
    let (mut child, pid) = spawn_traced("sleep", &["10"]);
    let (local, remote) = Channel::pair().unwrap();
    let mut controller = Controller::traced(local, pid);

    let agent = std::thread::spawn(move || {
        assert!(matches!(remote.receive().unwrap(), Message::Continue));
        std::thread::sleep(Duration::from_millis(300));
        remote.send(&Message::Waiting).unwrap();
        remote
    });

    signal::kill(pid, Signal::SIGWINCH).unwrap();
    assert_eq!(controller.resume().unwrap(), ResumeOutcome::Waiting);
    let _remote = agent.join().unwrap();

    // The stop was consumed and the process kept running.
    let status = waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)).unwrap();
    assert_eq!(status, WaitStatus::StillAlive);

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn exit_closes_the_session() {
    let (_child, pid) = spawn_traced("true", &[]);
    let (local, _remote) = Channel::pair().unwrap();
    let mut controller = Controller::traced(local, pid);

    assert!(matches!(controller.resume(), Err(ProtocolError::Closed)));
}
