//! Worker lifecycle: spawn, join, cancellation in both flavors, failure
//! capture and the termination fd.
use std::os::fd::RawFd;
use std::slice;
use std::time::Duration;
use threadpipe::{
    spawn_fn, spawn_from_file, spawn_from_source, Channel, EngineInstance, Error, JoinResult,
    PushResult, ScriptEngine, ScriptError, Source, Status, Value, WorkerContext, ERRMSG_MAX,
};

/// One poll(2) round with a millisecond budget.
fn fd_ready(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    assert!(rc >= 0, "poll failed: {}", std::io::Error::last_os_error());
    rc == 1 && (pfd.revents & libc::POLLIN) != 0
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A stand-in interpreter understanding a handful of one-line programs.
struct TinyEngine;

/// One isolated "interpreter state" of [`TinyEngine`].
struct TinyInstance {
    program: Option<String>,
}

impl ScriptEngine for TinyEngine {
    fn instantiate(&self) -> Result<Box<dyn EngineInstance>, ScriptError> {
        Ok(Box::new(TinyInstance { program: None }))
    }
}

impl EngineInstance for TinyInstance {
    fn load(&mut self, source: &Source) -> Result<(), ScriptError> {
        match source.text() {
            "return" | "fail" | "fail big" | "spin" => {
                self.program = Some(source.text().to_owned());
                Ok(())
            }
            other => Err(ScriptError::Failed(format!(
                "{}:1: syntax error near '{}'",
                source.name(),
                other.chars().take(8).collect::<String>()
            ))),
        }
    }

    fn run(&mut self, ctx: &mut WorkerContext) -> Result<(), ScriptError> {
        match self.program.as_deref() {
            Some("fail") => Err(ScriptError::Failed(
                "worker:1: attempt to perform arithmetic on a nil value (global 'bar')".to_owned(),
            )),
            Some("fail big") => Err(ScriptError::Failed("x".repeat(5000))),
            Some("spin") => loop {
                if ctx.hard_cancelled() {
                    return Err(ScriptError::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(10));
            },
            _ => Ok(()),
        }
    }
}

#[test]
fn rendezvous_with_worker() {
    init_logs();
    let channel = Channel::new(1).unwrap();
    let mut worker = spawn_fn(
        |ctx| {
            let ch = ctx.channel(0).unwrap();
            assert_eq!(ch.push("hello", None).unwrap(), PushResult::Pushed);
            Ok(())
        },
        slice::from_ref(&channel),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(channel.pop(None).unwrap().value(), Some(Value::from("hello")));
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    assert_eq!(worker.status().unwrap(), Status::Terminated);
}

#[test]
fn cancel_notify_lets_worker_exit_normally() {
    init_logs();
    let mut worker = spawn_fn(
        |ctx| {
            while !ctx.worker().is_cancelled() {
                std::thread::sleep(Duration::from_millis(100));
            }
            Ok(())
        },
        &[],
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    worker.cancel(true).unwrap();
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    assert_eq!(worker.status().unwrap(), Status::Terminated);
    // Re-issuing the cancel on a finished worker is still fine.
    worker.cancel(true).unwrap();
}

#[test]
fn hard_cancel_interrupts_the_engine() {
    let mut worker = spawn_from_source(&TinyEngine, "spin", &[]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    worker.cancel(false).unwrap();
    assert_eq!(
        worker.join(Some(Duration::from_secs(5))).unwrap(),
        JoinResult::Joined
    );
    assert_eq!(worker.status().unwrap(), Status::Cancelled);
}

#[test]
fn script_failure_is_captured() {
    let mut worker = spawn_from_source(&TinyEngine, "fail", &[]).unwrap();
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    match worker.status().unwrap() {
        Status::Failed(msg) => assert!(msg.contains("attempt to"), "unexpected message: {msg}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn failure_message_is_bounded() {
    let mut worker = spawn_from_source(&TinyEngine, "fail big", &[]).unwrap();
    worker.join(None).unwrap();
    match worker.status().unwrap() {
        Status::Failed(msg) => assert!(msg.len() < ERRMSG_MAX),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn bad_source_fails_before_any_thread_exists() {
    match spawn_from_source(&TinyEngine, "gibberish", &[]) {
        Err(Error::InvalidSource(msg)) => assert!(msg.contains("syntax error")),
        other => panic!("expected a source error, got {other:?}"),
    }
}

#[test]
fn spawn_from_file_runs_the_program() {
    let path = std::env::temp_dir().join(format!("threadpipe-test-{}.tiny", std::process::id()));
    std::fs::write(&path, "return").unwrap();
    let mut worker = spawn_from_file(&TinyEngine, &path, &[]).unwrap();
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    assert_eq!(worker.status().unwrap(), Status::Terminated);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn join_is_idempotent_and_retires_the_fd() {
    let mut worker = spawn_fn(|_ctx| Ok(()), &[]).unwrap();
    assert!(worker.fd() >= 0);
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    assert_eq!(worker.fd(), -1);
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    // Cancelling a terminated worker is a no-op that reports success.
    worker.cancel(false).unwrap();
    assert_eq!(worker.status().unwrap(), Status::Terminated);
}

#[test]
fn join_can_time_out() {
    let mut worker = spawn_fn(
        |_ctx| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        },
        &[],
    )
    .unwrap();
    assert_eq!(
        worker.join(Some(Duration::from_millis(10))).unwrap(),
        JoinResult::TimedOut
    );
    assert_eq!(worker.status().unwrap(), Status::Running);
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
}

#[test]
fn termination_fd_becomes_readable_exactly_once() {
    let mut worker = spawn_fn(
        |_ctx| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        },
        &[],
    )
    .unwrap();
    let fd = worker.fd();
    assert!(!fd_ready(fd, 0));
    assert!(fd_ready(fd, 5000));
    assert_eq!(
        worker.join(Some(Duration::ZERO)).unwrap(),
        JoinResult::Joined
    );
}

#[test]
fn dropping_a_running_worker_reaps_it() {
    let worker = spawn_from_source(&TinyEngine, "spin", &[]).unwrap();
    // The drop must cancel and join; the test hangs if it does not.
    drop(worker);
}

#[test]
fn worker_holds_its_own_queue_reference() {
    let channel = Channel::new(1).unwrap();
    let mut worker = spawn_fn(
        |ctx| {
            ctx.channel(0)
                .unwrap()
                .pop(Some(Duration::from_secs(5)))
                .unwrap();
            Ok(())
        },
        slice::from_ref(&channel),
    )
    .unwrap();
    assert_eq!(channel.nref().unwrap(), 2);
    assert_eq!(channel.push("go", None).unwrap(), PushResult::Pushed);
    worker.join(None).unwrap();
    assert_eq!(channel.nref().unwrap(), 1);
}

#[test]
fn worker_can_select_on_its_own_cancellation() {
    let mut worker = spawn_fn(
        |ctx| {
            assert!(fd_ready(ctx.worker().fd_cancel(), 5000));
            assert!(ctx.worker().is_cancelled());
            Ok(())
        },
        &[],
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    worker.cancel(true).unwrap();
    assert_eq!(worker.join(None).unwrap(), JoinResult::Joined);
    assert_eq!(worker.status().unwrap(), Status::Terminated);
}
