//! Invariants of the queue substrate: bounds, FIFO order, revocation and
//! the readiness fds.
use std::os::fd::RawFd;
use std::sync::Arc;
use threadpipe::{PushOutcome, Queue, Token};

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

fn item(bytes: &[u8]) -> Box<[u8]> {
    bytes.to_vec().into_boxed_slice()
}

fn push_ok(queue: &Queue, bytes: &[u8]) -> Token {
    match queue.push(item(bytes)).unwrap() {
        PushOutcome::Pushed(token) => token,
        PushOutcome::Full(_) => panic!("queue unexpectedly full"),
    }
}

#[test]
fn length_stays_within_bounds() {
    let queue = Queue::new(2).unwrap();
    assert_eq!(queue.len().unwrap(), 0);
    push_ok(&queue, b"a");
    push_ok(&queue, b"b");
    assert_eq!(queue.len().unwrap(), 2);
    match queue.push(item(b"c")).unwrap() {
        PushOutcome::Full(data) => assert_eq!(&*data, b"c"),
        PushOutcome::Pushed(_) => panic!("push beyond capacity succeeded"),
    }
    assert_eq!(queue.len().unwrap(), 2);
}

#[test]
fn zero_capacity_is_rendezvous() {
    let queue = Queue::new(0).unwrap();
    assert_eq!(queue.max_items(), 1);
    push_ok(&queue, b"only");
    assert!(matches!(
        queue.push(item(b"again")).unwrap(),
        PushOutcome::Full(_)
    ));
}

#[test]
fn fifo_order() {
    let queue = Queue::new(8).unwrap();
    for byte in [b"1", b"2", b"3"] {
        push_ok(&queue, byte);
    }
    assert_eq!(&*queue.pop().unwrap().unwrap(), b"1");
    assert_eq!(&*queue.pop().unwrap().unwrap(), b"2");
    assert_eq!(&*queue.pop().unwrap().unwrap(), b"3");
    assert!(queue.pop().unwrap().is_none());
}

#[test]
fn readable_fd_tracks_emptiness() {
    let queue = Queue::new(2).unwrap();
    assert!(!fd_ready(queue.fd_readable(), 0));
    push_ok(&queue, b"x");
    assert!(fd_ready(queue.fd_readable(), 100));
    // Level-triggered: still readable until the queue drains.
    assert!(fd_ready(queue.fd_readable(), 0));
    queue.pop().unwrap().unwrap();
    assert!(!fd_ready(queue.fd_readable(), 0));
}

#[test]
fn writable_fd_tracks_fullness() {
    let queue = Queue::new(1).unwrap();
    assert!(fd_ready(queue.fd_writable(), 0), "fresh queue must be writable");
    push_ok(&queue, b"x");
    assert!(!fd_ready(queue.fd_writable(), 0));
    queue.pop().unwrap().unwrap();
    assert!(fd_ready(queue.fd_writable(), 100));
}

#[test]
fn pop_match_revokes_only_its_item() {
    let queue = Queue::new(4).unwrap();
    push_ok(&queue, b"keep1");
    let token = push_ok(&queue, b"revoke");
    push_ok(&queue, b"keep2");
    assert!(queue.pop_match(token).unwrap());
    // Already gone: a second revocation finds nothing.
    assert!(!queue.pop_match(token).unwrap());
    // Order among the survivors is untouched.
    assert_eq!(&*queue.pop().unwrap().unwrap(), b"keep1");
    assert_eq!(&*queue.pop().unwrap().unwrap(), b"keep2");
}

#[test]
fn pop_match_restores_writability() {
    let queue = Queue::new(1).unwrap();
    let token = push_ok(&queue, b"x");
    assert!(!fd_ready(queue.fd_writable(), 0));
    assert!(queue.pop_match(token).unwrap());
    assert!(fd_ready(queue.fd_writable(), 100));
    assert!(!fd_ready(queue.fd_readable(), 0));
}

#[test]
fn byte_accounting() {
    let queue = Queue::new(4).unwrap();
    push_ok(&queue, b"1234");
    push_ok(&queue, b"56");
    assert_eq!(queue.size().unwrap(), 6);
    queue.pop().unwrap().unwrap();
    assert_eq!(queue.size().unwrap(), 2);
}

#[test]
fn reference_counting() {
    let queue = Queue::new(1).unwrap();
    assert_eq!(queue.nref(), 1);
    let second = Arc::clone(&queue);
    assert_eq!(queue.nref(), 2);
    drop(second);
    assert_eq!(queue.nref(), 1);
}

#[test]
fn concurrent_producers_and_consumers() {
    let queue = Queue::new(4).unwrap();
    let mut producers = Vec::new();
    for worker in 0u8..4 {
        let queue = Arc::clone(&queue);
        producers.push(std::thread::spawn(move || {
            for n in 0u8..50 {
                let mut data = item(&[worker, n]);
                loop {
                    match queue.push(data).unwrap() {
                        PushOutcome::Pushed(_) => break,
                        PushOutcome::Full(returned) => {
                            data = returned;
                            std::thread::yield_now();
                        }
                    }
                }
            }
        }));
    }
    let mut popped = 0usize;
    let mut last_seen = [None::<u8>; 4];
    while popped < 200 {
        let Some(data) = queue.pop().unwrap() else {
            std::thread::yield_now();
            continue;
        };
        // Per-producer order survives interleaving.
        let (worker, n) = (data[0] as usize, data[1]);
        if let Some(prev) = last_seen[worker] {
            assert!(n > prev, "producer {worker} reordered: {prev} then {n}");
        }
        last_seen[worker] = Some(n);
        popped += 1;
    }
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(queue.len().unwrap(), 0);
}
