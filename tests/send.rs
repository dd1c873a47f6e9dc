//! Write pipeline: completion ordering, back-pressure, close with sends
//! pending, notify-writable, and sendfile.

mod common;

use std::cell::RefCell;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::time::Duration;

use axon::{
    EndpointEvents, EndpointId, Runtime, SendBuffer, SendOutcome, SendStatus,
};

struct Pair {
    rt: Runtime,
    client: EndpointId,
    received: Rc<RefCell<usize>>,
}

/// A connected pair whose server counts and discards everything it reads.
fn draining_pair() -> Pair {
    let mut rt = Runtime::builder().endpoints(3).build().unwrap();
    let received: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));

    let count = Rc::clone(&received);
    let server_events = EndpointEvents::new(move |rt, id, length| {
        *count.borrow_mut() += length;
        rt.buf_clear(id);
    });

    let listener = rt
        .new_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), server_events)
        .unwrap();
    rt.listen(listener).unwrap();
    let port = rt.local_port(listener).unwrap();

    let connected = Rc::new(RefCell::new(false));
    let connected_flag = Rc::clone(&connected);

    let client_events = EndpointEvents::new(|_, _, _| {}).on_connected(move |_, _| {
        *connected_flag.borrow_mut() = true;
    });

    let client = rt
        .new_tcp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), client_events)
        .unwrap();
    rt.connect(client, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
        .unwrap();

    let ok = common::run_until(&mut rt, Duration::from_secs(5), |_| *connected.borrow());
    assert!(ok, "pair connected");

    Pair {
        rt,
        client,
        received,
    }
}

#[test]
fn per_buffer_callbacks_fire_in_queue_order() {
    common::init_logging();

    let mut pair = draining_pair();
    let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let buffers: Vec<SendBuffer> = (1u8..=3)
        .map(|n| {
            let order = Rc::clone(&order);
            SendBuffer::with_callback(vec![n; 64], move |_rt, _id, outcome| {
                assert_eq!(outcome, SendOutcome::Ok);
                order.borrow_mut().push(n);
            })
        })
        .collect();

    let done: Rc<RefCell<Option<SendOutcome>>> = Rc::new(RefCell::new(None));
    let done_flag = Rc::clone(&done);

    let status = pair
        .rt
        .send_buffers(pair.client, buffers, move |_rt, _id, outcome| {
            *done_flag.borrow_mut() = Some(outcome);
        })
        .unwrap();

    if status == SendStatus::Complete {
        // Synchronous completion: the return value is the notification.
        assert!(done.borrow().is_none());
    } else {
        let finished = common::run_until(&mut pair.rt, Duration::from_secs(5), |_| {
            done.borrow().is_some()
        });
        assert!(finished, "vector completion arrived");
        assert_eq!(*done.borrow(), Some(SendOutcome::Ok));
    }

    assert_eq!(order.borrow().as_slice(), [1, 2, 3]);

    let received = Rc::clone(&pair.received);
    let all = common::run_until(&mut pair.rt, Duration::from_secs(5), |_| {
        *received.borrow() == 3 * 64
    });
    assert!(all, "server saw every byte");
}

#[test]
fn close_with_pending_sends_still_releases_every_buffer() {
    common::init_logging();

    let mut pair = draining_pair();
    let outcomes: Rc<RefCell<Vec<SendOutcome>>> = Rc::new(RefCell::new(Vec::new()));

    // Keep queueing quarter-megabyte buffers until the socket pushes back,
    // so at least one buffer is pending when the close lands.
    let mut queued = 0;

    for _ in 0..64 {
        let outcomes = Rc::clone(&outcomes);
        let buffer = SendBuffer::with_callback(vec![b'z'; 256 * 1024], move |_rt, _id, outcome| {
            outcomes.borrow_mut().push(outcome);
        });

        queued += 1;

        match pair.rt.send_buffer(pair.client, buffer).unwrap() {
            SendStatus::Complete => continue,
            SendStatus::InProgress => break,
        }
    }

    let completed_before = outcomes.borrow().len();
    assert!(
        completed_before < queued,
        "back-pressure left at least one buffer pending"
    );

    pair.rt.close(pair.client).unwrap();

    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), queued, "every buffer released exactly once");

    for outcome in &outcomes[completed_before..] {
        assert_eq!(*outcome, SendOutcome::Failed(axon::Error::NoConnection));
    }
}

#[test]
fn notify_writable_fires_once() {
    common::init_logging();

    let mut pair = draining_pair();
    let notified = Rc::new(RefCell::new(0u32));

    let count = Rc::clone(&notified);
    pair.rt
        .notify_writable(pair.client, move |_rt, _id, outcome| {
            assert_eq!(outcome, SendOutcome::Ok);
            *count.borrow_mut() += 1;
        })
        .unwrap();

    let fired = common::run_until(&mut pair.rt, Duration::from_secs(5), |_| {
        *notified.borrow() == 1
    });
    assert!(fired, "writable notification arrived");

    common::run_ticks(&mut pair.rt, 5);
    assert_eq!(*notified.borrow(), 1, "notification is one-shot");
}

#[test]
fn sendfile_pushes_the_whole_range() {
    common::init_logging();

    let mut pair = draining_pair();

    let mut path = std::env::temp_dir();
    path.push(format!("axon-sendfile-{}", std::process::id()));

    let total = 200 * 1024;
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![b's'; total]).unwrap();
    }

    let outcome: Rc<RefCell<Option<SendOutcome>>> = Rc::new(RefCell::new(None));
    let outcome_flag = Rc::clone(&outcome);

    let file = std::fs::File::open(&path).unwrap();
    pair.rt
        .sendfile(pair.client, file, 0, total, move |_rt, _id, result| {
            *outcome_flag.borrow_mut() = Some(result);
        })
        .unwrap();

    let received = Rc::clone(&pair.received);
    let finished = common::run_until(&mut pair.rt, Duration::from_secs(10), |_| {
        outcome.borrow().is_some() && *received.borrow() == total
    });
    assert!(finished, "sendfile completed: {:?}", outcome.borrow());
    assert_eq!(*outcome.borrow(), Some(SendOutcome::Ok));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn sendfile_past_end_of_file_reports_eof() {
    common::init_logging();

    let mut pair = draining_pair();

    let mut path = std::env::temp_dir();
    path.push(format!("axon-sendfile-eof-{}", std::process::id()));

    let file_len = 4 * 1024;
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![b'e'; file_len]).unwrap();
    }

    let outcome: Rc<RefCell<Option<SendOutcome>>> = Rc::new(RefCell::new(None));
    let outcome_flag = Rc::clone(&outcome);

    let file = std::fs::File::open(&path).unwrap();

    // Ask for more than the file holds; the shortfall surfaces as EOF.
    pair.rt
        .sendfile(pair.client, file, 0, file_len * 2, move |_rt, _id, result| {
            *outcome_flag.borrow_mut() = Some(result);
        })
        .unwrap();

    let finished = common::run_until(&mut pair.rt, Duration::from_secs(10), |_| {
        outcome.borrow().is_some()
    });
    assert!(finished, "sendfile terminated");
    assert_eq!(*outcome.borrow(), Some(SendOutcome::EndOfFile));

    let received = Rc::clone(&pair.received);
    let got_it = common::run_until(&mut pair.rt, Duration::from_secs(5), |_| {
        *received.borrow() == file_len
    });
    assert!(got_it, "the real bytes all arrived");

    let _ = std::fs::remove_file(&path);
}
