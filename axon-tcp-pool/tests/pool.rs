//! Pool behavior over real sockets: the ramp against a dead target, the
//! request/response cycle, write queueing, supervision timeouts, and spawn
//! mode against a real child process.

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::time::{Duration, Instant};

use axon::{EndpointEvents, Runtime};
use axon_tcp_pool::{NodeState, PoolEvents, PoolTimeouts, TcpPool};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_until(rt: &mut Runtime, deadline: Duration, mut done: impl FnMut(&mut Runtime) -> bool) -> bool {
    let start = Instant::now();

    loop {
        if done(rt) {
            return true;
        }

        if start.elapsed() >= deadline {
            return false;
        }

        rt.run_once(Some(Duration::from_millis(20))).expect("runtime iteration");
    }
}

fn run_ticks(rt: &mut Runtime, ticks: usize) {
    for _ in 0..ticks {
        rt.run_once(Some(Duration::from_millis(10))).expect("runtime iteration");
    }
}

/// A port that refuses connections: bind, record, drop.
fn refused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// An in-runtime echo server; returns its port.
fn echo_server(rt: &mut Runtime) -> u16 {
    let events = EndpointEvents::new(|rt, id, _length| {
        let data = rt.buf(id).to_vec();
        rt.buf_clear(id);
        let _ = rt.write(id, &data);
    });

    let listener = rt
        .new_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), events)
        .unwrap();
    rt.listen(listener).unwrap();
    rt.local_port(listener).unwrap()
}

/// A server that accepts and reads but never answers; returns its port.
fn black_hole_server(rt: &mut Runtime) -> u16 {
    let events = EndpointEvents::new(|rt, id, _length| {
        rt.buf_clear(id);
    });

    let listener = rt
        .new_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), events)
        .unwrap();
    rt.listen(listener).unwrap();
    rt.local_port(listener).unwrap()
}

#[test]
fn nodes_against_a_refusing_target_are_retired() {
    init_logging();

    let mut rt = Runtime::builder().endpoints(8).build().unwrap();
    let port = refused_port();

    let closes = Rc::new(RefCell::new(0u32));
    let writes = Rc::new(RefCell::new(0u32));

    let close_count = Rc::clone(&closes);
    let write_count = Rc::clone(&writes);

    let events = PoolEvents::new(
        move |_rt, _pool| {
            *write_count.borrow_mut() += 1;
        },
        |_rt, _pool, _id, _length| {},
    )
    .on_close(move |_rt, _pool, _id| {
        *close_count.borrow_mut() += 1;
    });

    let pool = TcpPool::connect(
        &mut rt,
        "refused",
        2,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        events,
        PoolTimeouts::default(),
    )
    .unwrap();

    pool.queue_ready_to_write(&mut rt);

    // Two nodes, two attempts each before retirement.
    let settled = {
        let closes = Rc::clone(&closes);
        let pool = pool.clone();
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            *closes.borrow() == 4 && pool.count(NodeState::Unconnected) == 2
        })
    };
    assert!(settled, "both nodes failed twice: {} closes", *closes.borrow());

    // Retired nodes never reconnect, and the queued writer never fires.
    pool.ramp(&mut rt);
    pool.ramp(&mut rt);
    run_ticks(&mut rt, 10);

    assert_eq!(pool.count(NodeState::Unconnected), 2);
    assert_eq!(pool.count(NodeState::Connecting), 0);
    assert_eq!(*closes.borrow(), 4, "no further attempts after retirement");
    assert_eq!(*writes.borrow(), 0, "ready-to-write never fired");
}

#[test]
fn request_response_cycles_through_ready_and_in_use() {
    init_logging();

    let mut rt = Runtime::builder().endpoints(8).build().unwrap();
    let port = echo_server(&mut rt);

    let replies: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let ready_events = Rc::new(RefCell::new(0u32));

    let reply_log = Rc::clone(&replies);
    let ready_count = Rc::clone(&ready_events);

    let events = PoolEvents::new(
        move |rt, pool| {
            *ready_count.borrow_mut() += 1;
            pool.write(rt, b"ping", Some(Box::new(7u32))).unwrap();
        },
        move |rt, pool, id, _length| {
            assert_eq!(pool.node_state(id), Some(NodeState::InUse));
            reply_log.borrow_mut().push(rt.buf(id).to_vec());

            // The user data attached by the first write rides along with
            // the node until the reply arrives.
            if reply_log.borrow().len() == 1 {
                let tag = pool
                    .take_node_user_data(id)
                    .and_then(|data| data.downcast::<u32>().ok())
                    .map(|tag| *tag);
                assert_eq!(tag, Some(7));
            }

            rt.buf_clear(id);
        },
    );

    let pool = TcpPool::connect(
        &mut rt,
        "echo",
        1,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        events,
        PoolTimeouts::default(),
    )
    .unwrap();

    // Queued before the connection exists; fires once a node is ready.
    pool.queue_ready_to_write(&mut rt);

    let replied = {
        let replies = Rc::clone(&replies);
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            !replies.borrow().is_empty()
        })
    };
    assert!(replied, "request made it out and back");
    assert_eq!(replies.borrow()[0], b"ping");
    assert_eq!(*ready_events.borrow(), 1);

    // Consuming the whole reply put the node back into ReadyToSend.
    let idle = {
        let pool = pool.clone();
        run_until(&mut rt, Duration::from_secs(5), move |_| {
            pool.count(NodeState::ReadyToSend) == 1
        })
    };
    assert!(idle, "node returned to the idle state");

    // A ready connection means the callback fires immediately.
    pool.queue_ready_to_write(&mut rt);
    assert_eq!(*ready_events.borrow(), 2);

    let second = {
        let replies = Rc::clone(&replies);
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            replies.borrow().len() == 2
        })
    };
    assert!(second, "second request completed");

    pool.shutdown(&mut rt);
    assert_eq!(pool.count(NodeState::Unconnected), 1);
}

#[test]
fn response_timeout_fires_and_recycles_the_node() {
    init_logging();

    let mut rt = Runtime::builder().endpoints(8).build().unwrap();
    let port = black_hole_server(&mut rt);

    let timeouts = Rc::new(RefCell::new(0u32));
    let closes = Rc::new(RefCell::new(0u32));

    let timeout_count = Rc::clone(&timeouts);
    let close_count = Rc::clone(&closes);
    let sent = Rc::new(RefCell::new(false));
    let sent_flag = Rc::clone(&sent);

    let events = PoolEvents::new(
        move |rt, pool| {
            if !*sent_flag.borrow() {
                *sent_flag.borrow_mut() = true;
                pool.write(rt, b"anyone there?", None).unwrap();
            }
        },
        |_rt, _pool, _id, _length| {
            panic!("the black hole never answers");
        },
    )
    .on_close(move |_rt, _pool, _id| {
        *close_count.borrow_mut() += 1;
    })
    .on_timeout(move |_rt, _pool| {
        *timeout_count.borrow_mut() += 1;
    });

    let pool = TcpPool::connect(
        &mut rt,
        "black-hole",
        1,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        events,
        PoolTimeouts {
            initialization: None,
            response: Some(Duration::from_millis(200)),
        },
    )
    .unwrap();

    pool.queue_ready_to_write(&mut rt);

    let fired = {
        let timeouts = Rc::clone(&timeouts);
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            *timeouts.borrow() >= 1
        })
    };
    assert!(fired, "response timeout fired");

    let recycled = {
        let closes = Rc::clone(&closes);
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            *closes.borrow() >= 1
        })
    };
    assert!(recycled, "timed-out node was force-closed");
}

#[test]
fn initialization_gates_the_ready_state() {
    init_logging();

    let mut rt = Runtime::builder().endpoints(8).build().unwrap();
    let port = echo_server(&mut rt);

    let ready_events = Rc::new(RefCell::new(0u32));
    let ready_count = Rc::clone(&ready_events);

    let events = PoolEvents::new(
        move |_rt, _pool| {
            *ready_count.borrow_mut() += 1;
        },
        |_rt, _pool, _id, _length| {},
    )
    .on_connected(|rt, pool, id| {
        assert_eq!(pool.node_state(id), Some(NodeState::Initializing));
        // Pretend protocol setup finished instantly.
        pool.initialized(rt, id);
    });

    let pool = TcpPool::connect(
        &mut rt,
        "init",
        1,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        events,
        PoolTimeouts {
            initialization: Some(Duration::from_secs(5)),
            response: None,
        },
    )
    .unwrap();

    pool.queue_ready_to_write(&mut rt);

    let ready = {
        let pool = pool.clone();
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            pool.count(NodeState::ReadyToSend) == 1
        })
    };
    assert!(ready, "initialized() promoted the node");
    assert_eq!(*ready_events.borrow(), 1, "queued writer fired on promotion");
}

#[test]
fn spawn_mode_talks_to_a_child_process() {
    init_logging();

    let mut rt = Runtime::builder().endpoints(8).build().unwrap();

    let replies: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let reply_log = Rc::clone(&replies);
    let sent = Rc::new(RefCell::new(false));
    let sent_flag = Rc::clone(&sent);

    let events = PoolEvents::new(
        move |rt, pool| {
            if !*sent_flag.borrow() {
                *sent_flag.borrow_mut() = true;
                pool.write(rt, b"meow\n", None).unwrap();
            }
        },
        move |rt, _pool, id, _length| {
            reply_log.borrow_mut().push(rt.buf(id).to_vec());
            rt.buf_clear(id);
        },
    );

    let pool = TcpPool::spawn(
        &mut rt,
        "cat",
        1,
        "/bin/cat",
        Vec::new(),
        events,
        PoolTimeouts::default(),
    )
    .unwrap();

    pool.queue_ready_to_write(&mut rt);

    let echoed = {
        let replies = Rc::clone(&replies);
        run_until(&mut rt, Duration::from_secs(10), move |_| {
            !replies.borrow().is_empty()
        })
    };
    assert!(echoed, "the child echoed the request");
    assert_eq!(replies.borrow()[0], b"meow\n");

    pool.shutdown(&mut rt);
}
