//! UNIX-domain pipes, socketpairs, and the descriptor handoff that migrates
//! a conversation from a pipe onto a handed-over TCP socket.

mod common;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use axon::{EndpointEvents, EndpointId, Runtime};

fn pipe_path(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("axon-test-{}-{}", tag, std::process::id()));
    path
}

#[test]
fn bytes_flow_over_a_pipe() {
    common::init_logging();

    let path = pipe_path("stream");
    let mut rt = Runtime::builder().endpoints(3).build().unwrap();

    let server_got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&server_got);

    let server_events = EndpointEvents::new(move |rt, id, _length| {
        log.borrow_mut().extend_from_slice(rt.buf(id));
        rt.buf_clear(id);
        rt.write(id, b"ack").unwrap();
    });

    let listener = rt.new_pipe(&path, server_events).unwrap();
    rt.listen(listener).unwrap();

    let client_got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&client_got);

    let client_events = EndpointEvents::new(move |rt, id, _length| {
        log.borrow_mut().extend_from_slice(rt.buf(id));
        rt.buf_clear(id);
    })
    .on_connected(|rt, id| {
        rt.write(id, b"over the pipe").unwrap();
    });

    let client = rt.new_pipe(&path, client_events).unwrap();
    rt.connect_pipe(client).unwrap();

    let done = {
        let client_got = Rc::clone(&client_got);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            client_got.borrow().as_slice() == b"ack"
        })
    };
    assert!(done, "pipe round trip completed");
    assert_eq!(server_got.borrow().as_slice(), b"over the pipe");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn socketpair_delivers_connected_then_reads() {
    common::init_logging();

    let mut rt = Runtime::builder().endpoints(2).build().unwrap();

    let sequence: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let reads = Rc::clone(&sequence);
    let connects = Rc::clone(&sequence);

    let events = EndpointEvents::new(move |rt, id, _length| {
        reads
            .borrow_mut()
            .push(format!("read:{}", String::from_utf8_lossy(rt.buf(id))));
        rt.buf_clear(id);
    })
    .on_connected(move |_rt, _id| {
        connects.borrow_mut().push("connected".to_string());
    });

    let (_endpoint, mut peer) = rt.new_socketpair(events).unwrap();
    peer.write_all(b"pair").unwrap();

    let done = {
        let sequence = Rc::clone(&sequence);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            sequence.borrow().len() == 2
        })
    };
    assert!(done, "socketpair events arrived: {:?}", sequence.borrow());

    // The connected callback always lands first, even though the bytes were
    // queued before the first loop iteration.
    assert_eq!(
        sequence.borrow().as_slice(),
        ["connected".to_string(), "read:pair".to_string()]
    );
}

#[test]
fn fd_handoff_rebinds_the_endpoint_to_the_passed_socket() {
    common::init_logging();

    let path = pipe_path("handoff");
    let mut rt = Runtime::builder().endpoints(3).build().unwrap();

    let receiver: Rc<RefCell<Option<EndpointId>>> = Rc::new(RefCell::new(None));
    let reads: Rc<RefCell<Vec<(EndpointId, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&reads);
    let seen = Rc::clone(&receiver);

    let server_events = EndpointEvents::new(move |rt, id, _length| {
        log.borrow_mut().push((id, rt.buf(id).to_vec()));
        rt.buf_clear(id);
    })
    .on_connected(move |_rt, id| {
        *seen.borrow_mut() = Some(id);
    });

    let listener = rt.new_pipe(&path, server_events).unwrap();
    rt.listen(listener).unwrap();

    let sender_events = EndpointEvents::new(|_, _, _| {});
    let sender = rt.new_pipe(&path, sender_events).unwrap();
    rt.connect_pipe(sender).unwrap();

    let accepted = {
        let receiver = Rc::clone(&receiver);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            receiver.borrow().is_some()
        })
    };
    assert!(accepted, "pipe connection established");

    // A real TCP connection whose server end will be handed over the pipe.
    let tcp_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut far_end = std::net::TcpStream::connect(tcp_listener.local_addr().unwrap()).unwrap();
    let (handed_over, _) = tcp_listener.accept().unwrap();

    rt.write_pipe(sender, b"H", handed_over.as_raw_fd()).unwrap();

    let got_marker = {
        let reads = Rc::clone(&reads);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            !reads.borrow().is_empty()
        })
    };
    assert!(got_marker, "the marker byte arrived over the pipe");

    // Bytes written to the far end of the handed-over connection now arrive
    // as read events on the same endpoint.
    far_end.write_all(b"WORLD").unwrap();

    let rebound = {
        let reads = Rc::clone(&reads);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            reads.borrow().len() == 2
        })
    };
    assert!(rebound, "handed-over socket feeds the endpoint: {:?}", reads.borrow());

    let reads = reads.borrow();
    let receiver = receiver.borrow().unwrap();
    assert_eq!(reads[0], (receiver, b"H".to_vec()));
    assert_eq!(reads[1], (receiver, b"WORLD".to_vec()));

    // The conversation works the other way too: endpoint writes reach the
    // far end of the handed-over connection.
    rt.write(receiver, b"back at you").unwrap();
    common::run_ticks(&mut rt, 5);

    far_end
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reply = vec![0u8; 11];
    far_end.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"back at you");

    let _ = std::fs::remove_file(&path);
}
