//! Datagram endpoints: bind, exchange, and per-datagram peer addresses.

mod common;

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::time::Duration;

use axon::{EndpointEvents, Runtime};

#[test]
fn datagrams_flow_both_ways() {
    common::init_logging();

    let mut rt = Runtime::builder().endpoints(2).build().unwrap();

    let server_got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let client_got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));

    // The server answers every datagram with its upper-cased payload, sent
    // back to wherever it came from.
    let log = Rc::clone(&server_got);
    let server_events = EndpointEvents::new(move |rt, id, _length| {
        let data = rt.buf(id).to_vec();
        let peer = rt.peer_addr(id).expect("datagram has a source");
        log.borrow_mut().push(data.clone());
        rt.buf_clear(id);
        rt.write_to(id, &data.to_ascii_uppercase(), peer).unwrap();
    });

    let server = rt
        .new_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), server_events)
        .unwrap();
    rt.listen(server).unwrap();
    let server_addr = rt.local_addr(server).unwrap();

    let log = Rc::clone(&client_got);
    let client_events = EndpointEvents::new(move |rt, id, _length| {
        log.borrow_mut().push(rt.buf(id).to_vec());
        rt.buf_clear(id);
    });

    let client = rt
        .new_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), client_events)
        .unwrap();
    rt.listen(client).unwrap();

    rt.write_to(client, b"ping", server_addr).unwrap();

    let replied = {
        let client_got = Rc::clone(&client_got);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            !client_got.borrow().is_empty()
        })
    };
    assert!(replied, "round trip completed");

    assert_eq!(server_got.borrow().as_slice(), [b"ping".to_vec()]);
    assert_eq!(client_got.borrow().as_slice(), [b"PING".to_vec()]);
    assert_eq!(rt.peer_addr(server), Some(rt.local_addr(client).unwrap()));
}

#[test]
fn a_burst_of_datagrams_is_delivered_event_by_event() {
    common::init_logging();

    let mut rt = Runtime::builder().endpoints(2).build().unwrap();

    let lengths: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&lengths);
    let server_events = EndpointEvents::new(move |rt, id, length| {
        log.borrow_mut().push(length);
        rt.buf_clear(id);
    });

    let server = rt
        .new_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), server_events)
        .unwrap();
    rt.listen(server).unwrap();
    let server_addr = rt.local_addr(server).unwrap();

    let client = rt
        .new_udp(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            EndpointEvents::new(|_, _, _| {}),
        )
        .unwrap();
    rt.listen(client).unwrap();

    for size in [1usize, 10, 100] {
        rt.write_to(client, &vec![b'd'; size], server_addr).unwrap();
    }

    let all = {
        let lengths = Rc::clone(&lengths);
        common::run_until(&mut rt, Duration::from_secs(5), move |_| {
            lengths.borrow().len() == 3
        })
    };
    assert!(all, "three datagrams, three read events: {:?}", lengths.borrow());
    assert_eq!(lengths.borrow().as_slice(), [1, 10, 100]);
}
