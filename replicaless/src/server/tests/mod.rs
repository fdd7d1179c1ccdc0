use std::net::TcpStream;
use std::time::{Duration, Instant};
use std::{io, thread};

use rand_core::SeedableRng;
use serial_test::serial;

use paxos::{ClientReply, ClientRequest, Entry, NodeId, Rpc};

use crate::cluster::Configuration;
use crate::machine::Register;
use crate::protocol::{self, WireReply};
use crate::server::{Replica, ReplicaState};

struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{}", record.args());
    }

    fn flush(&self) {}
}

fn init_logging() {
    let _ignore = log::set_logger(&TestLogger);
    log::set_max_level(log::LevelFilter::Info);
}

fn config(ports: &[u16]) -> Configuration {
    Configuration::new(
        ports
            .iter()
            .map(|port| format!("127.0.0.1:{}", port).parse().unwrap())
            .collect(),
    )
}

fn replica(id: u32, config: &Configuration) -> Replica {
    init_logging();
    Replica::new(id, config.clone(), Box::new(Register::new())).expect("start replica")
}

fn await_leader(replicas: &[&Replica], within: Duration) -> Option<usize> {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        for (index, replica) in replicas.iter().enumerate() {
            if replica.leading() {
                return Some(index);
            }
        }
        thread::sleep(Duration::from_millis(20));
    }
    None
}

#[test]
#[serial]
fn a_single_node_group_applies_its_own_requests() {
    let config = config(&[4821]);
    let replica = replica(0, &config);

    let result = replica.request(Register::set(7)).expect("apply set");
    assert_eq!(Register::decode_result(&result), Some(7));

    let result = replica.request(Register::get()).expect("apply get");
    assert_eq!(Register::decode_result(&result), Some(7));

    assert_eq!(replica.teardown(), Some(ReplicaState::Stopped));
}

#[test]
#[serial]
fn two_nodes_agree_on_a_single_leader() {
    let config = config(&[4823, 4824]);
    let a = replica(0, &config);
    let b = replica(1, &config);

    let replicas = [&a, &b];
    let mut settled = None;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let leading: Vec<usize> = (0..replicas.len())
            .filter(|index| replicas[*index].leading())
            .collect();
        // exactly one leader, with the follower pointing at its id
        if let [leader] = leading[..] {
            let follower = replicas[1 - leader];
            if follower.term().node == NodeId(leader as u32) {
                settled = Some(leader);
                break;
            }
        }
        thread::sleep(Duration::from_millis(20));
    }
    settled.expect("one leader and one follower within 2s");
}

#[test]
#[serial]
fn requests_forward_from_followers_to_the_leader() {
    let config = config(&[4826, 4827, 4828]);
    let a = replica(0, &config);
    let b = replica(1, &config);
    let c = replica(2, &config);

    let replicas = [&a, &b, &c];
    let leader = await_leader(&replicas, Duration::from_secs(2)).expect("a leader in 2s");
    let follower = replicas[(leader + 1) % 3];

    let result = follower.request(Register::set(42)).expect("apply via leader");
    assert_eq!(Register::decode_result(&result), Some(42));

    let result = replicas[leader].request(Register::get()).expect("read back");
    assert_eq!(Register::decode_result(&result), Some(42));
}

#[test]
#[serial]
fn a_new_leader_takes_over_when_the_old_one_dies() {
    let config = config(&[4830, 4831, 4832]);
    let a = replica(0, &config);
    let b = replica(1, &config);
    let c = replica(2, &config);

    let replicas = [&a, &b, &c];
    let old = await_leader(&replicas, Duration::from_secs(2)).expect("a leader in 2s");
    let old_term = replicas[old].term();

    replicas[old].teardown();
    let survivors: Vec<&Replica> = replicas
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != old)
        .map(|(_, replica)| *replica)
        .collect();

    let new = await_leader(&survivors, Duration::from_secs(2)).expect("a successor in 2s");
    assert!(survivors[new].term() > old_term);

    // pending work completes against the new leader
    let result = survivors[1 - new]
        .request(Register::set(5))
        .expect("apply after failover");
    assert_eq!(Register::decode_result(&result), Some(5));
}

#[test]
#[serial]
fn identical_election_timers_still_converge() {
    let config = config(&[4834, 4835]);
    let a = Replica::with_random(
        0,
        config.clone(),
        Box::new(Register::new()),
        Box::new(rand_chacha::ChaChaRng::seed_from_u64(17)),
    )
    .expect("start replica");
    let b = Replica::with_random(
        1,
        config,
        Box::new(Register::new()),
        Box::new(rand_chacha::ChaChaRng::seed_from_u64(17)),
    )
    .expect("start replica");

    // both draw the same timeout sequence; ties break on node id and a
    // leader still emerges
    let leader = await_leader(&[&a, &b], Duration::from_secs(5)).expect("a leader despite ties");
    let result = [&a, &b][leader]
        .request(Register::set(3))
        .expect("the group still applies");
    assert_eq!(Register::decode_result(&result), Some(3));
}

fn forward_raw(addr: std::net::SocketAddr, entry: Entry) -> io::Result<ClientReply> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    protocol::write_request(&mut stream, &Rpc::Request(ClientRequest { entry }))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    ClientReply::read(&mut stream)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

#[test]
#[serial]
fn a_duplicated_request_applies_exactly_once() {
    let config = config(&[4837]);
    let replica = replica(0, &config);
    let addr = config.addr(NodeId(0)).unwrap();

    // make sure the node leads before speaking the wire protocol at it
    replica.request(Register::set(0)).expect("warm up");

    let entry = Entry {
        origin: NodeId(7),
        seq: 1,
        op: Register::add(9),
    };

    // the client retries after a lost reply, resending the same entry
    let first = forward_raw(addr, entry.clone()).expect("first attempt");
    let second = forward_raw(addr, entry).expect("retried attempt");

    assert!(first.leading && second.leading);
    assert_eq!(first.result, second.result);
    assert_eq!(
        first.result.and_then(|result| Register::decode_result(&result)),
        Some(9)
    );

    // the add landed once
    let result = replica.request(Register::get()).expect("read back");
    assert_eq!(Register::decode_result(&result), Some(9));
}

#[test]
#[serial]
fn teardown_is_idempotent_and_joins_everything() {
    let config = config(&[4839]);
    let replica = replica(0, &config);

    replica.request(Register::set(1)).expect("apply");
    assert_eq!(replica.teardown(), Some(ReplicaState::Stopped));
    assert_eq!(replica.teardown(), Some(ReplicaState::Stopped));

    // requests after teardown fail benignly
    assert!(replica.request(Register::get()).is_err());

    // the listen port is free again
    let again = Replica::new(
        0,
        Configuration::new(vec!["127.0.0.1:4839".parse().unwrap()]),
        Box::new(Register::new()),
    )
    .expect("rebind the freed port");
    drop(again);
}

#[test]
#[serial]
fn a_replica_refuses_an_out_of_range_id() {
    let config = config(&[4841, 4842]);
    match Replica::new(5, config, Box::new(Register::new())) {
        Err(crate::error::Error::NodeOutOfRange { node: 5, nodes: 2 }) => {}
        other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
    }
}
