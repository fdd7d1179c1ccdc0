use std::io::Cursor;

use bytes::Bytes;
use rstest::rstest;

use paxos::{
    AcceptReply, AcceptRequest, ClientReply, ClientRequest, Entry, NodeId, PrepareReply,
    PrepareRequest, ProposalId, Rpc, SuccessReply, SuccessRequest, VoteReply, VoteRequest,
};

use super::codec::{read_bytes, read_value, write_bytes, write_value, MAX_SLAB};
use super::{read_request, write_request, ProtocolError, WireReply};

fn proposal(round: u32, node: u32) -> ProposalId {
    ProposalId {
        round,
        node: NodeId(node),
    }
}

fn round_trip_request(rpc: Rpc) {
    let mut frame = Vec::new();
    write_request(&mut frame, &rpc).expect("write");
    let decoded = read_request(&mut Cursor::new(frame)).expect("read");
    assert_eq!(decoded, rpc);
}

#[rstest]
#[case(0u32)]
#[case(1)]
#[case(u32::MAX)]
fn fixed_width_values_round_trip(#[case] value: u32) {
    let mut frame = Vec::new();
    write_value(&mut frame, &value).expect("write");
    assert_eq!(frame.len(), 4);
    let back: u32 = read_value(&mut Cursor::new(frame)).expect("read");
    assert_eq!(back, value);
}

#[test]
fn proposal_ids_round_trip() {
    let id = proposal(81, 3);
    let mut frame = Vec::new();
    write_value(&mut frame, &id).expect("write");
    assert_eq!(frame.len(), 8);
    let back: ProposalId = read_value(&mut Cursor::new(frame)).expect("read");
    assert_eq!(back, id);
}

#[rstest]
#[case(b"" as &[u8])]
#[case(b"x")]
#[case(b"a slab of arbitrary operation bytes")]
fn slabs_round_trip(#[case] slab: &[u8]) {
    let mut frame = Vec::new();
    write_bytes(&mut frame, slab).expect("write");
    let back = read_bytes(&mut Cursor::new(frame)).expect("read");
    assert_eq!(&back[..], slab);
}

#[test]
fn oversize_slabs_are_rejected_without_allocating() {
    let mut frame = Vec::new();
    write_value(&mut frame, &(MAX_SLAB + 1)).expect("write");
    match read_bytes(&mut Cursor::new(frame)) {
        Err(ProtocolError::Oversize(len)) => assert_eq!(len, MAX_SLAB + 1),
        other => panic!("expected an oversize error, got {:?}", other.map(|b| b.len())),
    }
}

#[test]
fn every_request_round_trips() {
    round_trip_request(Rpc::Vote(VoteRequest {
        term: proposal(2, 1),
    }));
    round_trip_request(Rpc::Prepare(PrepareRequest {
        term: proposal(2, 1),
        slot: 17,
    }));
    round_trip_request(Rpc::Accept(AcceptRequest {
        term: proposal(2, 1),
        slot: 17,
        value: Bytes::from_static(b"value"),
    }));
    round_trip_request(Rpc::Success(SuccessRequest {
        term: proposal(2, 1),
        slot: 17,
        value: Bytes::new(),
    }));
    round_trip_request(Rpc::Request(ClientRequest {
        entry: Entry {
            origin: NodeId(2),
            seq: 7,
            op: Bytes::from_static(b"push 9"),
        },
    }));
}

#[test]
fn replies_round_trip() {
    let mut frame = Vec::new();
    VoteReply {
        term: proposal(4, 0),
    }
    .write(&mut frame)
    .expect("write");
    assert_eq!(
        VoteReply::read(&mut Cursor::new(frame)).expect("read").term,
        proposal(4, 0)
    );

    let reply = PrepareReply {
        term: proposal(4, 0),
        accepted: Some((proposal(3, 2), Bytes::from_static(b"prior"))),
        next_unaccepted: Some(9),
    };
    let mut frame = Vec::new();
    reply.write(&mut frame).expect("write");
    assert_eq!(PrepareReply::read(&mut Cursor::new(frame)).expect("read"), reply);

    let reply = PrepareReply {
        term: proposal(4, 0),
        accepted: None,
        next_unaccepted: None,
    };
    let mut frame = Vec::new();
    reply.write(&mut frame).expect("write");
    assert_eq!(PrepareReply::read(&mut Cursor::new(frame)).expect("read"), reply);

    let mut frame = Vec::new();
    AcceptReply {
        term: proposal(4, 0),
    }
    .write(&mut frame)
    .expect("write");
    assert_eq!(
        AcceptReply::read(&mut Cursor::new(frame)).expect("read").term,
        proposal(4, 0)
    );

    let mut frame = Vec::new();
    SuccessReply.write(&mut frame).expect("write");
    assert!(SuccessReply::read(&mut Cursor::new(frame)).is_ok());

    let reply = ClientReply {
        leading: true,
        result: Some(Bytes::from_static(b"7")),
    };
    let mut frame = Vec::new();
    reply.write(&mut frame).expect("write");
    assert_eq!(ClientReply::read(&mut Cursor::new(frame)).expect("read"), reply);
}

#[test]
fn unknown_discriminators_are_a_protocol_error() {
    let frame = vec![9u8, 0, 0, 0];
    match read_request(&mut Cursor::new(frame)) {
        Err(ProtocolError::UnknownTag(9)) => {}
        other => panic!("expected an unknown tag error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn truncated_frames_are_a_transport_error() {
    let mut frame = Vec::new();
    write_request(
        &mut frame,
        &Rpc::Accept(AcceptRequest {
            term: proposal(1, 0),
            slot: 3,
            value: Bytes::from_static(b"value"),
        }),
    )
    .expect("write");
    frame.truncate(frame.len() - 2);
    match read_request(&mut Cursor::new(frame)) {
        Err(ProtocolError::Io(_)) => {}
        other => panic!("expected an io error, got {:?}", other.map(|_| ())),
    }
}
