use std::collections::VecDeque;

use rand::Rng;
use rdma_retransmitter::{
    InsertRequest, OpCode, Qpn, ReleaseRequest, RetransmitEvent, Retransmitter,
    RetransmitterConfig, RxRetransmitRequest, TimerRetransmitRequest,
};

/// ------------------------------------------------------------
/// Reference model: what each connection should be tracking
/// ------------------------------------------------------------
#[derive(Default, Clone)]
struct Connection {
    next_psn: u32,
    outstanding: VecDeque<InsertRequest>,
}

struct Model {
    conns: Vec<Connection>,
    capacity: usize,
}

impl Model {
    fn new(qps: usize, capacity: usize) -> Self {
        Self {
            conns: vec![Connection::default(); qps],
            capacity,
        }
    }

    fn tracked(&self) -> usize {
        self.conns.iter().map(|c| c.outstanding.len()).sum()
    }

    fn events_from(&self, qpn: Qpn, skip: usize) -> Vec<RetransmitEvent> {
        self.conns[qpn as usize]
            .outstanding
            .iter()
            .skip(skip)
            .map(|r| RetransmitEvent {
                op_code: r.op_code,
                qpn,
                local_addr: r.local_addr,
                remote_addr: r.remote_addr,
                length: r.length,
                psn: r.psn,
            })
            .collect()
    }
}

fn settle(rt: &mut Retransmitter) -> Vec<RetransmitEvent> {
    let mut events = Vec::new();
    loop {
        rt.run_until_idle(100_000);
        let drained = rt.drain_events();
        if drained.is_empty() {
            break;
        }
        events.extend(drained);
    }
    events
}

fn random_op(rng: &mut impl Rng) -> OpCode {
    OpCode::try_from(rng.random_range(0x00..=0x11u8)).unwrap()
}

/// Run `steps` random operations against an instance and the model,
/// comparing events, chains and invariants after every one.
fn fuzz_against_model(qps: usize, capacity: usize, steps: usize) {
    let mut rng = rand::rng();
    let mut rt = Retransmitter::new(RetransmitterConfig {
        capacity,
        max_qps: qps,
        ..RetransmitterConfig::default()
    })
    .unwrap();
    let tx = rt.requests();
    let mut model = Model::new(qps, capacity);

    for step in 0..steps {
        let qpn = rng.random_range(0..qps) as Qpn;
        let expected: Vec<RetransmitEvent>;

        match rng.random_range(0..10) {
            // Insert, only while a slot is free so nothing queues up.
            0..=3 if model.tracked() < model.capacity => {
                let conn = &mut model.conns[qpn as usize];
                // Gaps in the PSN sequence exercise partial releases.
                conn.next_psn += rng.random_range(1..=3);
                let req = InsertRequest::new(
                    qpn,
                    conn.next_psn,
                    random_op(&mut rng),
                    rng.random_range(0..1u64 << 48),
                    rng.random_range(0..1u64 << 48),
                    rng.random(),
                )
                .unwrap();
                conn.outstanding.push_back(req);
                tx.try_insert(req).unwrap();
                expected = vec![];
            }
            // Cumulative ACK anywhere from before the head to past the tail.
            4..=6 => {
                let conn = &mut model.conns[qpn as usize];
                let acked = rng.random_range(0..=conn.next_psn + 2);
                let head = conn.outstanding.front().map(|r| r.psn);
                if head.is_some_and(|h| h <= acked) {
                    conn.outstanding.retain(|r| r.psn > acked);
                }
                tx.try_release(ReleaseRequest::new(qpn, acked).unwrap()).unwrap();
                expected = vec![];
            }
            // NAK, either for a tracked PSN or a random one.
            7..=8 => {
                let conn = &model.conns[qpn as usize];
                let target = if !conn.outstanding.is_empty() && rng.random_bool(0.7) {
                    let idx = rng.random_range(0..conn.outstanding.len());
                    conn.outstanding[idx].psn
                } else {
                    rng.random_range(0..=conn.next_psn + 2)
                };
                expected = match conn.outstanding.iter().position(|r| r.psn == target) {
                    Some(idx) => model.events_from(qpn, idx),
                    None => vec![],
                };
                tx.try_rx_retransmit(RxRetransmitRequest::new(qpn, target).unwrap())
                    .unwrap();
            }
            _ => {
                expected = model.events_from(qpn, 0);
                tx.try_timer_retransmit(TimerRetransmitRequest::new(qpn)).unwrap();
            }
        }

        let events = settle(&mut rt);
        assert_eq!(events, expected, "step {step}: events differ for qpn {qpn}");
        assert!(rt.controller_idle());
        rt.check_invariants()
            .unwrap_or_else(|e| panic!("step {step}: {e}"));

        for (q, conn) in model.conns.iter().enumerate() {
            let got: Vec<u32> = rt.chain(q as Qpn).iter().map(|(_, n)| n.psn).collect();
            let want: Vec<u32> = conn.outstanding.iter().map(|r| r.psn).collect();
            assert_eq!(got, want, "step {step}: chain of qpn {q}");
        }
        assert_eq!(rt.in_use_slots(), model.tracked());
        assert_eq!(rt.in_use_slots() + rt.free_slots(), capacity);
    }
}

#[test]
fn fuzz_single_connection() {
    fuzz_against_model(1, 16, 2_000);
}

#[test]
fn fuzz_many_connections_small_pool() {
    fuzz_against_model(6, 12, 3_000);
}

#[test]
fn fuzz_default_pool() {
    fuzz_against_model(32, 2000, 1_000);
}

#[test]
fn fuzz_exhaust_and_refill() {
    let mut rng = rand::rng();
    let capacity = rng.random_range(2..=40);
    let mut rt = Retransmitter::new(RetransmitterConfig {
        capacity,
        max_qps: 2,
        io_depth: 128,
        ..RetransmitterConfig::default()
    })
    .unwrap();
    let tx = rt.requests();

    // Ask for more than fits; the surplus waits in the input FIFO.
    let wanted = capacity + rng.random_range(1..=20);
    for psn in 0..wanted as u32 {
        tx.try_insert(InsertRequest::new(0, psn, OpCode::RC_SEND_ONLY, 0, 0, 1).unwrap())
            .unwrap();
    }
    settle(&mut rt);
    assert_eq!(rt.in_use_slots(), capacity);
    assert_eq!(rt.free_slots(), 0);

    // Each ACK of the head lets exactly one waiting insert through.
    for acked in 0..(wanted - capacity) as u32 {
        tx.try_release(ReleaseRequest::new(0, acked).unwrap()).unwrap();
        settle(&mut rt);
        assert_eq!(rt.in_use_slots(), capacity);
        rt.check_invariants().unwrap();
    }
    assert_eq!(rt.stats().inserts, wanted as u64);

    tx.try_release(ReleaseRequest::new(0, wanted as u32 - 1).unwrap())
        .unwrap();
    settle(&mut rt);
    assert_eq!(rt.in_use_slots(), 0);
    assert_eq!(rt.free_slots(), capacity);
    assert!(!rt.pointer(0).unwrap().valid);
}
