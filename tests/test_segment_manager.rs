use std::sync::Arc;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use ramlog::{
    ConfigBuilder, EntryType, MemReplicaManager, ReplicaEvent, RpcEpochs,
    RpcGuard, Segment, SegmentHeader, SegmentManager, SegletAllocator, State,
    INVALID_SEGMENT_ID,
};

struct Fixture {
    manager: SegmentManager,
    replicas: Arc<MemReplicaManager>,
    epochs: Arc<RpcEpochs>,
}

fn fixture(pool_segments: usize, factor: f64, survivors: usize) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = ConfigBuilder::new()
        .log_id(1)
        .seglet_size(256)
        .seglets_per_segment(2)
        .pool_segments(pool_segments)
        .disk_expansion_factor(factor)
        .build();
    let allocator = Arc::new(SegletAllocator::new(&config));
    let replicas = Arc::new(MemReplicaManager::new());
    let epochs = Arc::new(RpcEpochs::new());
    let manager = SegmentManager::new(
        &config,
        allocator,
        replicas.clone(),
        epochs.clone(),
    )
    .unwrap();

    if survivors > 0 {
        assert!(manager.increase_survivor_reserve(survivors));
    }

    Fixture { manager, replicas, epochs }
}

fn sorted(mut ids: Vec<u64>) -> Vec<u64> {
    ids.sort_unstable();
    ids
}

#[test]
fn first_head() {
    let f = fixture(4, 1.0, 0);

    let head = f.manager.alloc_head(false).unwrap().unwrap();
    assert_eq!(head.id(), 0);
    assert!(!head.is_emergency_head());
    assert_eq!(f.manager.segment_state(head.slot()).unwrap(), State::Head);
    assert_eq!(f.manager.free_segment_count(), 3);
    assert_eq!(f.manager.allocated_segment_count(), 1);

    // the first digest advertises only the head itself
    assert_eq!(head.last_digest().unwrap().segment_ids, vec![0]);

    // and the header is the first entry, stamped as a head
    let entries = head.entries();
    assert_eq!(entries[0].0, EntryType::SegHeader);
    let header = SegmentHeader::deserialize(&entries[0].1).unwrap();
    assert_eq!(header.log_id, 1);
    assert_eq!(header.segment_id, 0);
    assert_eq!(header.head_id_during_cleaning, INVALID_SEGMENT_ID);

    f.manager.assert_invariants();
}

#[test]
fn rotation_retires_the_previous_head() {
    let f = fixture(4, 1.0, 0);

    let head0 = f.manager.alloc_head(false).unwrap().unwrap();
    let head1 = f.manager.alloc_head(false).unwrap().unwrap();

    assert_eq!(head1.id(), 1);
    assert_eq!(f.manager.segment_state(head1.slot()).unwrap(), State::Head);
    assert_eq!(
        f.manager.segment_state(head0.slot()).unwrap(),
        State::NewlyCleanable
    );
    assert_eq!(
        sorted(head1.last_digest().unwrap().segment_ids),
        vec![0, 1]
    );

    f.manager.assert_invariants();
}

#[test]
fn replication_opens_the_new_head_before_closing_the_old() {
    let f = fixture(4, 1.0, 0);

    let head0 = f.manager.alloc_head(false).unwrap().unwrap();
    let head1 = f.manager.alloc_head(false).unwrap().unwrap();

    let events = f.replicas.events();
    let open_of_new = events
        .iter()
        .position(|e| matches!(e, ReplicaEvent::AllocateHead { id: 1, .. }))
        .unwrap();
    let close_of_old = events
        .iter()
        .position(|e| matches!(e, ReplicaEvent::Close { id: 0 }))
        .unwrap();
    assert!(open_of_new < close_of_old);

    // the new head chains from the old so backups order the swap
    assert!(events.iter().any(|e| matches!(
        e,
        ReplicaEvent::AllocateHead { id: 1, chained_from: Some(0), .. }
    )));

    // the old head's final length was synced before retirement
    assert_eq!(f.replicas.synced_len(0), head0.appended_len());
    assert!(f.replicas.is_open(head1.id()));
    assert!(!f.replicas.is_open(head0.id()));

    // exactly one replicated head remains open after each rotation
    assert_eq!(f.replicas.open_head_count(), 1);
}

#[test]
fn emergency_head_keeps_the_log_open() {
    let f = fixture(4, 1.0, 0);

    let _head0 = f.manager.alloc_head(false).unwrap().unwrap();
    let head1 = f.manager.alloc_head(false).unwrap().unwrap();

    let mut cleanable = vec![];
    f.manager.cleanable_segments(&mut cleanable);
    assert_eq!(cleanable.len(), 1);
    f.manager.cleaning_complete(&cleanable);

    // two segments allocated, two free, both reserved for emergencies:
    // an ordinary head is refused, but a cleaned segment is waiting on
    // a digest, so an emergency head steps in
    let head2 = f.manager.alloc_head(false).unwrap().unwrap();
    assert!(head2.is_emergency_head());
    assert!(head2.appends_disabled());
    assert!(!head2.append(EntryType::SegHeader, b"refused"));
    assert_eq!(
        sorted(head2.last_digest().unwrap().segment_ids),
        vec![1, 2]
    );

    // the next rotation reclaims the emergency head outright rather
    // than handing it to the cleaner
    let head3 = f.manager.alloc_head(false).unwrap().unwrap();
    assert!(!head3.is_emergency_head());
    assert!(!f.manager.does_id_exist(head2.id()));
    assert_eq!(
        sorted(head3.last_digest().unwrap().segment_ids),
        vec![1, 3]
    );
    assert_eq!(
        f.manager.segment_state(head1.slot()).unwrap(),
        State::NewlyCleanable
    );

    f.manager.assert_invariants();
}

#[test]
fn cleaning_cycle_stages_survivors_and_cleaned() {
    let f = fixture(10, 1.0, 2);

    let head0 = f.manager.alloc_head(false).unwrap().unwrap();
    let head1 = f.manager.alloc_head(false).unwrap().unwrap();
    let head2 = f.manager.alloc_head(false).unwrap().unwrap();

    let mut cleanable = vec![];
    f.manager.cleanable_segments(&mut cleanable);
    assert_eq!(
        sorted(cleanable.iter().map(|s| s.id()).collect()),
        vec![0, 1]
    );

    let survivor = f.manager.alloc_survivor(head2.id()).unwrap().unwrap();
    assert_eq!(
        f.manager.segment_state(survivor.slot()).unwrap(),
        State::CleaningInto
    );
    assert_eq!(f.manager.free_survivor_count(), 1);

    // survivor contents order before the head that was current when
    // cleaning began
    let entries = survivor.entries();
    let header = SegmentHeader::deserialize(&entries[0].1).unwrap();
    assert_eq!(header.head_id_during_cleaning, head2.id());

    let epoch = f.epochs.current_epoch();
    f.manager.cleaning_complete(&cleanable);

    assert_eq!(
        f.manager.segment_state(survivor.slot()).unwrap(),
        State::CleanablePendingDigest
    );
    for cleaned in [&head0, &head1] {
        assert_eq!(
            f.manager.segment_state(cleaned.slot()).unwrap(),
            State::FreeablePendingDigestAndReferences
        );
        assert_eq!(cleaned.cleaned_epoch(), epoch);
    }
    assert_eq!(f.epochs.current_epoch(), epoch + 1);

    f.manager.assert_invariants();
}

#[test]
fn digest_publishes_survivors_and_retires_cleaned() {
    let f = fixture(10, 1.0, 2);

    let head0 = f.manager.alloc_head(false).unwrap().unwrap();
    let head1 = f.manager.alloc_head(false).unwrap().unwrap();
    let head2 = f.manager.alloc_head(false).unwrap().unwrap();

    let mut cleanable = vec![];
    f.manager.cleanable_segments(&mut cleanable);

    let survivor = f.manager.alloc_survivor(head2.id()).unwrap().unwrap();

    // a request in flight from before the cleaning pass pins the
    // cleaned segments in memory
    let rpc = f.epochs.track();
    f.manager.cleaning_complete(&cleanable);

    let head3 = f.manager.alloc_head(false).unwrap().unwrap();
    let digest = head3.last_digest().unwrap();
    assert_eq!(
        sorted(digest.segment_ids.clone()),
        vec![head2.id(), survivor.id(), head3.id()]
    );
    assert!(!digest.contains(head0.id()));
    assert!(!digest.contains(head1.id()));

    for retired in [&head0, &head1] {
        assert_eq!(
            f.manager.segment_state(retired.slot()).unwrap(),
            State::FreeablePendingReferences
        );
    }
    assert_eq!(
        f.manager.segment_state(survivor.slot()).unwrap(),
        State::NewlyCleanable
    );

    // while the old request is outstanding, allocation must not
    // reclaim the cleaned segments
    f.manager.alloc_head(false).unwrap().unwrap();
    assert!(f.manager.does_id_exist(head0.id()));
    assert!(f.manager.does_id_exist(head1.id()));

    // once it drains, the next allocation does
    drop(rpc);
    f.manager.alloc_head(false).unwrap().unwrap();
    assert!(!f.manager.does_id_exist(head0.id()));
    assert!(!f.manager.does_id_exist(head1.id()));

    f.manager.assert_invariants();
}

#[test]
fn iterators_freeze_the_advertised_log() {
    let f = fixture(10, 1.0, 2);

    let head0 = f.manager.alloc_head(false).unwrap().unwrap();
    let head1 = f.manager.alloc_head(false).unwrap().unwrap();
    let head2 = f.manager.alloc_head(false).unwrap().unwrap();

    let mut cleanable = vec![];
    f.manager.cleanable_segments(&mut cleanable);

    f.manager.log_iterator_created();

    // cleaning itself is free to run during iteration
    let survivor = f.manager.alloc_survivor(head2.id()).unwrap().unwrap();
    f.manager.cleaning_complete(&cleanable);

    // but the digest must keep advertising the cleaned segments and
    // must not admit the pending survivor
    let head3 = f.manager.alloc_head(false).unwrap().unwrap();
    let digest = head3.last_digest().unwrap();
    assert!(digest.contains(head0.id()));
    assert!(digest.contains(head1.id()));
    assert!(!digest.contains(survivor.id()));
    assert_eq!(
        f.manager.segment_state(survivor.slot()).unwrap(),
        State::CleanablePendingDigest
    );
    assert_eq!(
        f.manager.segment_state(head0.slot()).unwrap(),
        State::FreeablePendingDigestAndReferences
    );

    // the sanctioned walk sees exactly the advertised membership plus
    // the head
    let mut active = vec![];
    f.manager.active_segments(0, &mut active).unwrap();
    let active_ids = sorted(active.iter().map(|s| s.id()).collect());
    assert_eq!(
        active_ids,
        vec![head0.id(), head1.id(), head2.id(), head3.id()]
    );

    // min_id filters segments already visited
    let mut later = vec![];
    f.manager.active_segments(head2.id(), &mut later).unwrap();
    assert_eq!(
        sorted(later.iter().map(|s| s.id()).collect()),
        vec![head2.id(), head3.id()]
    );

    f.manager.log_iterator_destroyed();

    // with the iterator gone, the next rotation retires the cleaned
    // segments and publishes the survivor
    let head4 = f.manager.alloc_head(false).unwrap().unwrap();
    let digest = head4.last_digest().unwrap();
    assert!(!digest.contains(head0.id()));
    assert!(!digest.contains(head1.id()));
    assert!(digest.contains(survivor.id()));
    assert_eq!(
        f.manager.segment_state(head0.slot()).unwrap(),
        State::FreeablePendingReferences
    );

    f.manager.assert_invariants();
}

#[test]
fn must_not_fail_forces_an_emergency_head() {
    let f = fixture(2, 1.0, 0);

    // the entire pool is reserved for emergencies, so an ordinary
    // head can never be allocated
    assert!(f.manager.alloc_head(false).unwrap().is_none());

    let head = f.manager.alloc_head(true).unwrap().unwrap();
    assert!(head.is_emergency_head());
    f.manager.assert_invariants();

    // rotation under continued pressure swaps one emergency head for
    // another, freeing the old one
    let next = f.manager.alloc_head(true).unwrap().unwrap();
    assert!(next.is_emergency_head());
    assert!(!f.manager.does_id_exist(head.id()));
    f.manager.assert_invariants();
}

#[derive(Debug, Clone)]
enum Op {
    AllocHead(bool),
    AllocSurvivor,
    CleaningComplete(usize),
    CleanableSegments,
    IterCreate,
    IterDestroy,
    BeginRpc,
    EndRpc,
    IncreaseReserve(usize),
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Op {
        match u8::arbitrary(g) % 12 {
            0 | 1 | 2 => Op::AllocHead(bool::arbitrary(g)),
            3 => Op::AllocSurvivor,
            4 => Op::CleaningComplete(usize::arbitrary(g) % 4),
            5 | 6 => Op::CleanableSegments,
            7 => Op::IterCreate,
            8 => Op::IterDestroy,
            9 => Op::BeginRpc,
            10 => Op::EndRpc,
            _ => Op::IncreaseReserve(usize::arbitrary(g) % 5),
        }
    }
}

#[derive(Debug, Clone)]
struct OpVec {
    ops: Vec<Op>,
}

impl Arbitrary for OpVec {
    fn arbitrary(g: &mut Gen) -> OpVec {
        let len = usize::arbitrary(g) % 40;
        OpVec { ops: (0..len).map(|_| Op::arbitrary(g)).collect() }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = OpVec>> {
        let mut smaller = vec![];
        for i in 0..self.ops.len() {
            let mut ops = self.ops.clone();
            ops.remove(i);
            smaller.push(OpVec { ops });
        }
        Box::new(smaller.into_iter())
    }
}

fn prop_invariants_hold(ops: OpVec) -> bool {
    let f = fixture(6, 2.0, 1);

    let mut cleanable: Vec<Arc<Segment>> = vec![];
    let mut survivors_outstanding = 0;
    let mut iterators = 0;
    let mut rpcs: Vec<RpcGuard> = vec![];
    let mut next_id = 0;
    let mut last_head_id = None;

    for op in ops.ops {
        match op {
            Op::AllocHead(must_not_fail) => {
                if let Some(head) =
                    f.manager.alloc_head(must_not_fail).unwrap()
                {
                    // identifiers are gap-free across every allocation
                    assert_eq!(head.id(), next_id);
                    next_id += 1;
                    if let Some(prev) = last_head_id {
                        assert!(head.id() > prev);
                    }
                    last_head_id = Some(head.id());
                }
            }
            Op::AllocSurvivor => {
                // only write survivors that a later cleaning pass can
                // pay for, as the cleaner's policy would
                if survivors_outstanding < cleanable.len() {
                    if let Some(survivor) = f
                        .manager
                        .alloc_survivor(last_head_id.unwrap_or(0))
                        .unwrap()
                    {
                        assert_eq!(survivor.id(), next_id);
                        next_id += 1;
                        survivors_outstanding += 1;
                    }
                }
            }
            Op::CleaningComplete(n) => {
                if cleanable.len() >= survivors_outstanding.max(1) {
                    let count = n
                        .clamp(survivors_outstanding.max(1), cleanable.len());
                    let cleaned: Vec<_> =
                        cleanable.drain(..count).collect();
                    f.manager.cleaning_complete(&cleaned);
                    survivors_outstanding = 0;
                }
            }
            Op::CleanableSegments => {
                f.manager.cleanable_segments(&mut cleanable);
            }
            Op::IterCreate => {
                if iterators < 3 {
                    f.manager.log_iterator_created();
                    iterators += 1;
                }
            }
            Op::IterDestroy => {
                if iterators > 0 {
                    f.manager.log_iterator_destroyed();
                    iterators -= 1;
                }
            }
            Op::BeginRpc => {
                if rpcs.len() < 4 {
                    rpcs.push(f.epochs.track());
                }
            }
            Op::EndRpc => {
                rpcs.pop();
            }
            Op::IncreaseReserve(n) => {
                let _ = f.manager.increase_survivor_reserve(n);
            }
        }

        // once the first head exists, backups hold exactly one open
        // replicated head between operations
        if last_head_id.is_some() {
            assert_eq!(f.replicas.open_head_count(), 1);
        }
        f.manager.assert_invariants();
    }

    true
}

#[test]
fn quickcheck_invariants_hold() {
    QuickCheck::new()
        .tests(500)
        .max_tests(5000)
        .quickcheck(prop_invariants_hold as fn(OpVec) -> bool);
}

#[test]
fn invariants_bug_01() {
    // postmortem: cleaned segments waiting on a digest must force an
    // emergency head rather than a refusal, or cleaning deadlocks
    use Op::*;
    prop_invariants_hold(OpVec {
        ops: vec![
            AllocHead(true),
            AllocHead(false),
            AllocHead(true),
            CleanableSegments,
            CleaningComplete(2),
            AllocHead(true),
        ],
    });
}
