//! Replicas converge regardless of delivery order and duplication.

use quire_collab::auth::AuthenticatedUser;
use quire_collab::document::{Origin, ReplicatedDocument};
use quire_collab::protocol::Frame;
use quire_collab::registry::RoomRegistry;
use quire_collab::room::{RoomConfig, RoomKey};
use quire_collab::session::{ConnectionId, ConnectionSession, Outbound, OutboundSender};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const WORDS: &[&str] = &["a", "lorem ", "ipsum", "\n", "dolor sit", "xyz"];

/// One random local edit. Returns the delta it produced.
fn random_edit(doc: &ReplicatedDocument, rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = doc.len();
    if len > 0 && rng.gen_bool(0.3) {
        let position = rng.gen_range(0..len);
        let length = rng.gen_range(1..=(len - position).min(4));
        doc.delete(position, length).unwrap()
    } else {
        let position = rng.gen_range(0..=len);
        let word = WORDS.choose(rng).unwrap();
        doc.insert(position, word).unwrap()
    }
}

fn run_interleaving(seed: u64, replicas: usize, edits_each: usize) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let docs: Vec<ReplicatedDocument> = (0..replicas).map(|_| ReplicatedDocument::new()).collect();
    let ids: Vec<ConnectionId> = (0..replicas).map(|_| ConnectionId::new()).collect();

    // Each replica edits in isolation; deltas are kept with their author.
    let mut produced: Vec<(usize, Vec<u8>)> = Vec::new();
    for (author, doc) in docs.iter().enumerate() {
        for _ in 0..edits_each {
            produced.push((author, random_edit(doc, &mut rng)));
        }
    }

    for (target, doc) in docs.iter().enumerate() {
        let mut inbox: Vec<&(usize, Vec<u8>)> = produced.iter().filter(|(a, _)| *a != target).collect();
        // Duplicate a few deliveries.
        let extra: Vec<_> = inbox
            .iter()
            .filter(|_| rng.gen_bool(0.2))
            .copied()
            .collect();
        inbox.extend(extra);
        inbox.shuffle(&mut rng);

        for (author, delta) in inbox {
            doc.apply_delta(delta, Origin::Remote { from: ids[*author] }).unwrap();
        }
    }

    let expected = docs[0].content();
    for (i, doc) in docs.iter().enumerate() {
        assert_eq!(doc.content(), expected, "seed {seed}: replica {i} diverged");
    }
}

#[test]
fn test_random_interleavings_converge() {
    for seed in 0..25 {
        run_interleaving(seed, 3, 12);
    }
}

#[test]
fn test_many_replicas_converge() {
    run_interleaving(0xC0FFEE, 6, 20);
}

#[test]
fn test_full_state_after_partial_deltas_converges() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let a = ReplicatedDocument::new();
    let b = ReplicatedDocument::new();
    let mut deltas = Vec::new();
    for _ in 0..15 {
        deltas.push(random_edit(&a, &mut rng));
    }
    // Half the deltas arrive, then the full state, then the rest again.
    let from = ConnectionId::new();
    for delta in deltas.iter().step_by(2) {
        b.apply_delta(delta, Origin::Remote { from }).unwrap();
    }
    b.apply_delta(&a.encode_full(), Origin::Remote { from }).unwrap();
    for delta in &deltas {
        b.apply_delta(delta, Origin::Remote { from }).unwrap();
    }
    assert_eq!(a.content(), b.content());
}

// ─── Through a room ──────────────────────────────────────────────────

struct Peer {
    session: ConnectionSession,
    rx: mpsc::Receiver<Outbound>,
    doc: ReplicatedDocument,
}

impl Peer {
    fn new(name: &str) -> Self {
        let (outbound, rx) = OutboundSender::channel(4096);
        Self {
            session: ConnectionSession::new(AuthenticatedUser::new(format!("u-{name}"), name), outbound),
            rx,
            doc: ReplicatedDocument::new(),
        }
    }

    /// Apply every sync frame queued so far.
    fn drain(&mut self) {
        while let Ok(out) = self.rx.try_recv() {
            if let Outbound::Binary(frame) = out {
                if let Ok(Frame::Sync(delta)) = Frame::decode(&frame) {
                    self.doc.apply_delta(&delta, Origin::InitialSync).unwrap();
                }
            }
        }
    }
}

#[tokio::test]
async fn test_peers_converge_through_room() {
    let registry = RoomRegistry::in_memory(RoomConfig::default());
    let key = RoomKey::new("proj", "shared.txt").unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let mut peers: Vec<Peer> = ["alice", "bob", "carol"].iter().map(|n| Peer::new(n)).collect();
    for peer in peers.iter_mut() {
        registry.join_room(&mut peer.session, key.clone()).await.unwrap();
    }

    for round in 0..40 {
        let who = rng.gen_range(0..peers.len());
        let peer = &mut peers[who];
        let delta = random_edit(&peer.doc, &mut rng);
        assert!(peer.session.submit_update(delta).await);
        if round % 5 == 0 {
            for peer in peers.iter_mut() {
                peer.drain();
            }
        }
    }

    let room_content = {
        let mut last = None;
        for _ in 0..100 {
            sleep(Duration::from_millis(10)).await;
            let now = registry.inspect(&key).await.unwrap().content;
            if last.as_ref() == Some(&now) {
                break;
            }
            last = Some(now);
        }
        last.unwrap()
    };

    for peer in peers.iter_mut() {
        peer.drain();
        assert_eq!(peer.doc.content(), room_content);
    }
}
