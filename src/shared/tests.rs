//! Shared Objects Module Tests
//!
//! ## Test Scopes
//! - **Local Semantics**: read-your-writes, typed handles, batching.
//! - **Replication**: broadcast delivery to every replica, duplicate and
//!   unknown-object handling, state transfer to late joiners, concurrent
//!   writers on one replica, blocking state fetches.

#[cfg(test)]
mod tests {
    use crate::engine::stats::WorkerStats;
    use crate::membership::registry::{MembershipTable, StaticRegistry};
    use crate::membership::types::NodeId;
    use crate::shared::replicator::{Replicator, SharedState, SoInvocation};
    use crate::transport::local::LocalNetwork;
    use crate::transport::protocol::Message;
    use crate::transport::Inbox;

    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterWrite {
        Add(i64),
        Reset,
    }

    impl SharedState for Counter {
        type Write = CounterWrite;

        fn apply(&mut self, write: &CounterWrite) {
            match write {
                CounterWrite::Add(delta) => self.value += delta,
                CounterWrite::Reset => self.value = 0,
            }
        }
    }

    struct Replica {
        id: NodeId,
        replicator: Arc<Replicator>,
        inbox: Inbox,
        stats: Arc<WorkerStats>,
    }

    fn replicas(size: usize, batch_size: usize) -> Vec<Replica> {
        let network = LocalNetwork::new();
        let table = MembershipTable::new();
        let ids: Vec<NodeId> = (0..size).map(|i| NodeId::named(&format!("w{}", i))).collect();
        for id in &ids {
            table.join(id.clone(), "default");
        }

        ids.into_iter()
            .map(|id| {
                let (transport, inbox) = network.connect(id.clone());
                let registry = StaticRegistry::new(id.clone(), table.clone());
                let stats = Arc::new(WorkerStats::default());
                let replicator = Replicator::new(transport, registry, batch_size, stats.clone());
                Replica {
                    id,
                    replicator,
                    inbox,
                    stats,
                }
            })
            .collect()
    }

    /// Plays the message pump: feeds every queued envelope to its replicator.
    fn deliver_all(replicas: &mut [Replica]) -> usize {
        let mut delivered = 0;
        for replica in replicas.iter_mut() {
            while let Ok(envelope) = replica.inbox.try_recv() {
                delivered += 1;
                match envelope.message {
                    Message::SoBatch { invocations } => {
                        replica.replicator.handle_batch(&envelope.from, invocations);
                    }
                    Message::SoRequest { object_id } => {
                        replica.replicator.handle_request(&envelope.from, &object_id)
                    }
                    Message::SoTransfer { object_id, state } => {
                        replica.replicator.handle_transfer(&object_id, state)
                    }
                    other => panic!("Unexpected message {:?}", other),
                }
            }
        }
        delivered
    }

    // ============================================================
    // LOCAL SEMANTICS
    // ============================================================

    #[test]
    fn test_read_your_writes() {
        let replicas = replicas(2, 1);
        let counter = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        counter.write(CounterWrite::Add(3)).unwrap();

        assert_eq!(counter.read(|c| c.value), 3, "local replica updated before any delivery");
        assert_eq!(counter.snapshot(), Counter { value: 3 });
        assert_eq!(counter.id(), "counter");
        assert_eq!(replicas[0].stats.snapshot().so_writes, 1);
    }

    #[test]
    fn test_create_twice_returns_same_replica() {
        let replicas = replicas(1, 1);
        let first = replicas[0]
            .replicator
            .create("counter", Counter { value: 1 })
            .unwrap();
        first.write(CounterWrite::Add(1)).unwrap();

        let second = replicas[0]
            .replicator
            .create("counter", Counter { value: 100 })
            .unwrap();

        assert_eq!(second.read(|c| c.value), 2);
        assert!(replicas[0].replicator.contains("counter"));
    }

    #[test]
    fn test_get_with_wrong_type_is_none() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Flag(bool);

        impl SharedState for Flag {
            type Write = bool;

            fn apply(&mut self, write: &bool) {
                self.0 = *write;
            }
        }

        let replicas = replicas(1, 1);
        replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        assert!(replicas[0].replicator.get::<Flag>("counter").is_none());
        assert!(replicas[0].replicator.get::<Counter>("missing").is_none());
        assert!(replicas[0].replicator.create("counter", Flag(true)).is_err());
    }

    #[test]
    fn test_writes_are_batched() {
        let mut replicas = replicas(2, 3);
        let counter = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        replicas[1]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        counter.write(CounterWrite::Add(1)).unwrap();
        counter.write(CounterWrite::Add(1)).unwrap();
        assert_eq!(replicas[0].replicator.pending_writes(), 2);
        assert!(replicas[1].inbox.try_recv().is_err(), "nothing sent below the batch size");

        counter.write(CounterWrite::Add(1)).unwrap();
        assert_eq!(replicas[0].replicator.pending_writes(), 0);

        let envelope = replicas[1].inbox.try_recv().unwrap();
        match envelope.message {
            Message::SoBatch { invocations } => {
                assert_eq!(invocations.len(), 3);
                let seqs: Vec<u64> = invocations.iter().map(|i| i.seq).collect();
                assert_eq!(seqs, vec![1, 2, 3]);
            }
            other => panic!("Expected SoBatch, got {:?}", other),
        }
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    #[test]
    fn test_every_replica_sees_every_write() {
        let mut replicas = replicas(4, 1);
        let counters: Vec<_> = replicas
            .iter()
            .map(|r| r.replicator.create("counter", Counter::default()).unwrap())
            .collect();

        for counter in &counters {
            counter.write(CounterWrite::Add(1)).unwrap();
        }
        deliver_all(&mut replicas);

        for (replica, counter) in replicas.iter().zip(&counters) {
            assert_eq!(counter.read(|c| c.value), 4, "replica {}", replica.id);
            assert_eq!(replica.stats.snapshot().so_applies, 3);
        }
    }

    #[test]
    fn test_writes_from_one_sender_apply_in_order() {
        let mut replicas = replicas(2, 1);
        let writer = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        let reader = replicas[1]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        writer.write(CounterWrite::Add(5)).unwrap();
        writer.write(CounterWrite::Reset).unwrap();
        writer.write(CounterWrite::Add(2)).unwrap();
        deliver_all(&mut replicas);

        assert_eq!(reader.read(|c| c.value), 2);
        assert_eq!(writer.read(|c| c.value), 2);
    }

    #[test]
    fn test_duplicate_sequence_is_applied_once() {
        let replicas = replicas(1, 1);
        let counter = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        let sender = NodeId::named("w9");
        let invocation = SoInvocation {
            object_id: "counter".to_string(),
            seq: 1,
            write: json!({ "Add": 10 }),
        };

        let first = replicas[0]
            .replicator
            .handle_batch(&sender, vec![invocation.clone()]);
        let second = replicas[0].replicator.handle_batch(&sender, vec![invocation]);

        assert_eq!((first, second), (1, 0));
        assert_eq!(counter.read(|c| c.value), 10);
    }

    #[test]
    fn test_unknown_object_and_malformed_writes_dropped() {
        let replicas = replicas(1, 1);
        let counter = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        let sender = NodeId::named("w9");

        let applied = replicas[0].replicator.handle_batch(
            &sender,
            vec![
                SoInvocation {
                    object_id: "missing".to_string(),
                    seq: 1,
                    write: json!({ "Add": 1 }),
                },
                SoInvocation {
                    object_id: "counter".to_string(),
                    seq: 2,
                    write: json!("not a write"),
                },
                SoInvocation {
                    object_id: "counter".to_string(),
                    seq: 3,
                    write: json!({ "Add": 7 }),
                },
            ],
        );

        assert_eq!(applied, 1);
        assert_eq!(counter.read(|c| c.value), 7);
    }

    #[test]
    fn test_state_transfer_initialises_late_replica() {
        let mut replicas = replicas(2, 1);
        let source = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        source.write(CounterWrite::Add(5)).unwrap();
        // The late joiner missed that broadcast.
        while replicas[1].inbox.try_recv().is_ok() {}

        let late = replicas[1]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        let source_id = replicas[0].id.clone();
        replicas[1]
            .replicator
            .request_state(&source_id, "counter")
            .unwrap();

        // Request, then transfer.
        deliver_all(&mut replicas);
        deliver_all(&mut replicas);

        assert_eq!(late.read(|c| c.value), 5);
    }

    #[test]
    fn test_flush_with_nothing_queued_sends_nothing() {
        let mut replicas = replicas(2, 8);

        assert_eq!(replicas[0].replicator.flush(), 0);
        assert_eq!(deliver_all(&mut replicas), 0);
    }

    #[test]
    fn test_concurrent_writers_keep_batches_in_sequence() {
        let mut replicas = replicas(2, 3);
        replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        let reader = replicas[1]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let replicator = replicas[0].replicator.clone();
                std::thread::spawn(move || {
                    let counter = replicator.get::<Counter>("counter").unwrap();
                    for _ in 0..50 {
                        counter.write(CounterWrite::Add(1)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        replicas[0].replicator.flush();

        let mut last_seq = 0;
        while let Ok(envelope) = replicas[1].inbox.try_recv() {
            let Message::SoBatch { invocations } = envelope.message else {
                panic!("Expected SoBatch");
            };
            for invocation in &invocations {
                assert!(invocation.seq > last_seq, "seq {} after {}", invocation.seq, last_seq);
                last_seq = invocation.seq;
            }
            replicas[1].replicator.handle_batch(&envelope.from, invocations);
        }

        assert_eq!(last_seq, 200);
        assert_eq!(reader.read(|c| c.value), 200);
    }

    #[test]
    fn test_fetch_waits_for_transfer() {
        let mut replicas = replicas(2, 1);
        let source = replicas[0]
            .replicator
            .create("counter", Counter::default())
            .unwrap();
        source.write(CounterWrite::Add(5)).unwrap();
        while replicas[1].inbox.try_recv().is_ok() {}
        let late = replicas[1]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        let fetch = {
            let replicator = replicas[1].replicator.clone();
            let source_id = replicas[0].id.clone();
            std::thread::spawn(move || {
                replicator.fetch_state(&source_id, "counter", Duration::from_secs(10))
            })
        };
        while !fetch.is_finished() {
            deliver_all(&mut replicas);
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(fetch.join().unwrap().unwrap());
        assert_eq!(late.read(|c| c.value), 5);
        assert_eq!(replicas[1].stats.snapshot().so_fetches, 1);
    }

    #[test]
    fn test_unanswered_fetch_times_out() {
        let replicas = replicas(2, 1);
        replicas[1]
            .replicator
            .create("counter", Counter::default())
            .unwrap();

        let fetched = replicas[1]
            .replicator
            .fetch_state(&replicas[0].id, "counter", Duration::from_millis(100))
            .unwrap();

        assert!(!fetched);
    }
}
