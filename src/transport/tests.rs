//! Transport Module Tests
//!
//! In-process delivery order, crash semantics, the HTTP inbound route, and
//! how HTTP delivery gives up on unreachable and departed peers.

#[cfg(test)]
mod tests {
    use crate::engine::types::{Stamp, TaskOutcome};
    use crate::error::TransportError;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId, NodeState};
    use crate::transport::http::HttpTransport;
    use crate::transport::local::LocalNetwork;
    use crate::transport::protocol::{Envelope, Message, ENDPOINT_MESSAGE};
    use crate::transport::Transport;

    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::time::timeout;

    /// A port nothing listens on.
    async fn closed_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn service_with_peer(peer: &str, http_addr: SocketAddr) -> Arc<MembershipService> {
        let service = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "default",
            vec![],
        )
        .await
        .unwrap();
        service.members.insert(
            NodeId::named(peer),
            Node {
                id: NodeId::named(peer),
                gossip_addr: http_addr,
                http_addr,
                cluster: "default".to_string(),
                state: NodeState::Alive,
                incarnation: 1,
                last_seen: Some(Instant::now()),
            },
        );
        service
    }

    #[tokio::test]
    async fn test_local_send_preserves_order() {
        let network = LocalNetwork::new();
        let (a, _inbox_a) = network.connect(NodeId::named("a"));
        let (_b, mut inbox_b) = network.connect(NodeId::named("b"));

        for seq in 1..=3 {
            a.send(
                &NodeId::named("b"),
                Message::Abort {
                    stamp: Stamp::new(NodeId::named("a"), seq),
                },
            )
            .unwrap();
        }

        for expected in 1..=3 {
            let envelope = inbox_b.recv().await.unwrap();
            assert_eq!(envelope.from, NodeId::named("a"));
            match envelope.message {
                Message::Abort { stamp } => assert_eq!(stamp.seq, expected),
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let network = LocalNetwork::new();
        let (a, _inbox) = network.connect(NodeId::named("a"));

        let result = a.send(&NodeId::named("ghost"), Message::StealRequest);
        assert!(matches!(result, Err(TransportError::PeerUnknown(_))));
    }

    #[tokio::test]
    async fn test_disconnected_worker_is_silent() {
        let network = LocalNetwork::new();
        let (a, _inbox_a) = network.connect(NodeId::named("a"));
        let (b, mut inbox_b) = network.connect(NodeId::named("b"));

        network.disconnect(&NodeId::named("a"));

        assert!(matches!(
            a.send(&NodeId::named("b"), Message::Exit),
            Err(TransportError::Closed)
        ));
        assert!(b.send(&NodeId::named("a"), Message::Exit).is_err());
        assert!(inbox_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_self_and_missing_peers() {
        let network = LocalNetwork::new();
        let (a, mut inbox_a) = network.connect(NodeId::named("a"));
        let (_b, mut inbox_b) = network.connect(NodeId::named("b"));

        let peers = vec![NodeId::named("a"), NodeId::named("b"), NodeId::named("c")];
        let delivered = a.broadcast(&peers, Message::Exit);

        assert_eq!(delivered, 1);
        assert!(matches!(inbox_b.recv().await.unwrap().message, Message::Exit));
        assert!(inbox_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_http_inbound_feeds_inbox() {
        let (router, mut inbox, _loopback) = HttpTransport::inbound();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let envelope = Envelope {
            from: NodeId::named("remote"),
            message: Message::StealRequest,
        };
        let response = reqwest::Client::new()
            .post(format!("http://{}{}", addr, ENDPOINT_MESSAGE))
            .json(&envelope)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.from, NodeId::named("remote"));
        assert!(matches!(received.message, Message::StealRequest));
    }

    // ============================================================
    // HTTP DELIVERY FAILURES
    // ============================================================

    #[tokio::test]
    async fn test_http_undeliverable_message_comes_back_to_inbox() {
        let peer = NodeId::named("unreachable");
        let membership = service_with_peer("unreachable", closed_addr().await).await;
        let (_router, mut inbox, loopback) = HttpTransport::inbound();
        let transport = HttpTransport::new(membership.clone(), loopback);

        let stamp = Stamp::new(membership.local_node.id.clone(), 3);
        transport
            .send(
                &peer,
                Message::JobResult {
                    stamp: stamp.clone(),
                    outcome: TaskOutcome::Value(serde_json::json!(1)),
                },
            )
            .unwrap();

        let envelope = timeout(Duration::from_secs(15), inbox.recv())
            .await
            .expect("delivery never gave up")
            .unwrap();
        assert_eq!(envelope.from, membership.local_node.id);
        match envelope.message {
            Message::Undelivered { to, message } => {
                assert_eq!(to, peer);
                assert!(matches!(*message, Message::JobResult { stamp: s, .. } if s == stamp));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_sender_released_when_peer_dies() {
        let peer = NodeId::named("doomed");
        let membership = service_with_peer("doomed", closed_addr().await).await;
        let (_router, mut inbox, loopback) = HttpTransport::inbound();
        let transport = HttpTransport::new(membership.clone(), loopback);

        transport.send(&peer, Message::StealRequest).unwrap();
        assert_eq!(transport.sender_count(), 1);

        membership.declare_dead(&peer);

        assert!(matches!(
            transport.send(&peer, Message::StealRequest),
            Err(TransportError::PeerGone(_))
        ));
        assert_eq!(transport.sender_count(), 0, "the cached queue is evicted");

        // The request still in flight is dropped quietly rather than bounced.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(inbox.try_recv().is_err());
    }
}
