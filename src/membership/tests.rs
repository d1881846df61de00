//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership system.
//!
//! ## Test Scopes
//! - **Data Structures**: Ensures uniqueness of IDs and correct serialization of wire protocol messages.
//! - **Hash Ring**: Determinism, spread and minimal movement when members change.
//! - **Service Logic**: Initialization, cluster isolation and the events emitted on joins and leaves.
//! - **Local Cluster**: Shared ring, removal events and forwarding between in-process nodes.

#[cfg(test)]
mod tests {
    use crate::error::{ForwardError, MembershipError};
    use crate::forwarding::RpcHandler;
    use crate::forwarding::protocol::ForwardOptions;
    use crate::membership::local::LocalCluster;
    use crate::membership::provider::MembershipProvider;
    use crate::membership::ring::HashRing;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{
        Envelope, GossipMessage, MemberState, MembershipEvent, Node, NodeId,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;

    fn node(id: &str, gossip: &str, http: &str) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: gossip.parse().unwrap(),
            http_addr: http.parse().unwrap(),
            state: MemberState::Alive,
            incarnation: 1,
            last_seen: None,
        }
    }

    async fn new_service(cluster: &str) -> Arc<MembershipService> {
        MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:6000".parse().unwrap(),
            cluster,
        )
        .await
        .expect("Failed to create service")
    }

    async fn next_event(rx: &mut broadcast::Receiver<MembershipEvent>) -> MembershipEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no event emitted")
            .expect("event channel closed")
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(NodeId("node-1".to_string()));
        set.insert(NodeId("node-1".to_string()));
        set.insert(NodeId("node-2".to_string()));

        assert_eq!(set.len(), 2, "HashSet should have 2 unique NodeIds");
    }

    // ============================================================
    // NODE TESTS
    // ============================================================

    #[test]
    fn test_node_address_is_http_addr() {
        let n = node("a", "127.0.0.1:5000", "127.0.0.1:6000");
        assert_eq!(n.address(), "127.0.0.1:6000");
    }

    #[test]
    fn test_suspect_stays_on_ring_dead_does_not() {
        let mut n = node("a", "127.0.0.1:5000", "127.0.0.1:6000");
        assert!(n.is_on_ring());

        n.state = MemberState::Suspect;
        assert!(n.is_on_ring());

        n.state = MemberState::Dead;
        assert!(!n.is_on_ring());
    }

    #[test]
    fn test_node_serialization_skips_last_seen() {
        let mut n = node("test-node", "192.168.1.1:5000", "192.168.1.1:6000");
        n.incarnation = 42;
        n.last_seen = Some(Instant::now());

        let json = serde_json::to_string(&n).expect("Serialization failed");
        let restored: Node = serde_json::from_str(&json).expect("Deserialization failed");

        assert_eq!(restored.id, n.id);
        assert_eq!(restored.http_addr, n.http_addr);
        assert_eq!(restored.incarnation, 42);
        assert!(restored.last_seen.is_none());
    }

    // ============================================================
    // GOSSIP MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_envelope_bincode_keeps_cluster_and_members() {
        let envelope = Envelope {
            cluster: "scheduler".to_string(),
            message: GossipMessage::Ack {
                from: NodeId("responder".to_string()),
                incarnation: 10,
                members: vec![
                    node("node-1", "127.0.0.1:5000", "127.0.0.1:6000"),
                    node("node-2", "127.0.0.1:5001", "127.0.0.1:6001"),
                ],
            },
        };

        let encoded = bincode::serialize(&envelope).expect("Failed to serialize envelope");
        let decoded: Envelope = bincode::deserialize(&encoded).expect("Failed to deserialize");

        assert_eq!(decoded.cluster, "scheduler");
        if let GossipMessage::Ack {
            from,
            incarnation,
            members,
        } = decoded.message
        {
            assert_eq!(from.0, "responder");
            assert_eq!(incarnation, 10);
            assert_eq!(members.len(), 2);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_leave_serialization() {
        let msg = GossipMessage::Leave {
            node_id: NodeId("leaving".to_string()),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Leave");
        let decoded: GossipMessage = bincode::deserialize(&encoded).expect("Failed to deserialize");

        assert!(matches!(decoded, GossipMessage::Leave { node_id } if node_id.0 == "leaving"));
    }

    // ============================================================
    // HASH RING TESTS
    // ============================================================

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert_eq!(ring.lookup("app.0"), None);
    }

    #[test]
    fn test_ring_is_independent_of_insertion_order() {
        let a = HashRing::with_members(100, ["n1:1", "n2:1", "n3:1"]);
        let b = HashRing::with_members(100, ["n3:1", "n1:1", "n2:1"]);

        for p in 0..200 {
            let key = format!("app.{}", p);
            assert_eq!(a.lookup(&key), b.lookup(&key), "owner differs for {}", key);
        }
    }

    #[test]
    fn test_ring_spreads_keys() {
        let ring = HashRing::with_members(100, ["n1:1", "n2:1", "n3:1"]);
        let mut counts: HashMap<&str, usize> = HashMap::new();

        for p in 0..3000 {
            let key = format!("app.{}", p);
            *counts.entry(ring.lookup(&key).unwrap()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (member, count) in counts {
            assert!(count > 500, "{} only owns {} keys", member, count);
        }
    }

    #[test]
    fn test_ring_removal_only_moves_departed_keys() {
        let before = HashRing::with_members(100, ["n1:1", "n2:1", "n3:1"]);
        let mut after = before.clone();
        assert!(after.remove("n2:1"));
        assert!(!after.remove("n2:1"));

        for p in 0..500 {
            let key = format!("app.{}", p);
            let old = before.lookup(&key).unwrap();
            let new = after.lookup(&key).unwrap();
            if old != "n2:1" {
                assert_eq!(old, new, "{} moved without its owner leaving", key);
            } else {
                assert_ne!(new, "n2:1");
            }
        }
    }

    #[test]
    fn test_ring_add_is_idempotent() {
        let mut ring = HashRing::default();
        assert!(ring.add("n1:1"));
        assert!(!ring.add("n1:1"));
        assert_eq!(ring.len(), 1);
        assert!(ring.contains("n1:1"));
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let service = new_service("scheduler").await;

        assert_eq!(service.members.len(), 1);

        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, service.local_node.id);
        assert_eq!(alive[0].state, MemberState::Alive);

        // A lone node owns everything.
        assert_eq!(service.lookup("app.7"), Some(service.local_address()));
    }

    #[tokio::test]
    async fn test_membership_get_member() {
        let service = new_service("scheduler").await;

        let member = service.get_member(&service.local_node.id);
        assert_eq!(member.unwrap().id, service.local_node.id);

        assert!(service.get_member(&NodeId("non-existent".to_string())).is_none());
        assert!(service.find_by_address("127.0.0.1:6000").is_some());
        assert!(service.find_by_address("127.0.0.1:6999").is_none());
    }

    #[tokio::test]
    async fn test_join_emits_node_added_and_extends_ring() {
        let service = new_service("scheduler").await;
        let mut rx = service.subscribe();

        let joiner = node("joiner", "127.0.0.1:5999", "127.0.0.1:6999");
        let src: SocketAddr = "127.0.0.1:5999".parse().unwrap();
        service.inject(GossipMessage::Join { node: joiner }, src).await;

        assert_eq!(
            next_event(&mut rx).await,
            MembershipEvent::NodeAdded("127.0.0.1:6999".to_string())
        );
        assert_eq!(service.get_alive_members().len(), 2);

        let owners: std::collections::HashSet<String> = (0..100)
            .filter_map(|p| service.lookup(&format!("app.{}", p)))
            .collect();
        assert_eq!(owners.len(), 2);
    }

    #[tokio::test]
    async fn test_leave_emits_node_removed() {
        let service = new_service("scheduler").await;
        let src: SocketAddr = "127.0.0.1:5998".parse().unwrap();
        let peer = node("peer", "127.0.0.1:5998", "127.0.0.1:6998");
        service.inject(GossipMessage::Join { node: peer }, src).await;

        let mut rx = service.subscribe();
        service
            .inject(
                GossipMessage::Leave {
                    node_id: NodeId("peer".to_string()),
                },
                src,
            )
            .await;

        assert_eq!(
            next_event(&mut rx).await,
            MembershipEvent::NodeRemoved("127.0.0.1:6998".to_string())
        );
        assert!(service.find_by_address("127.0.0.1:6998").is_some_and(|n| !n.is_on_ring()));
        assert_eq!(service.lookup("app.1"), Some(service.local_address()));
    }

    #[tokio::test]
    async fn test_ack_declaring_self_dead_emits_self_removal() {
        let service = new_service("scheduler").await;
        let mut rx = service.subscribe();

        let mut me = service.local_node.clone();
        me.state = MemberState::Dead;
        me.incarnation = 5;

        service
            .inject(
                GossipMessage::Ack {
                    from: NodeId("peer".to_string()),
                    incarnation: 1,
                    members: vec![me],
                },
                "127.0.0.1:5997".parse().unwrap(),
            )
            .await;

        assert_eq!(
            next_event(&mut rx).await,
            MembershipEvent::NodeRemoved(service.local_address())
        );
    }

    #[tokio::test]
    async fn test_foreign_cluster_datagrams_are_ignored() {
        let a = new_service("scheduler").await;
        let b = new_service("other").await;
        let mut rx = a.subscribe();
        a.clone().start().await;

        b.join(&[a.local_node.gossip_addr], 1).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(waited.is_err(), "foreign join must not produce an event");
        assert_eq!(a.members.len(), 1);

        a.leave().await;
    }

    #[tokio::test]
    async fn test_join_without_seeds_is_founder() {
        let service = new_service("scheduler").await;
        assert!(service.join(&[], 3).await.is_ok());
    }

    // ============================================================
    // LOCAL CLUSTER TESTS
    // ============================================================

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle_rpc(&self, method: &str, payload: &[u8]) -> Vec<u8> {
            let mut out = method.as_bytes().to_vec();
            out.extend_from_slice(payload);
            out
        }
    }

    fn fast_options() -> ForwardOptions {
        ForwardOptions {
            max_retries: 2,
            retry_schedule: vec![Duration::from_millis(1)],
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_local_cluster_shares_ring() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a:1");
        let b = cluster.join("b:1");

        for p in 0..50 {
            let key = format!("app.{}", p);
            assert_eq!(a.lookup(&key).unwrap(), b.lookup(&key).unwrap());
        }
        assert_eq!(a.reachable_members().unwrap(), vec!["a:1", "b:1"]);
    }

    #[tokio::test]
    async fn test_local_cluster_remove_notifies_everyone() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a:1");
        let b = cluster.join("b:1");
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        cluster.remove("b:1");

        let removed = MembershipEvent::NodeRemoved("b:1".to_string());
        assert_eq!(next_event(&mut rx_a).await, removed);
        assert_eq!(next_event(&mut rx_b).await, removed);
        assert_eq!(a.reachable_members().unwrap(), vec!["a:1"]);
    }

    #[tokio::test]
    async fn test_local_cluster_empty_ring_lookup_fails() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a:1");
        cluster.remove("a:1");

        assert!(matches!(a.lookup("app.0"), Err(MembershipError::EmptyRing(_))));
    }

    #[tokio::test]
    async fn test_local_forward_reaches_handler() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a:1");
        let _b = cluster.join("b:1");
        let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
        cluster.register_handler("b:1", Arc::downgrade(&echo));

        let reply = a
            .forward("b:1", &[], "supervisor", "Ping", b"!".to_vec(), &fast_options())
            .await
            .unwrap();
        assert_eq!(reply, b"Ping!");
    }

    #[tokio::test]
    async fn test_local_forward_errors() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a:1");
        let _b = cluster.join("b:1");
        let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
        cluster.register_handler("b:1", Arc::downgrade(&echo));

        let unknown = a
            .forward("z:1", &[], "supervisor", "Ping", vec![], &fast_options())
            .await;
        assert!(matches!(unknown, Err(ForwardError::UnknownDestination(_))));

        cluster.set_unreachable("b:1", true);
        let exhausted = a
            .forward("b:1", &[], "supervisor", "Ping", vec![], &fast_options())
            .await;
        assert!(matches!(exhausted, Err(ForwardError::Exhausted { attempts: 3, .. })));
        assert_eq!(a.reachable_members().unwrap(), vec!["a:1"]);

        cluster.set_unreachable("b:1", false);
        assert!(
            a.forward("b:1", &[], "supervisor", "Ping", vec![], &fast_options())
                .await
                .is_ok()
        );
    }
}
