//! End-to-end scenarios over the in-process network.

use std::sync::Arc;
use std::time::Duration;

use braid::node::Node;
use braid::{ActionFilter, CollectionConfig, Filter, IndexConfig, InstanceId, Query};
use braid_core::EventKind;
use braid_net::mem::MemNetwork;
use braid_net::NetConfig;
use libp2p_identity::{Keypair, PeerId};
use serde_json::json;

fn fast_net_config() -> NetConfig {
    NetConfig {
        exchange_interval: Duration::from_millis(200),
        backfill_backoff: Duration::from_millis(50),
        ..NetConfig::default()
    }
}

async fn spawn_node(network: &MemNetwork) -> (Node, PeerId) {
    let peer = Keypair::generate_ed25519().public().to_peer_id();
    let (transport, gossip) = network.attach(peer);
    let node = Node::memory(Arc::new(transport), Arc::new(gossip), fast_net_config())
        .await
        .expect("node starts");
    (node, peer)
}

fn book_collection() -> CollectionConfig {
    CollectionConfig {
        name: "Book".into(),
        schema: json!({
            "type": "object",
            "properties": {
                "_id": {"type": "string"},
                "title": {"type": "string"},
                "author": {"type": "string"},
            },
            "required": ["_id", "title", "author"],
        }),
        indexes: vec![IndexConfig {
            path: "author".into(),
            unique: false,
        }],
    }
}

fn book(title: &str, author: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({"title": title, "author": author})).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(700)).await;
}

#[tokio::test]
async fn scenario_a_single_peer_crud() {
    let network = MemNetwork::new();
    let (node, _) = spawn_node(&network).await;
    let db = node.manager().new_db().await.unwrap();
    let books = db.new_collection(book_collection()).unwrap();

    let ids = books
        .create(&[&book("T1", "A1"), &book("T2", "A1"), &book("T3", "A2")])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let by_author = books
        .find(&Query::new().filter(Filter::eq("author", json!("A1"))))
        .await
        .unwrap();
    assert_eq!(by_author.len(), 2);

    // modify T3 and watch the old title disappear
    let t3 = ids[2];
    let updated = serde_json::to_vec(
        &json!({"_id": t3.to_string(), "title": "T3'", "author": "A2"}),
    )
    .unwrap();
    books.save(&[&updated]).await.unwrap();

    let stale = books
        .find(&Query::new().filter(Filter::eq("title", json!("T3"))))
        .await
        .unwrap();
    assert!(stale.is_empty());
    let fresh = books
        .find(&Query::new().filter(Filter::eq("title", json!("T3'"))))
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);

    books.delete(&[t3]).await.unwrap();
    let gone = books
        .find(&Query::new().filter(Filter::eq("title", json!("T3'"))))
        .await
        .unwrap();
    assert!(gone.is_empty());
    assert!(books.find_by_id(&t3).await.is_err());
}

#[tokio::test]
async fn scenario_b_two_peer_replication() {
    let network = MemNetwork::new();
    let (p1, _) = spawn_node(&network).await;
    let (p2, _) = spawn_node(&network).await;

    let db1 = p1.manager().new_db().await.unwrap();
    let people = db1.new_collection(person_collection()).unwrap();
    let id = InstanceId::new_random();
    let instance = serde_json::to_vec(&json!({"_id": id.to_string(), "name": "n"})).unwrap();
    people.create(&[&instance]).await.unwrap();

    // join from p1's address with the full thread key
    let addr = p1.net().thread_addr(db1.thread()).expect("addressable thread");
    let info = p1.net().get_thread(db1.thread()).unwrap();
    let db2 = p2
        .manager()
        .new_db_from_addr(&addr, info.key.clone())
        .await
        .unwrap();
    let people2 = db2.new_collection(person_collection()).unwrap();

    settle().await;

    let replicated = people2.find_by_id(&id).await.expect("instance replicated");
    let got: serde_json::Value = serde_json::from_slice(&replicated).unwrap();
    assert_eq!(got, json!({"_id": id.to_string(), "name": "n"}));
}

fn person_collection() -> CollectionConfig {
    CollectionConfig {
        name: "Person".into(),
        schema: json!({
            "type": "object",
            "properties": {
                "_id": {"type": "string"},
                "name": {"type": "string"},
            },
            "required": ["_id", "name"],
        }),
        indexes: Vec::new(),
    }
}

#[tokio::test]
async fn scenario_c_gap_recovery_across_peers() {
    let network = MemNetwork::new();
    let (p1, p1_peer) = spawn_node(&network).await;
    let (p2, _) = spawn_node(&network).await;
    let (p3, p3_peer) = spawn_node(&network).await;

    // p1 creates the thread; p2 and p3 join while p1 is online
    let db1 = p1.manager().new_db().await.unwrap();
    let people1 = db1.new_collection(person_collection()).unwrap();
    let addr = p1.net().thread_addr(db1.thread()).unwrap();
    let key = p1.net().get_thread(db1.thread()).unwrap().key;

    let db2 = p2
        .manager()
        .new_db_from_addr(&addr, key.clone())
        .await
        .unwrap();
    db2.new_collection(person_collection()).unwrap();
    let db3 = p3
        .manager()
        .new_db_from_addr(&addr, key.clone())
        .await
        .unwrap();
    db3.new_collection(person_collection()).unwrap();

    // p2 goes offline; p1 commits r1..r3, which p3 picks up
    network.set_online(&p2.net().local_peer(), false);
    let mut ids = Vec::new();
    for n in 0..3 {
        let id = InstanceId::new_random();
        let doc = serde_json::to_vec(&json!({"_id": id.to_string(), "name": format!("n{n}")}))
            .unwrap();
        people1.create(&[&doc]).await.unwrap();
        ids.push(id);
    }
    settle().await;

    // p1 goes offline before p2 returns; p2 must fetch r1..r3 from p3
    network.set_online(&p1_peer, false);
    network.set_online(&p2.net().local_peer(), true);
    p2.net().pull_thread(db1.thread()).await.unwrap();
    settle().await;
    settle().await;

    let people2 = db2.collection("Person").unwrap();
    for id in &ids {
        people2
            .find_by_id(id)
            .await
            .expect("records recovered via third peer");
    }

    // p1 returns and commits r4..r5; p2 catches up from p1
    network.set_online(&p1_peer, true);
    for n in 3..5 {
        let id = InstanceId::new_random();
        let doc = serde_json::to_vec(&json!({"_id": id.to_string(), "name": format!("n{n}")}))
            .unwrap();
        people1.create(&[&doc]).await.unwrap();
        ids.push(id);
    }
    settle().await;
    settle().await;

    for id in &ids {
        people2.find_by_id(id).await.expect("full chain recovered");
    }

    // final heads agree between p1 and p2
    let own = p1.net().store().own_log(db1.thread()).unwrap().unwrap();
    let head_on_p1 = p1
        .net()
        .store()
        .heads()
        .heads(db1.thread(), &own.id)
        .unwrap();
    let head_on_p2 = p2
        .net()
        .store()
        .heads()
        .heads(db1.thread(), &own.id)
        .unwrap();
    assert_eq!(head_on_p1, head_on_p2);
    let _ = p3_peer;
}

#[tokio::test]
async fn scenario_e_unique_index_enforcement() {
    let network = MemNetwork::new();
    let (node, _) = spawn_node(&network).await;
    let db = node.manager().new_db().await.unwrap();
    let users = db
        .new_collection(CollectionConfig {
            name: "User".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "_id": {"type": "string"},
                    "email": {"type": "string"},
                },
                "required": ["_id", "email"],
            }),
            indexes: vec![IndexConfig {
                path: "email".into(),
                unique: true,
            }],
        })
        .unwrap();

    let first = serde_json::to_vec(
        &json!({"_id": InstanceId::new_random().to_string(), "email": "a@x"}),
    )
    .unwrap();
    users.create(&[&first]).await.unwrap();

    let second = serde_json::to_vec(
        &json!({"_id": InstanceId::new_random().to_string(), "email": "a@x"}),
    )
    .unwrap();
    let err = users.create(&[&second]).await.unwrap_err();
    assert!(matches!(err, braid::DbError::UniqueViolation { .. }));

    // a different value is fine
    let third = serde_json::to_vec(
        &json!({"_id": InstanceId::new_random().to_string(), "email": "b@x"}),
    )
    .unwrap();
    users.create(&[&third]).await.unwrap();
}

#[tokio::test]
async fn scenario_f_listener_filter() {
    let network = MemNetwork::new();
    let (node, _) = spawn_node(&network).await;
    let db = node.manager().new_db().await.unwrap();

    let c1 = db
        .new_collection(CollectionConfig {
            name: "C1".into(),
            schema: open_schema(),
            indexes: Vec::new(),
        })
        .unwrap();
    let c2 = db
        .new_collection(CollectionConfig {
            name: "C2".into(),
            schema: open_schema(),
            indexes: Vec::new(),
        })
        .unwrap();

    let mut listener = db
        .listen(vec![ActionFilter {
            collection: Some("C1".into()),
            kind: Some(EventKind::Save),
            instance: None,
        }])
        .unwrap();

    let i1 = InstanceId::new_random();
    let j1 = InstanceId::new_random();
    let doc = |id: &InstanceId| serde_json::to_vec(&json!({"_id": id.to_string()})).unwrap();

    c1.create(&[&doc(&i1)]).await.unwrap();
    c1.save(&[&doc(&i1)]).await.unwrap();
    c1.delete(&[i1]).await.unwrap();
    c2.create(&[&doc(&j1)]).await.unwrap();

    let seen = listener.next().await.unwrap();
    assert_eq!(seen.collection, "C1");
    assert_eq!(seen.kind, EventKind::Save);
    assert_eq!(seen.instance, i1);
    assert!(listener.try_next().is_none());
}

fn open_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {"_id": {"type": "string"}},
        "required": ["_id"],
    })
}

#[tokio::test]
async fn two_peers_converge_to_byte_equal_state() {
    // invariant 6: same read key, same bytes after quiescence
    let network = MemNetwork::new();
    let (p1, _) = spawn_node(&network).await;
    let (p2, _) = spawn_node(&network).await;

    let db1 = p1.manager().new_db().await.unwrap();
    let people1 = db1.new_collection(person_collection()).unwrap();
    let addr = p1.net().thread_addr(db1.thread()).unwrap();
    let key = p1.net().get_thread(db1.thread()).unwrap().key;
    let db2 = p2.manager().new_db_from_addr(&addr, key).await.unwrap();
    let people2 = db2.new_collection(person_collection()).unwrap();

    let mut ids = Vec::new();
    for n in 0..4 {
        let id = InstanceId::new_random();
        let doc = serde_json::to_vec(&json!({"_id": id.to_string(), "name": format!("p{n}")}))
            .unwrap();
        people1.create(&[&doc]).await.unwrap();
        ids.push(id);
    }
    // writes from the joining side replicate back too
    let id_from_p2 = InstanceId::new_random();
    settle().await;
    let doc = serde_json::to_vec(&json!({"_id": id_from_p2.to_string(), "name": "q"})).unwrap();
    people2.create(&[&doc]).await.unwrap();
    ids.push(id_from_p2);
    settle().await;
    settle().await;

    for id in &ids {
        let on_p1 = people1.find_by_id(id).await.expect("present on p1");
        let on_p2 = people2.find_by_id(id).await.expect("present on p2");
        assert_eq!(on_p1, on_p2, "byte-equal instances for {id}");
    }
}
