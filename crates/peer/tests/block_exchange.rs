use bytes::Bytes;
use futures::StreamExt;
use libp2p::{identity::Keypair, Multiaddr};
use retrieval_peer::{
    p2p::{build_swarm, Libp2pTransport},
    store::{content_id, BlockStore},
    transport::{AddFile, Transport},
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

struct Node {
    transport: Libp2pTransport,
    id: String,
    address: Multiaddr,
    store: Arc<BlockStore>,
    _dir: TempDir,
}

async fn start_node(keypair: &Keypair, listen: &str, rendezvous: Vec<Multiaddr>) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path().join("blocks"), 1).unwrap());
    start_node_in(dir, store, keypair, listen, rendezvous).await
}

async fn start_node_in(
    dir: TempDir,
    store: Arc<BlockStore>,
    keypair: &Keypair,
    listen: &str,
    rendezvous: Vec<Multiaddr>,
) -> Node {
    let swarm = build_swarm(keypair, false).unwrap();
    let transport = Libp2pTransport::start(
        swarm,
        store.clone(),
        &[listen.parse().unwrap()],
        rendezvous,
        Vec::new(),
    )
    .await
    .unwrap();
    let info = transport.id().await.unwrap();
    Node {
        transport,
        id: info.id,
        address: info.addresses[0].parse().unwrap(),
        store,
        _dir: dir,
    }
}

async fn provider() -> Node {
    start_node(&Keypair::generate_ed25519(), "/ip4/127.0.0.1/tcp/0", Vec::new()).await
}

async fn fetcher_of(provider: &Node) -> Node {
    start_node(
        &Keypair::generate_ed25519(),
        "/ip4/127.0.0.1/tcp/0",
        vec![provider.address.clone()],
    )
    .await
}

async fn add(node: &Node, name: &str, data: &'static [u8]) -> String {
    let content = futures::stream::iter(vec![Ok(Bytes::from_static(data))]).boxed();
    node.transport
        .add(
            AddFile {
                path: name.into(),
                content,
            },
            Box::new(|_| {}),
        )
        .await
        .unwrap()
}

async fn wait_for_peer(node: &Node, peer_id: &str) {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let peers = node.transport.swarm_peers().await.unwrap();
            if peers.iter().any(|p| p.peer == peer_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{peer_id} never connected"));
}

async fn wait_until_disconnected(node: &Node) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !node.transport.swarm_peers().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("connection never closed");
}

#[tokio::test]
async fn pin_fetches_the_block_from_a_connected_peer() {
    let a = provider().await;
    let cid = add(&a, "song.flac", b"la la la").await;
    let b = fetcher_of(&a).await;
    wait_for_peer(&b, &a.id).await;

    b.transport.pin_add(&cid).await.unwrap();

    assert_eq!(b.transport.pin_ls().await.unwrap(), vec![cid.clone()]);
    let entries: Vec<_> = b.transport.get(&cid).await.unwrap().collect().await;
    let file = entries
        .into_iter()
        .map(Result::unwrap)
        .find(|entry| entry.content.is_some())
        .unwrap();
    assert_eq!(file.path, format!("{cid}/song.flac"));
    let mut content = file.content.unwrap();
    let mut data = Vec::new();
    while let Some(chunk) = content.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(data, b"la la la");

    b.transport.stop().await.unwrap();
    a.transport.stop().await.unwrap();
}

#[tokio::test]
async fn block_that_does_not_match_its_cid_is_rejected() {
    let a = provider().await;
    let forged = content_id("real.txt", b"the real bytes");
    assert!(a
        .store
        .save_block(&forged, "real.txt", b"something else entirely")
        .unwrap());
    let b = fetcher_of(&a).await;
    wait_for_peer(&b, &a.id).await;

    let err = b.transport.pin_add(&forged).await.unwrap_err();

    assert!(err.to_string().contains("no connected peer could provide"));
    assert!(b.transport.pin_ls().await.unwrap().is_empty());
    assert!(b.store.retrieve_block(&forged).unwrap().is_none());

    b.transport.stop().await.unwrap();
    a.transport.stop().await.unwrap();
}

#[tokio::test]
async fn pin_right_after_start_waits_for_the_dial() {
    let a = provider().await;
    let cid = add(&a, "early.txt", b"first in line").await;

    let b = fetcher_of(&a).await;
    b.transport.pin_add(&cid).await.unwrap();

    assert_eq!(b.transport.pin_ls().await.unwrap(), vec![cid]);
    b.transport.stop().await.unwrap();
    a.transport.stop().await.unwrap();
}

#[tokio::test]
async fn rendezvous_node_is_redialed_after_it_restarts() {
    let keypair = Keypair::generate_ed25519();
    let a = start_node(&keypair, "/ip4/127.0.0.1/tcp/0", Vec::new()).await;
    let b = fetcher_of(&a).await;
    wait_for_peer(&b, &a.id).await;

    let listen = a.address.to_string();
    let listen = listen.split("/p2p/").next().unwrap().to_string();
    let Node {
        transport,
        _dir: dir,
        ..
    } = a;
    transport.stop().await.unwrap();
    wait_until_disconnected(&b).await;

    let store = Arc::new(BlockStore::open(dir.path().join("blocks-restarted"), 1).unwrap());
    let restarted = start_node_in(dir, store, &keypair, &listen, Vec::new()).await;
    wait_for_peer(&b, &restarted.id).await;

    b.transport.stop().await.unwrap();
    restarted.transport.stop().await.unwrap();
}
