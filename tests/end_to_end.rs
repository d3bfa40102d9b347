//! End-to-end tests over real TCP connections.

use bytes::BytesMut;
use cachewire::config::Config;
use cachewire::ledger::RequestStatus;
use cachewire::protocol::framing::{encode_legacy_request, encode_pipelined_request};
use cachewire::protocol::response::{decode_response, DecodedResponse, Reassembler};
use cachewire::protocol::token;
use cachewire::ConnectionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start(config: Config) -> (Arc<ConnectionManager>, SocketAddr) {
    let manager = ConnectionManager::with_local_cache(Config {
        listen: "127.0.0.1:0".to_string(),
        ..config
    });
    let listener = manager.bind().unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&manager).serve(listener));
    (manager, addr)
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, ack_id: Option<i64>, command: &str) {
        let mut request = BytesMut::new();
        encode_legacy_request(&mut request, ack_id, command.as_bytes());
        self.stream.write_all(&request).await.unwrap();
    }

    async fn send_pipelined(&mut self, commands: &[(Option<i64>, &str)]) {
        let commands: Vec<(Option<i64>, &[u8])> = commands
            .iter()
            .map(|(ack, cmd)| (*ack, cmd.as_bytes()))
            .collect();
        let mut request = BytesMut::new();
        encode_pipelined_request(&mut request, &commands);
        self.stream.write_all(&request).await.unwrap();
    }

    async fn recv(&mut self) -> DecodedResponse {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some((resp, used)) = decode_response(&self.buf).unwrap() {
                    self.buf.drain(..used);
                    return resp;
                }
                let mut chunk = [0u8; 8192];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed the connection");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for a response")
    }

    /// Wait for the server to close the connection.
    async fn closed(&mut self) {
        let mut chunk = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
            .await
            .expect("connection still open")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn test_add_returns_stored() {
    let (_manager, addr) = start(Config::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "INIT client=app-1 version=4122\r\n").await;
    let resp = client.recv().await;
    assert_eq!(resp.token, token::OK);
    assert_eq!(&resp.data[..], b"ack=0 pipeline=0 fragment=0");

    client
        .send(None, "ADD key1 flags=0 exp=0 len=10\r\n0123456789")
        .await;
    let resp = client.recv().await;
    assert_eq!(resp.token, token::STORED);
    assert!(resp.data.is_empty());

    client.send(None, "GET key1\r\n").await;
    let resp = client.recv().await;
    assert_eq!(resp.token, token::VALUE);
    assert_eq!(&resp.data[..], b"0 0123456789");
}

#[tokio::test]
async fn test_pipelined_requests_with_acknowledgment() {
    let (_manager, addr) = start(Config::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "INIT client=app-2 ack=1 pipeline=1\r\n").await;
    assert_eq!(&client.recv().await.data[..], b"ack=1 pipeline=1 fragment=0");

    client
        .send_pipelined(&[
            (Some(-1), "INSERT a rid=1 cid=1 len=1\r\n1"),
            (Some(-1), "INSERT b rid=1 cid=2 len=2\r\n22"),
            (Some(-1), "CONTAINS a\r\n"),
        ])
        .await;
    assert_eq!(client.recv().await.token, token::STORED);
    assert_eq!(client.recv().await.token, token::STORED);
    let resp = client.recv().await;
    assert_eq!(resp.token, token::OK);
    assert_eq!(&resp.data[..], b"1");

    client
        .send_pipelined(&[(Some(-1), "COUNT\r\n"), (Some(-1), "PING\r\n")])
        .await;
    assert_eq!(&client.recv().await.data[..], b"2");
    assert_eq!(client.recv().await.token, token::PONG);
}

#[tokio::test]
async fn test_retry_after_reconnect_is_not_reapplied() {
    let (manager, addr) = start(Config::default()).await;

    let mut first = Client::connect(addr).await;
    first.send(None, "INIT client=app-3 ack=1\r\n").await;
    first.recv().await;
    first.send(Some(-1), "INSERT k rid=77 len=3\r\none").await;
    assert_eq!(first.recv().await.token, token::STORED);
    drop(first);

    let mut second = Client::connect(addr).await;
    second.send(None, "INIT client=app-3 ack=1\r\n").await;
    second.recv().await;

    second.send(Some(-1), "REQUEST_STATUS 77 0\r\n").await;
    let resp = second.recv().await;
    assert_eq!(resp.token, token::STATUS);
    assert_eq!(&resp.data[..], b"RECEIVED_AND_EXECUTED");

    // The retry gets the recorded response without executing again.
    second.send(Some(-1), "INSERT k rid=77 len=3\r\ntwo").await;
    assert_eq!(second.recv().await.token, token::STORED);
    second.send(Some(-1), "GET k\r\n").await;
    assert_eq!(&second.recv().await.data[..], b"0 one");

    // Acknowledging the request drops it from the ledger.
    second.send(Some(77), "PING\r\n").await;
    second.recv().await;
    assert_eq!(
        manager.request_status("app-3", 77, 0),
        RequestStatus::NotReceived
    );
}

#[tokio::test]
async fn test_pipelined_writes_without_request_ids_are_not_replayed() {
    let (_manager, addr) = start(Config::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "INIT client=app-9 ack=1 pipeline=1\r\n").await;
    client.recv().await;

    client
        .send_pipelined(&[
            (Some(-1), "INSERT a len=1\r\n1"),
            (Some(-1), "INSERT b len=1\r\n2"),
        ])
        .await;
    assert_eq!(client.recv().await.token, token::ERROR);
    assert_eq!(client.recv().await.token, token::ERROR);

    client
        .send_pipelined(&[
            (Some(-1), "INSERT a rid=1 cid=1 len=1\r\n1"),
            (Some(-1), "INSERT b rid=1 cid=2 len=1\r\n2"),
            (Some(-1), "CONTAINS_BULK a b\r\n"),
            (Some(-1), "COUNT\r\n"),
        ])
        .await;
    assert_eq!(client.recv().await.token, token::STORED);
    assert_eq!(client.recv().await.token, token::STORED);
    client.recv().await;
    assert_eq!(&client.recv().await.data[..], b"2");
}

#[tokio::test]
async fn test_new_write_after_reconnect_executes() {
    let (manager, addr) = start(Config::default()).await;

    let mut first = Client::connect(addr).await;
    first.send(None, "INIT client=app-10 ack=1\r\n").await;
    first.recv().await;
    first.send(Some(-1), "INSERT a rid=1 len=1\r\n1").await;
    assert_eq!(first.recv().await.token, token::STORED);
    drop(first);

    let mut second = Client::connect(addr).await;
    second.send(None, "INIT client=app-10 ack=1\r\n").await;
    second.recv().await;

    // The first frame on the new connection carries the same sequence
    // number as the recorded write; it must not be answered from the ledger.
    second.send(Some(-1), "INSERT b len=1\r\n2").await;
    assert_eq!(second.recv().await.token, token::ERROR);

    second.send(Some(-1), "INSERT b rid=2 len=1\r\n2").await;
    assert_eq!(second.recv().await.token, token::STORED);
    second.send(Some(-1), "CONTAINS b\r\n").await;
    assert_eq!(&second.recv().await.data[..], b"1");
    second.send(Some(-1), "COUNT\r\n").await;
    assert_eq!(&second.recv().await.data[..], b"2");
    assert_eq!(
        manager.request_status("app-10", 2, 0),
        RequestStatus::ReceivedAndExecuted
    );
}

#[tokio::test]
async fn test_large_responses_are_fragmented() {
    let config = Config {
        fragment_size: 1024,
        ..Config::default()
    };
    let (_manager, addr) = start(config).await;
    let mut client = Client::connect(addr).await;

    client
        .send(None, "INIT client=app-4 version=4122 fragment=1\r\n")
        .await;
    assert_eq!(&client.recv().await.data[..], b"ack=0 pipeline=0 fragment=1");

    let value = "v".repeat(5000);
    client
        .send(None, &format!("INSERT big len={}\r\n{value}", value.len()))
        .await;
    assert_eq!(client.recv().await.token, token::STORED);

    client.send(None, "GET big\r\n").await;
    let mut reassembler = Reassembler::new();
    let mut fragments = 0;
    let full = loop {
        let resp = client.recv().await;
        assert_eq!(resp.token, token::FRAGMENT);
        fragments += 1;
        if let Some(full) = reassembler.push(&resp.data).unwrap() {
            break full;
        }
    };
    assert!(fragments > 1);

    let (resp, used) = decode_response(&full).unwrap().unwrap();
    assert_eq!(used, full.len());
    assert_eq!(resp.token, token::VALUE);
    assert_eq!(&resp.data[2..], value.as_bytes());

    // Small responses are not fragmented.
    client.send(None, "PING\r\n").await;
    assert_eq!(client.recv().await.token, token::PONG);
}

#[tokio::test]
async fn test_old_clients_do_not_get_fragments() {
    let config = Config {
        fragment_size: 1024,
        ..Config::default()
    };
    let (_manager, addr) = start(config).await;
    let mut client = Client::connect(addr).await;

    client
        .send(None, "INIT client=app-5 version=4121 fragment=1\r\n")
        .await;
    assert_eq!(&client.recv().await.data[..], b"ack=0 pipeline=0 fragment=0");

    let value = "w".repeat(3000);
    client
        .send(None, &format!("INSERT big len={}\r\n{value}", value.len()))
        .await;
    client.recv().await;
    client.send(None, "GET big\r\n").await;
    let resp = client.recv().await;
    assert_eq!(resp.token, token::VALUE);
    assert_eq!(resp.data.len(), 2 + value.len());
}

#[tokio::test]
async fn test_dispose_closes_and_purges_ledger() {
    let (manager, addr) = start(Config::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "INIT client=app-6 ack=1\r\n").await;
    client.recv().await;
    client.send(Some(-1), "REMOVE k rid=5\r\n").await;
    assert_eq!(client.recv().await.token, token::NOT_FOUND);
    assert_eq!(
        manager.request_status("app-6", 5, 0),
        RequestStatus::ReceivedAndExecuted
    );

    client.send(Some(-1), "DISPOSE\r\n").await;
    client.closed().await;

    for _ in 0..100 {
        if manager.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(
        manager.request_status("app-6", 5, 0),
        RequestStatus::NotReceived
    );
}

#[tokio::test]
async fn test_protocol_violation_closes_connection() {
    let (_manager, addr) = start(Config::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "INIT client=app-7\r\n").await;
    client.recv().await;

    // A legacy request whose length header is not a number.
    let mut request = vec![b' '; 20];
    request.extend_from_slice(b"not-a-len!");
    client.stream.write_all(&request).await.unwrap();
    client.closed().await;
}

#[tokio::test]
async fn test_commands_before_handshake_are_rejected() {
    let (_manager, addr) = start(Config::default()).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "GET_PRODUCT_VERSION\r\n").await;
    let resp = client.recv().await;
    assert_eq!(resp.token, token::OK);
    assert_eq!(&resp.data[..], env!("CARGO_PKG_VERSION").as_bytes());

    client.send(None, "COUNT\r\n").await;
    assert_eq!(client.recv().await.token, token::ERROR);
}

#[tokio::test]
async fn test_command_processor_pool_keeps_order() {
    let config = Config {
        command_processors: 4,
        ..Config::default()
    };
    let (_manager, addr) = start(config).await;
    let mut client = Client::connect(addr).await;

    client.send(None, "INIT client=app-8 pipeline=1\r\n").await;
    client.recv().await;

    let commands: Vec<String> = (0..20)
        .flat_map(|i| {
            let value = i.to_string();
            [
                format!("INSERT counter len={}\r\n{value}", value.len()),
                "GET counter\r\n".to_string(),
            ]
        })
        .collect();
    let framed: Vec<(Option<i64>, &str)> = commands.iter().map(|c| (None, c.as_str())).collect();
    client.send_pipelined(&framed).await;

    for i in 0..20 {
        assert_eq!(client.recv().await.token, token::STORED);
        let resp = client.recv().await;
        assert_eq!(resp.data, format!("0 {i}").into_bytes());
    }
}
