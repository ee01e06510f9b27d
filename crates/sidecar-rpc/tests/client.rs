use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sidecar_rpc::{
    BoxedReader, BoxedWriter, Connector, FrameDecoder, FramedWriter, MAX_FRAME_LEN, RpcClient,
    RpcClientConfig, RpcError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::oneshot;

/// Hands out pre-made in-memory streams, one per connect.
#[derive(Default)]
struct DuplexConnector {
    streams: Mutex<VecDeque<(BoxedReader, BoxedWriter)>>,
}

impl DuplexConnector {
    fn with_workers(count: usize) -> (Arc<Self>, Vec<FakeWorker>) {
        let connector = Arc::new(Self::default());
        let mut workers = Vec::new();
        for _ in 0..count {
            let (client_side, worker_side) = tokio::io::duplex(64 * 1024);
            let (client_read, client_write) = tokio::io::split(client_side);
            connector
                .streams
                .lock()
                .unwrap()
                .push_back((Box::new(client_read), Box::new(client_write)));
            workers.push(FakeWorker::new(worker_side));
        }
        (connector, workers)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    fn endpoint(&self) -> String {
        "duplex".to_string()
    }
}

struct FakeWorker {
    reader: ReadHalf<DuplexStream>,
    writer: FramedWriter<WriteHalf<DuplexStream>>,
    decoder: FrameDecoder,
}

impl FakeWorker {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: FramedWriter::new(writer),
            decoder: FrameDecoder::new(),
        }
    }

    async fn next_request(&mut self) -> Value {
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return serde_json::from_slice(&frame).unwrap();
            }
            let mut buf = [0u8; 4096];
            let read = self.reader.read(&mut buf).await.unwrap();
            assert!(read > 0, "client closed the stream");
            self.decoder.push(&buf[..read]);
        }
    }

    async fn reply(&mut self, response: Value) {
        self.writer
            .send(&serde_json::to_vec(&response).unwrap())
            .await
            .unwrap();
    }

    async fn reply_result(&mut self, id: &Value, result: Value) {
        self.reply(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }
}

fn client(connector: Arc<DuplexConnector>) -> RpcClient {
    RpcClient::new(connector, RpcClientConfig::default())
}

#[tokio::test]
async fn out_of_order_responses_reach_their_own_callers() {
    let (connector, mut workers) = DuplexConnector::with_workers(1);
    let client = client(connector);
    let mut worker = workers.remove(0);

    let mut calls = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.call(name, Some(json!({"name": name})), None).await
        }));
        tokio::task::yield_now().await;
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(worker.next_request().await);
    }
    assert!(requests.iter().all(|r| r["jsonrpc"] == "2.0"));

    for request in requests.iter().rev() {
        let echoed = request["params"]["name"].clone();
        worker.reply_result(&request["id"], echoed).await;
    }

    for (call, name) in calls.into_iter().zip(["alpha", "beta", "gamma"]) {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!(name));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn remote_error_is_surfaced_verbatim() {
    let (connector, mut workers) = DuplexConnector::with_workers(1);
    let client = client(connector);
    let mut worker = workers.remove(0);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("export_photo", None, None).await }
    });
    let request = worker.next_request().await;
    worker
        .reply(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32602, "message": "Invalid params: path outside whitelist"}
        }))
        .await;

    match call.await.unwrap() {
        Err(RpcError::Remote { code, message, .. }) => {
            assert_eq!(code, -32602);
            assert_eq!(message, "Invalid params: path outside whitelist");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn timed_out_request_ignores_late_reply() {
    let (connector, mut workers) = DuplexConnector::with_workers(1);
    let client = client(connector);
    let mut worker = workers.remove(0);
    let (late_tx, late_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let first = worker.next_request().await;
        late_rx.await.unwrap();
        worker.reply_result(&first["id"], json!("late")).await;
        let second = worker.next_request().await;
        worker.reply_result(&second["id"], json!("fresh")).await;
    });

    let err = client
        .call("slow", None, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
    assert_eq!(client.pending_requests(), 0);

    late_tx.send(()).unwrap();
    let fresh = client.call("fast", None, None).await.unwrap();
    assert_eq!(fresh, json!("fresh"));
    server.await.unwrap();
}

#[tokio::test]
async fn close_rejects_every_pending_request_then_reconnects() {
    let (connector, mut workers) = DuplexConnector::with_workers(2);
    let client = client(connector);
    let mut first = workers.remove(0);
    let mut second = workers.remove(0);

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call(&format!("m{i}"), None, None).await })
        })
        .collect();
    for _ in 0..3 {
        first.next_request().await;
    }
    assert_eq!(client.pending_requests(), 3);

    drop(first);

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_transport(), "unexpected error {err:?}");
    }
    assert_eq!(client.pending_requests(), 0);

    let again = tokio::spawn({
        let client = client.clone();
        async move { client.call("ping", None, None).await }
    });
    let request = second.next_request().await;
    second.reply_result(&request["id"], json!("pong")).await;
    assert_eq!(again.await.unwrap().unwrap(), json!("pong"));
}

#[tokio::test]
async fn oversized_reply_closes_connection() {
    let (connector, mut workers) = DuplexConnector::with_workers(1);
    let client = client(connector);
    let mut worker = workers.remove(0);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("ping", None, None).await }
    });
    worker.next_request().await;

    let mut raw_writer = worker.writer.into_inner();
    raw_writer
        .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
        .await
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_transport());
    assert!(!client.is_connected().await);
}

struct NeverConnects;

#[async_trait]
impl Connector for NeverConnects {
    async fn connect(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        std::future::pending().await
    }

    fn endpoint(&self) -> String {
        "blackhole".to_string()
    }
}

#[tokio::test(start_paused = true)]
async fn connect_attempt_is_bounded() {
    let client = RpcClient::new(
        Arc::new(NeverConnects),
        RpcClientConfig {
            connect_timeout: Duration::from_secs(5),
            ..RpcClientConfig::default()
        },
    );

    let err = client.call("ping", None, None).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectTimeout { .. }));
    assert!(!client.is_connected().await);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn short_call_does_not_wait_out_the_connect_window() {
    let client = RpcClient::new(Arc::new(NeverConnects), RpcClientConfig::default());

    let started = tokio::time::Instant::now();
    let err = client
        .call("ping", None, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectTimeout { timeout, .. } if timeout == Duration::from_secs(2)),
        "{err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn refused_connection_is_a_transport_error() {
    let (connector, _workers) = DuplexConnector::with_workers(0);
    let err = client(connector).call("ping", None, None).await.unwrap_err();
    assert!(matches!(err, RpcError::Connect { .. }));
    assert!(err.is_transport());
}
