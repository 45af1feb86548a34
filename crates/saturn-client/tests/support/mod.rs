// Shared helpers for saturn-client integration tests.
//
// `TestProvider` is a minimal provider speaking the wire protocol over
// loopback TCP, answering JSON-encoded calls through a handler closure.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use saturn_client::ClientRuntime;
use saturn_common::{
    Address, FrameDecoder, JsonSerializer, Message, MethodCall, ResponseFrame, ResultWrapper,
    Serializer, Status,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// What the provider does with one request.
pub enum Reply {
    Value(Value),
    Biz(String),
    Status(Status, String),
    /// Never answer.
    Silent,
}

pub type Handler = Arc<dyn Fn(&MethodCall) -> Reply + Send + Sync>;

pub struct TestProvider {
    address: Address,
    handler: Handler,
    requests: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TestProvider {
    /// Start a provider on a free loopback port.
    pub async fn start(handler: impl Fn(&MethodCall) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        let provider = Arc::new(Self {
            address,
            handler: Arc::new(handler),
            requests: Arc::new(AtomicUsize::new(0)),
            task: Mutex::new(None),
        });
        provider.serve(listener);
        provider
    }

    /// Provider answering every call with its first argument.
    pub async fn echo() -> Arc<Self> {
        Self::start(|call| Reply::Value(call.args.first().cloned().unwrap_or(Value::Null))).await
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Stop accepting and drop every open connection.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Listen again on the same port.
    pub async fn restart(&self) {
        self.stop();
        let listener = TcpListener::bind(self.address.to_string()).await.unwrap();
        self.serve(listener);
    }

    fn serve(&self, listener: TcpListener) {
        let handler = self.handler.clone();
        let requests = self.requests.clone();
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                connections.spawn(serve_connection(stream, handler.clone(), requests.clone()));
            }
        });
        *self.task.lock() = Some(task);
    }
}

impl Drop for TestProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Handler, requests: Arc<AtomicUsize>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Ok(messages) = decoder.push(&buf[..n]) else { return };

        for message in messages {
            let Message::Request(request) = message else { continue };
            requests.fetch_add(1, Ordering::SeqCst);

            let call = JsonSerializer.decode_call(&request.body).unwrap();
            let (status, wrapper) = match handler(&call) {
                Reply::Value(value) => (Status::Ok, ResultWrapper::ok(value)),
                Reply::Biz(message) => (Status::ServiceExpectedError, ResultWrapper::err(message)),
                Reply::Status(status, message) => (status, ResultWrapper::err(message)),
                Reply::Silent => continue,
            };
            let body = JsonSerializer.encode_result(&wrapper).unwrap();
            let response = Message::Response(ResponseFrame::new(
                request.invoke_id,
                JsonSerializer::CODE,
                status,
                body,
            ));
            if stream.write_all(&response.encode()).await.is_err() {
                return;
            }
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `check` holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the runtime has a live channel to each of `addresses`.
pub async fn wait_connected(runtime: &ClientRuntime, addresses: &[Address]) {
    let connected = eventually(Duration::from_secs(5), || {
        addresses.iter().all(|a| {
            runtime
                .connector()
                .get(a)
                .map(|g| g.is_available())
                .unwrap_or(false)
        })
    })
    .await;
    assert!(connected, "providers never became available");
}

/// A loopback port nothing listens on.
pub async fn unused_address() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    Address::from(listener.local_addr().unwrap())
}
