//! RPC tests: exactly-once resolution, replies, dispatch over real sessions

mod common;

use common::{init_tracing, registry, tcp_pair, Msg, WAIT};
use dnet::rpc::{Client, Dispatcher, RpcChannel, Server, SessionChannel, DEFAULT_RPC_TIMEOUT};
use dnet::{
    DnetError, Request, Response, RpcCodec, Session, SessionConfig, StateError, StreamSession,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Records everything sent through it.
#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<Request<Msg>>>,
    responses: Mutex<Vec<Response<Msg>>>,
    broken: bool,
}

impl Recorder {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }
}

impl RpcChannel<Msg> for Recorder {
    fn send_request(&self, req: Request<Msg>) -> dnet::Result<()> {
        if self.broken {
            return Err(DnetError::state(StateError::Closed));
        }
        self.requests.lock().push(req);
        Ok(())
    }

    fn send_response(&self, resp: Response<Msg>) -> dnet::Result<()> {
        self.responses.lock().push(resp);
        Ok(())
    }
}

fn counting_callback(
    calls: &Arc<AtomicUsize>,
) -> (
    impl FnOnce(dnet::Result<Msg>) + Send + 'static,
    mpsc::UnboundedReceiver<dnet::Result<Msg>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let calls = Arc::clone(calls);
    let callback = move |result: dnet::Result<Msg>| {
        calls.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(result);
    };
    (callback, rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_response_beats_timeout() {
    let client = Client::from_current().unwrap();
    let channel = Recorder::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let (callback, mut rx) = counting_callback(&calls);

    let seq_no = client
        .call(&channel, "double", Msg::Num(2), Duration::from_millis(100), callback)
        .unwrap();
    assert_eq!(client.pending_count(), 1);

    let sent = channel.requests.lock()[0].clone();
    assert_eq!(sent.seq_no, seq_no);
    assert_eq!(sent.method, "double");
    assert!(sent.need_resp);

    assert!(client.on_response(Response::ok(seq_no, Msg::Num(4))));
    assert_eq!(rx.recv().await.unwrap().unwrap(), Msg::Num(4));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_beats_late_response() {
    let client = Client::from_current().unwrap();
    let channel = Recorder::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let (callback, mut rx) = counting_callback(&calls);

    let seq_no = client
        .call(&channel, "double", Msg::Num(2), Duration::from_millis(50), callback)
        .unwrap();

    let err = rx.recv().await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(err, DnetError::Timeout { timeout_ms: 50 }));

    assert!(!client.on_response(Response::ok(seq_no, Msg::Num(4))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_response_resolves_as_rpc_error() {
    let client = Client::from_current().unwrap();
    let channel = Recorder::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let (callback, mut rx) = counting_callback(&calls);

    let seq_no = client
        .call(&channel, "echo", Msg::Text("hi".into()), Duration::ZERO, callback)
        .unwrap();
    let remaining = client.remaining(seq_no).unwrap();
    assert!(remaining > DEFAULT_RPC_TIMEOUT - Duration::from_secs(1));

    assert!(client.on_response(Response::error(seq_no, "no such thing")));
    match rx.recv().await.unwrap() {
        Err(DnetError::Rpc { message }) => assert_eq!(message, "no such thing"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_send_leaves_nothing_pending() {
    let client = Client::from_current().unwrap();
    let channel = Recorder::broken();
    let calls = Arc::new(AtomicUsize::new(0));
    let (callback, _rx) = counting_callback(&calls);

    let result = client.call(
        &channel,
        "echo",
        Msg::Text("x".into()),
        Duration::from_millis(50),
        callback,
    );
    assert!(result.unwrap_err().is_closed());
    assert_eq!(client.pending_count(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_and_sequence_numbers() {
    let client = Client::from_current().unwrap();
    let channel = Recorder::default();

    let first = client.post(&channel, "silent", Msg::Text("a".into())).unwrap();
    let second = client.post(&channel, "silent", Msg::Text("b".into())).unwrap();
    assert!(second > first);
    assert_eq!(client.pending_count(), 0);

    let requests = channel.requests.lock();
    assert!(requests.iter().all(|r| !r.need_resp));
    assert_eq!(requests[1].payload, Msg::Text("b".into()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_future() {
    let client = Arc::new(Client::from_current().unwrap());
    let channel = Recorder::default();

    let pending = client
        .call_future(&channel, "double", Msg::Num(5), Duration::from_secs(1))
        .unwrap();
    let seq_no = channel.requests.lock()[0].seq_no;
    assert!(client.on_response(Response::ok(seq_no, Msg::Num(10))));
    assert_eq!(pending.await.unwrap(), Msg::Num(10));

    let expired = client
        .call_future(&channel, "double", Msg::Num(5), Duration::from_millis(30))
        .unwrap();
    assert!(expired.await.unwrap_err().is_timeout());
}

fn request(seq_no: u64, method: &str, payload: Msg, need_resp: bool) -> Request<Msg> {
    Request {
        seq_no,
        method: method.to_string(),
        payload,
        need_resp,
    }
}

fn test_server() -> Server<Msg> {
    let server: Server<Msg> = Server::new();
    server.register("echo", |replier, payload| {
        replier.reply(payload).unwrap();
    });
    server.register("boom", |_, _| panic!("handler exploded"));
    server.register("silent", |replier, payload| {
        replier.reply(payload).unwrap();
    });
    server.register("twice", |replier, payload| {
        replier.reply(payload.clone()).unwrap();
        let again = replier.clone().reply(payload);
        assert!(matches!(
            again,
            Err(DnetError::State {
                kind: StateError::RepeatedReply
            })
        ));
    });
    server
}

#[test]
fn test_server_replies() {
    let server = test_server();
    let recorder = Arc::new(Recorder::default());
    let channel: Arc<dyn RpcChannel<Msg>> = recorder.clone();

    server
        .on_request(channel.clone(), request(1, "echo", Msg::Text("ping".into()), true))
        .unwrap();
    server
        .on_request(channel.clone(), request(2, "twice", Msg::Num(9), true))
        .unwrap();
    server
        .on_request(channel, request(3, "silent", Msg::Text("quiet".into()), false))
        .unwrap();

    let responses = recorder.responses.lock();
    assert_eq!(
        *responses,
        vec![
            Response::ok(1, Msg::Text("ping".into())),
            Response::ok(2, Msg::Num(9)),
        ]
    );
}

#[test]
fn test_unknown_method_answered_with_error() {
    let server = test_server();
    let recorder = Arc::new(Recorder::default());

    let err = server
        .on_request(recorder.clone(), request(7, "missing", Msg::Text("?".into()), true))
        .unwrap_err();
    assert!(matches!(err, DnetError::Rpc { .. }));

    let responses = recorder.responses.lock();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].seq_no, 7);
    assert_eq!(
        responses[0].result,
        Err("unknown rpc method: missing".to_string())
    );
}

#[test]
fn test_panicking_handler_answered_with_error() {
    init_tracing();
    let server = test_server();
    let recorder = Arc::new(Recorder::default());

    let err = server
        .on_request(recorder.clone(), request(8, "boom", Msg::Text("!".into()), true))
        .unwrap_err();
    assert!(err.to_string().contains("handler exploded"));

    let responses = recorder.responses.lock();
    assert_eq!(responses.len(), 1);
    let message = responses[0].result.clone().unwrap_err();
    assert!(message.contains("panicked"));
}

#[test]
fn test_registration_errors() {
    let server: Server<Msg> = Server::new();
    server.try_register("echo", |_, _| {}).unwrap();
    assert!(server.has_method("echo"));
    assert!(matches!(
        server.try_register("echo", |_, _| {}),
        Err(DnetError::Config { .. })
    ));
    assert!(server.try_register("", |_, _| {}).is_err());
}

#[test]
#[should_panic(expected = "registered twice")]
fn test_register_duplicate_panics() {
    let server: Server<Msg> = Server::new();
    server.register("echo", |_, _| {});
    server.register("echo", |_, _| {});
}

type RpcSession = StreamSession<RpcCodec<Msg>>;

/// Start `session` with a dispatcher wired to its own channel.
fn serve(session: &Arc<RpcSession>, server: Arc<Server<Msg>>) -> Arc<Client<Msg>> {
    let client = Arc::new(Client::from_current().unwrap());
    let channel: Arc<dyn RpcChannel<Msg>> = Arc::new(SessionChannel::new(session));
    let dispatcher = Dispatcher::new(Arc::clone(&client), server, channel);
    session
        .start(move |msg| {
            if let Ok(msg) = msg {
                dispatcher.dispatch(msg);
            }
        })
        .unwrap();
    client
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_over_sessions() {
    init_tracing();
    let (a, b) = tcp_pair();
    let codec = RpcCodec::new(registry());
    let caller = Arc::new(RpcSession::with_codec(a, codec.clone(), SessionConfig::new()).unwrap());
    let callee = Arc::new(RpcSession::with_codec(b, codec, SessionConfig::new()).unwrap());

    let handlers = Arc::new(Server::new());
    handlers.register("double", |replier, payload| match payload {
        Msg::Num(n) => replier.reply(Msg::Num(n * 2)).unwrap(),
        other => replier.reply_error(format!("not a number: {other:?}")).unwrap(),
    });
    let _callee_client = serve(&callee, handlers);
    let client = serve(&caller, Arc::new(Server::new()));
    let channel = SessionChannel::new(&caller);

    let doubled = client
        .call_future(&channel, "double", Msg::Num(21), WAIT)
        .unwrap();
    assert_eq!(doubled.await.unwrap(), Msg::Num(42));

    let missing = client
        .call_future(&channel, "missing", Msg::Text("x".into()), WAIT)
        .unwrap();
    match missing.await {
        Err(DnetError::Rpc { message }) => assert!(message.contains("missing")),
        other => panic!("unexpected result: {other:?}"),
    }

    caller.close("test done");
    callee.close("test done");
}
