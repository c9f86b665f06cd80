use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use xapi_sdk::{
    AccountType, ChannelKey, ConnectionState, SessionConfig, SessionEvent, SessionMode,
    StreamChannel, XapiClient, XapiError,
};

const TEST_USER_ID: &str = "1000";
const TEST_PASSWORD: &str = "correct-horse";
const TEST_STREAM_SESSION_ID: &str = "8469308861804289383";
const TEST_SERVER_TIME: i64 = 1_700_000_000_000;

#[derive(Clone, Default)]
struct ServiceState {
    command_log: Arc<Mutex<Vec<Value>>>,
    stream_log: Arc<Mutex<Vec<Value>>>,
    stream_done: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

fn client_for(addr: SocketAddr) -> XapiClient {
    XapiClient::new(AccountType::Demo)
        .with_endpoint(SessionMode::Command, format!("ws://{addr}/demo"))
        .with_endpoint(SessionMode::Streaming, format!("ws://{addr}/demoStream"))
        .with_config(
            SessionConfig::default()
                .with_send_interval(Duration::from_millis(20))
                .with_call_timeout(Duration::from_secs(2)),
        )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_session_correlates_replies_against_mock_service() {
    let state = ServiceState::default();
    let app = Router::new()
        .route("/demo", get(command_handler))
        .with_state(state.clone());
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let session = client_for(addr)
        .connect_command()
        .await
        .expect("connect command session to mock service");
    assert_eq!(session.state(), ConnectionState::Open);
    assert!(session.is_healthy());

    let time = timeout(Duration::from_secs(2), session.get_server_time())
        .await
        .expect("timed out waiting for getServerTime")
        .expect("getServerTime");
    assert_eq!(time, TEST_SERVER_TIME);

    // The service answers `slow` only after `fast` arrived, and answers `fast`
    // first.
    let (slow, fast) = tokio::join!(
        session.call("slow", Some(json!({"n": 1}))),
        session.call("fast", Some(json!({"n": 2})))
    );
    assert_eq!(slow.expect("slow reply"), json!({"n": 1}));
    assert_eq!(fast.expect("fast reply"), json!({"n": 2}));

    let password = SecretString::new("wrong".to_string());
    match session.login(TEST_USER_ID, &password, None).await {
        Err(XapiError::Remote { code, description }) => {
            assert_eq!(code, "BE005");
            assert_eq!(description, "userPasswordCheck: Invalid login or password");
        }
        other => panic!("expected remote login failure, got {other:?}"),
    }
    assert_eq!(session.pending_requests(), 0);

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Closed);

    let log = state.command_log.lock().await.clone();
    assert!(
        log.iter()
            .any(|frame| frame["command"] == "ping" && frame.get("customTag").is_none()),
        "expected an uncorrelated keepalive ping"
    );
    let tags: Vec<&str> = log
        .iter()
        .filter_map(|frame| frame["customTag"].as_str())
        .collect();
    let mut unique = tags.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(tags.len(), unique.len(), "customTag values must not repeat");

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock service task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_session_routes_pushes_to_channel_listeners() {
    let (done_tx, done_rx) = oneshot::channel();
    let state = ServiceState {
        stream_done: Arc::new(Mutex::new(Some(done_tx))),
        ..ServiceState::default()
    };
    let app = Router::new()
        .route("/demo", get(command_handler))
        .route("/demoStream", get(stream_handler))
        .with_state(state.clone());
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;
    let client = client_for(addr);

    let command = client.connect_command().await.expect("command session");
    let password = SecretString::new(TEST_PASSWORD.to_string());
    let stream_session_id = command
        .login(TEST_USER_ID, &password, Some("harness"))
        .await
        .expect("login");

    let stream = client
        .connect_stream_with(stream_session_id)
        .await
        .expect("streaming session");
    let mut lifecycle = stream.events();
    assert_eq!(
        lifecycle.recv().await.expect("open event"),
        SessionEvent::Open
    );

    let eurusd_key = ChannelKey::tick_prices("EURUSD");
    let mut eurusd = stream.listen(eurusd_key.clone());
    let mut keepalive = stream.listen(ChannelKey::new(StreamChannel::KeepAlive));

    stream
        .subscribe_tick_prices("EURUSD", Some(1), None)
        .await
        .expect("subscribe tick prices");
    stream
        .subscribe(&ChannelKey::new(StreamChannel::KeepAlive), Default::default())
        .await
        .expect("subscribe keepalive");

    let tick = timeout(Duration::from_secs(2), eurusd.recv())
        .await
        .expect("timed out waiting for tick")
        .expect("tick event");
    assert_eq!(tick.name(), "tickPrices");
    assert_eq!(tick.data["symbol"], "EURUSD");
    assert_eq!(tick.data["ask"], 1.1);

    let alive = timeout(Duration::from_secs(2), keepalive.recv())
        .await
        .expect("timed out waiting for keepalive push")
        .expect("keepalive event");
    assert_eq!(alive.name(), "keepAliveFromServer");

    // The GBPUSD tick and the unknown push never reach the EURUSD listener.
    assert!(eurusd.try_recv().is_none());
    assert_eq!(
        stream.active_channels(),
        vec![ChannelKey::new(StreamChannel::KeepAlive), eurusd_key.clone()]
    );

    stream.unsubscribe(&eurusd_key).await.expect("unsubscribe");
    timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("timed out waiting for stream service")
        .expect("stream service observation channel closed");
    assert_eq!(
        timeout(Duration::from_secs(2), lifecycle.recv())
            .await
            .expect("timed out waiting for close event")
            .expect("close event"),
        SessionEvent::Close
    );
    assert_eq!(stream.state(), ConnectionState::Closed);

    let stream_log = state.stream_log.lock().await.clone();
    for frame in &stream_log {
        assert_eq!(frame["streamSessionId"], TEST_STREAM_SESSION_ID);
    }
    let commands: Vec<&str> = stream_log
        .iter()
        .filter_map(|frame| frame["command"].as_str())
        .filter(|command| *command != "ping")
        .collect();
    assert_eq!(commands, vec!["getTickPrices", "getKeepAlive", "stopTickPrices"]);

    command.close().await;
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock service task should join");
}

async fn command_handler(
    State(state): State<ServiceState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let _ = run_command_service(socket, state).await;
    })
}

async fn run_command_service(mut socket: WebSocket, state: ServiceState) -> Result<(), String> {
    let mut held_slow: Option<Value> = None;

    while let Some(frame) = recv_client_frame(&mut socket).await? {
        state.command_log.lock().await.push(frame.clone());
        let Some(tag) = frame.get("customTag").cloned() else {
            continue;
        };

        match frame["command"].as_str() {
            Some("getServerTime") => {
                send_service_frame(
                    &mut socket,
                    json!({
                        "status": true,
                        "returnData": {"time": TEST_SERVER_TIME, "timeString": "Nov 14, 2023"},
                        "customTag": tag
                    }),
                )
                .await?;
            }
            Some("login") => {
                let reply = if frame["arguments"]["password"] == TEST_PASSWORD {
                    json!({
                        "status": true,
                        "streamSessionId": TEST_STREAM_SESSION_ID,
                        "customTag": tag
                    })
                } else {
                    json!({
                        "status": false,
                        "errorCode": "BE005",
                        "errorDescr": "userPasswordCheck: Invalid login or password",
                        "customTag": tag
                    })
                };
                send_service_frame(&mut socket, reply).await?;
            }
            Some("slow") => held_slow = Some(frame),
            Some("fast") => {
                send_service_frame(&mut socket, echo_reply(&frame)).await?;
                if let Some(slow) = held_slow.take() {
                    send_service_frame(&mut socket, echo_reply(&slow)).await?;
                }
            }
            _ => {
                send_service_frame(
                    &mut socket,
                    json!({"status": true, "returnData": null, "customTag": tag}),
                )
                .await?;
            }
        }
    }
    Ok(())
}

fn echo_reply(frame: &Value) -> Value {
    json!({
        "status": true,
        "returnData": frame["arguments"].clone(),
        "customTag": frame["customTag"].clone()
    })
}

async fn stream_handler(
    State(state): State<ServiceState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let _ = run_stream_service(socket, &state).await;
        if let Some(done) = state.stream_done.lock().await.take() {
            let _ = done.send(());
        }
    })
}

async fn run_stream_service(mut socket: WebSocket, state: &ServiceState) -> Result<(), String> {
    while let Some(frame) = recv_client_frame(&mut socket).await? {
        state.stream_log.lock().await.push(frame.clone());

        match frame["command"].as_str() {
            Some("getTickPrices") => {
                let symbol = frame["symbol"].clone();
                send_service_frame(
                    &mut socket,
                    json!({"command": "tickPrices", "data": {"symbol": "GBPUSD", "ask": 1.27}}),
                )
                .await?;
                send_service_frame(
                    &mut socket,
                    json!({"command": "mystery", "data": {}}),
                )
                .await?;
                send_service_frame(
                    &mut socket,
                    json!({"command": "tickPrices", "data": {"symbol": symbol, "ask": 1.1, "bid": 1.09}}),
                )
                .await?;
            }
            Some("getKeepAlive") => {
                send_service_frame(
                    &mut socket,
                    json!({"command": "keepAlive", "data": {"timestamp": TEST_SERVER_TIME}}),
                )
                .await?;
            }
            Some("stopTickPrices") => {
                socket
                    .send(Message::Close(None))
                    .await
                    .map_err(|err| format!("failed to send close: {err}"))?;
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn recv_client_frame(socket: &mut WebSocket) -> Result<Option<Value>, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
        }
    }
}

async fn send_service_frame(socket: &mut WebSocket, frame: Value) -> Result<(), String> {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .map_err(|err| format!("failed to send service frame: {err}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock service listener");
    let addr = listener
        .local_addr()
        .expect("read mock service listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock service should run");
    });
    (addr, shutdown_tx, task)
}
