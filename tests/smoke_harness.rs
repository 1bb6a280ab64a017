use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use syncano_sync::auth::{ApiKeyAuthenticator, Authenticator, UserLoginAuthenticator};
use syncano_sync::config::SyncOptions;
use syncano_sync::retry::RetryPolicy;
use syncano_sync::stream::client::WebSocketTransport;
use syncano_sync::stream::proto::{ClientMessage, SUBSCRIBE_COLLECTION};
use syncano_sync::stream::registry::SubscriptionRequest;
use syncano_sync::stream::session::{ConnectionState, StartError, SyncSession};
use syncano_sync::stream::transport::ConnectError;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const TEST_INSTANCE: &str = "test-instance";
const TEST_API_KEY: &str = "test-api-key";
const TEST_USER: &str = "alice";
const TEST_PASSWORD: &str = "secret-password";
const TEST_AUTH_KEY: &str = "user-auth-key";
const TEST_PROJECT: &str = "12";
const TEST_COLLECTION: &str = "34";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct WsObserved {
    connection: usize,
    instance: String,
    api_key: String,
    auth_key: Option<String>,
    subscribed: Option<(String, Option<String>)>,
}

#[derive(Clone)]
struct WsState {
    accept: bool,
    drop_first_connection: bool,
    connections: Arc<AtomicUsize>,
    observed_tx: mpsc::UnboundedSender<Result<WsObserved, String>>,
}

impl WsState {
    fn new(
        accept: bool,
        drop_first_connection: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Result<WsObserved, String>>) {
        let (observed_tx, observed_rx) = mpsc::unbounded_channel();
        let state = Self {
            accept,
            drop_first_connection,
            connections: Arc::new(AtomicUsize::new(0)),
            observed_tx,
        };
        (state, observed_rx)
    }
}

fn session_for(
    authenticator: Arc<dyn Authenticator>,
    addr: SocketAddr,
    options: SyncOptions,
) -> SyncSession {
    let transport = WebSocketTransport::new()
        .with_endpoint(format!("ws://{addr}/"))
        .with_connect_timeout(Duration::from_secs(2));
    SyncSession::new(authenticator, Arc::new(transport), options)
}

fn subscription() -> SubscriptionRequest {
    SubscriptionRequest::new(TEST_PROJECT).collection_id(TEST_COLLECTION)
}

async fn next_observation(
    observed_rx: &mut mpsc::UnboundedReceiver<Result<WsObserved, String>>,
) -> WsObserved {
    timeout(WAIT, observed_rx.recv())
        .await
        .expect("timed out waiting for ws server observation")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_login_then_subscribe_and_receive_notification() {
    let (state, mut observed_rx) = WsState::new(true, false);
    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/api/user.login", post(user_login_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let authenticator = UserLoginAuthenticator::new(
        TEST_INSTANCE,
        SecretString::new(TEST_API_KEY.to_string()),
        TEST_USER,
        SecretString::new(TEST_PASSWORD.to_string()),
    )
    .expect("build login authenticator")
    .with_base_url(format!("http://{addr}/"));
    let session = session_for(Arc::new(authenticator), addr, SyncOptions::default());

    let (title_tx, mut titles) = mpsc::unbounded_channel();
    session.events().on_new(move |notification| {
        let title = notification
            .data()
            .and_then(|data| data.title.clone())
            .ok_or("notification without title")?;
        let _ = title_tx.send(title);
        Ok(())
    });

    session
        .subscribe_collection(subscription())
        .expect("valid subscription");
    session.start().await.expect("start against mock server");
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.session_id().as_deref(), Some("sess-1"));

    let title = timeout(WAIT, titles.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("observer channel closed");
    assert_eq!(title, "hello-1");

    session.stop().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let observed = next_observation(&mut observed_rx).await;
    assert_eq!(observed.connection, 1);
    assert_eq!(observed.instance, TEST_INSTANCE);
    assert_eq!(observed.api_key, TEST_API_KEY);
    assert_eq!(observed.auth_key.as_deref(), Some(TEST_AUTH_KEY));
    assert_eq!(
        observed.subscribed,
        Some((TEST_PROJECT.to_string(), Some(TEST_COLLECTION.to_string())))
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_auth_exhausts_start_budget() {
    let (state, mut observed_rx) = WsState::new(false, false);
    let app = Router::new().route("/", get(ws_handler)).with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let authenticator = Arc::new(ApiKeyAuthenticator::new(
        TEST_INSTANCE,
        SecretString::new("wrong-key".to_string()),
    ));
    let session = session_for(
        authenticator,
        addr,
        SyncOptions::default().with_connect_policy(RetryPolicy::immediate(2)),
    );

    let err = session.start().await.expect_err("auth must be rejected");
    match err {
        StartError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            match source {
                ConnectError::Rejected(reason) => assert_eq!(reason, "invalid api key"),
                other => panic!("unexpected connect error: {other:?}"),
            }
        }
        other => panic!("unexpected start error: {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Failed);

    for expected in 1..=2 {
        let observed = next_observation(&mut observed_rx).await;
        assert_eq!(observed.connection, expected);
        assert_eq!(observed.api_key, "wrong-key");
        assert!(observed.subscribed.is_none());
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_side_drop_reconnects_and_replays_subscription() {
    let (state, mut observed_rx) = WsState::new(true, true);
    let app = Router::new().route("/", get(ws_handler)).with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let authenticator = Arc::new(ApiKeyAuthenticator::new(
        TEST_INSTANCE,
        SecretString::new(TEST_API_KEY.to_string()),
    ));
    let session = session_for(
        authenticator,
        addr,
        SyncOptions::default().with_reconnect_policy(RetryPolicy::immediate(5)),
    );

    let (title_tx, mut titles) = mpsc::unbounded_channel();
    session.events().on_new(move |notification| {
        let _ = title_tx.send(notification.data().and_then(|data| data.title.clone()));
        Ok(())
    });
    session
        .subscribe_collection(subscription())
        .expect("valid subscription");
    session.start().await.expect("start against mock server");

    let first = next_observation(&mut observed_rx).await;
    assert_eq!(first.connection, 1);
    assert!(first.subscribed.is_some());

    let title = timeout(WAIT, titles.recv())
        .await
        .expect("timed out waiting for notification after reconnect")
        .expect("observer channel closed");
    assert_eq!(title.as_deref(), Some("hello-2"));
    assert_eq!(session.session_id().as_deref(), Some("sess-2"));

    session.stop().await;
    let second = next_observation(&mut observed_rx).await;
    assert_eq!(second.connection, 2);
    assert_eq!(second.subscribed, first.subscribed);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| async move {
        let result = run_ws_protocol(socket, &state, connection).await;
        let _ = state.observed_tx.send(result);
    })
    .into_response()
}

async fn run_ws_protocol(
    mut socket: WebSocket,
    state: &WsState,
    connection: usize,
) -> Result<WsObserved, String> {
    let (instance, api_key, auth_key) = match recv_client_message(&mut socket).await? {
        ClientMessage::Auth {
            instance,
            api_key,
            auth_key,
        } => (instance, api_key, auth_key),
        other => return Err(format!("expected auth frame first, got {other:?}")),
    };
    let mut observed = WsObserved {
        connection,
        instance,
        api_key,
        auth_key,
        subscribed: None,
    };

    if !state.accept {
        send_json(
            &mut socket,
            json!({"type": "auth", "result": "NOK", "error": "invalid api key"}),
        )
        .await?;
        return Ok(observed);
    }

    send_json(
        &mut socket,
        json!({"type": "auth", "result": "OK", "uuid": format!("sess-{connection}")}),
    )
    .await?;
    send_json(&mut socket, json!({"type": "ping"})).await?;

    let message_id = match recv_client_message(&mut socket).await? {
        ClientMessage::Call {
            method,
            params,
            message_id,
        } => {
            if method != SUBSCRIBE_COLLECTION {
                return Err(format!("expected subscribe call, got {method}"));
            }
            observed.subscribed = Some((params.project_id, params.collection_id));
            message_id
        }
        other => return Err(format!("expected call frame, got {other:?}")),
    };
    send_json(
        &mut socket,
        json!({"type": "callresponse", "message_id": message_id, "result": "OK"}),
    )
    .await?;

    if state.drop_first_connection && connection == 1 {
        return Ok(observed);
    }

    send_json(
        &mut socket,
        json!({
            "type": "new",
            "object": "data",
            "project_id": TEST_PROJECT,
            "collection_id": TEST_COLLECTION,
            "data": {"id": 99, "title": format!("hello-{connection}")}
        }),
    )
    .await?;

    while let Some(Ok(message)) = socket.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
    Ok(observed)
}

async fn user_login_handler(Json(payload): Json<Value>) -> impl IntoResponse {
    let valid = payload.get("api_key").and_then(Value::as_str) == Some(TEST_API_KEY)
        && payload.get("user_name").and_then(Value::as_str) == Some(TEST_USER)
        && payload.get("password").and_then(Value::as_str) == Some(TEST_PASSWORD);

    if valid {
        (
            StatusCode::OK,
            Json(json!({"result": "OK", "auth_key": TEST_AUTH_KEY})),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({"result": "NOK", "error": "invalid credentials"})),
        )
    }
}

async fn recv_client_message(socket: &mut WebSocket) -> Result<ClientMessage, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return ClientMessage::from_text(text.as_ref())
                    .map_err(|err| format!("failed to decode client message: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client message".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: Value) -> Result<(), String> {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
