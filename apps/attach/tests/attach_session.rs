use attach_client::auth::HttpAuthenticator;
use attach_client::config::ServerUrl;
use attach_client::controller::ESCAPE_PREFIX;
use attach_client::engine::memory::MemorySurface;
use attach_client::engine::PassthroughEngine;
use attach_client::transport::WsConnector;
use attach_client::{
    connect, AttachError, AttachTarget, ControllerOptions, LifecycleConfig, SessionController,
    SessionEnd, SessionEvent,
};
use attach_proto::{ConnectionStatus, GridSize, Role, StatusReport};
use attach_server::config::{Config, CredentialConfig, SessionConfig};
use attach_server::workload::WorkloadSpec;
use attach_server::AppState;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DRIVER_CRED: &str = "driver-cred";
const VIEWER_CRED: &str = "viewer-cred";

async fn spawn_server() -> ServerUrl {
    let config = Config {
        credentials: vec![
            CredentialConfig {
                token: DRIVER_CRED.into(),
                principal: "alice".into(),
                scopes: vec!["session:read".into(), "control:write".into()],
            },
            CredentialConfig {
                token: VIEWER_CRED.into(),
                principal: "bob".into(),
                scopes: vec!["session:read".into()],
            },
        ],
        sessions: vec![SessionConfig {
            id: "demo".into(),
            attach_enabled: true,
            workload: WorkloadSpec::Loopback { banner: None },
        }],
        ..Config::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config);
    tokio::spawn(async move {
        attach_server::serve(listener, state).await.unwrap();
    });
    ServerUrl::parse(&format!("http://{addr}")).unwrap()
}

struct Client {
    surface: MemorySurface,
    events: UnboundedReceiver<SessionEvent>,
    task: JoinHandle<SessionEnd>,
}

async fn attach(
    server: &ServerUrl,
    credential: &str,
    role: Role,
) -> Result<Client, (AttachError, StatusReport)> {
    let surface = MemorySurface::new(GridSize::new(100, 30));
    let (events_tx, events) = mpsc::unbounded_channel();
    let options = ControllerOptions {
        escape_keys: true,
        ..ControllerOptions::default()
    };
    let controller = SessionController::mount(
        Box::new(PassthroughEngine::new()),
        Box::new(surface.clone()),
        options,
        events_tx,
    );
    let authenticator =
        HttpAuthenticator::new(server.clone(), credential, Duration::from_secs(5)).unwrap();
    let connector = WsConnector::new(server.clone());
    let target = AttachTarget {
        session_id: "demo".into(),
        role,
    };
    let (status_tx, status_rx) = watch::channel(StatusReport::default());
    match connect(
        &authenticator,
        &connector,
        &target,
        controller.dimensions(),
        &LifecycleConfig::default(),
        status_tx,
    )
    .await
    {
        Ok(connection) => Ok(Client {
            surface,
            events,
            task: tokio::spawn(controller.run(connection)),
        }),
        Err(err) => {
            controller.abort(&err.to_string());
            let report = status_rx.borrow().clone();
            Err((err, report))
        }
    }
}

async fn wait_for(client: &mut Client, expected: SessionEvent) {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match client.events.recv().await {
                Some(event) if event == expected => return,
                Some(_) => continue,
                None => panic!("session ended before {expected:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {expected:?} within {deadline:?}"));
}

async fn wait_for_output(client: &Client, needle: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.surface.output_lossy().contains(needle) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("output never contained {needle:?}"));
}

#[test_timeout::tokio_timeout_test(20)]
async fn driver_types_and_viewer_takes_over() {
    let server = spawn_server().await;

    let mut alice = attach(&server, DRIVER_CRED, Role::Driver).await.unwrap();
    wait_for(&mut alice, SessionEvent::RoleChanged(Role::Driver)).await;
    alice.surface.type_bytes(b"echo one\n");
    wait_for_output(&alice, "echo one").await;

    let mut carol = attach(&server, DRIVER_CRED, Role::Viewer).await.unwrap();
    wait_for(&mut carol, SessionEvent::RoleChanged(Role::Viewer)).await;
    carol.surface.type_bytes(b"ignored while viewing\n");

    carol.surface.type_bytes(&[ESCAPE_PREFIX, b'c']);
    wait_for(&mut carol, SessionEvent::RoleChanged(Role::Driver)).await;
    wait_for(&mut alice, SessionEvent::RoleChanged(Role::Viewer)).await;

    carol.surface.type_bytes(b"echo two\n");
    wait_for_output(&alice, "echo two").await;
    assert!(!alice.surface.output_lossy().contains("ignored while viewing"));

    carol.surface.type_bytes(&[ESCAPE_PREFIX, b'd']);
    assert_eq!(carol.task.await.unwrap(), SessionEnd::Detached);
    alice.surface.type_bytes(&[ESCAPE_PREFIX, b'd']);
    assert_eq!(alice.task.await.unwrap(), SessionEnd::Detached);
}

#[test_timeout::tokio_timeout_test(20)]
async fn viewer_credential_cannot_take_control() {
    let server = spawn_server().await;

    let mut bob = attach(&server, VIEWER_CRED, Role::Viewer).await.unwrap();
    wait_for(&mut bob, SessionEvent::RoleChanged(Role::Viewer)).await;
    bob.surface.type_bytes(&[ESCAPE_PREFIX, b'c']);
    wait_for(&mut bob, SessionEvent::ProtocolError("insufficient role".into())).await;
    wait_for_output(&bob, "[error] insufficient role").await;

    bob.surface.type_bytes(&[ESCAPE_PREFIX, b'd']);
    assert_eq!(bob.task.await.unwrap(), SessionEnd::Detached);
}

#[test_timeout::tokio_timeout_test(20)]
async fn workload_exit_reaches_every_client() {
    let server = spawn_server().await;

    let mut alice = attach(&server, DRIVER_CRED, Role::Driver).await.unwrap();
    wait_for(&mut alice, SessionEvent::RoleChanged(Role::Driver)).await;
    let mut bob = attach(&server, VIEWER_CRED, Role::Viewer).await.unwrap();
    wait_for(&mut bob, SessionEvent::RoleChanged(Role::Viewer)).await;

    alice.surface.type_bytes(&[0x04]);
    wait_for(&mut alice, SessionEvent::BackendClosed).await;
    wait_for(&mut bob, SessionEvent::BackendClosed).await;
    wait_for_output(&bob, "[backend closed]").await;
}

#[test_timeout::tokio_timeout_test(20)]
async fn rejected_credential_fails_before_transport() {
    let server = spawn_server().await;

    let (err, report) = match attach(&server, "not-a-credential", Role::Viewer).await {
        Ok(_) => panic!("unknown credential was accepted"),
        Err(failure) => failure,
    };
    assert!(err.is_unauthorized());
    assert_eq!(report.status, ConnectionStatus::Error);
    assert!(report.reason.is_some());

    let (err, _) = match attach(&server, VIEWER_CRED, Role::Driver).await {
        Ok(_) => panic!("viewer credential got a driver token"),
        Err(failure) => failure,
    };
    assert!(matches!(err, AttachError::Forbidden(_)));
}
