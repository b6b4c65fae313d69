use attach_proto::{Frame, GridSize, Role};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::SessionEntry;
use crate::lease::ControlLease;
use crate::tokens::AttachClaims;
use crate::workload::{Launched, Workload, WorkloadError, WorkloadEvent, WorkloadLauncher};

pub type FrameSender = mpsc::UnboundedSender<Frame>;

// Reads the Tokio clock so paused-time tests drive lease deadlines too.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Client {
    connection: u64,
    tx: FrameSender,
    principal: String,
    may_drive: bool,
}

struct HubInner {
    clients: HashMap<String, Client>,
    /// Principal each client id first joined as, for the life of the hub.
    owners: HashMap<String, String>,
    lease: ControlLease,
    backend_closed: bool,
    shut_down: bool,
}

impl HubInner {
    // Callers hold the hub mutex, so every client sees frames in one order.
    fn broadcast(&self, frame: &Frame) {
        for client in self.clients.values() {
            let _ = client.tx.send(frame.clone());
        }
    }

    fn send_to(&self, client_id: &str, frame: Frame) {
        if let Some(client) = self.clients.get(client_id) {
            let _ = client.tx.send(frame);
        }
    }

    fn state_frame(&self, now: Instant) -> Frame {
        Frame::state(
            self.lease.holder(now).map(str::to_string),
            self.lease.remaining(now),
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("session is shutting down")]
    ShutDown,
    #[error("client id belongs to another principal")]
    ClientIdTaken,
    #[error("client id holds the driver lease")]
    LeaseHeld,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

/// What a connection learned when it joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub connection: u64,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSnapshot {
    pub clients: usize,
    pub driver_id: Option<String>,
    pub lease_ms: u64,
}

/// One live attach session: its connections, its driver lease and the
/// workload they share.
pub struct SessionHub {
    session_id: String,
    inner: Mutex<HubInner>,
    workload: Arc<dyn Workload>,
    lease_changed: Notify,
    next_connection: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHub {
    pub fn start(session_id: &str, workload: Arc<dyn Workload>, lease: Duration) -> Arc<Self> {
        let hub = Arc::new(SessionHub {
            session_id: session_id.to_string(),
            inner: Mutex::new(HubInner {
                clients: HashMap::new(),
                owners: HashMap::new(),
                lease: ControlLease::new(lease),
                backend_closed: false,
                shut_down: false,
            }),
            workload,
            lease_changed: Notify::new(),
            next_connection: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });
        let watcher = tokio::spawn(hub.clone().watch_lease());
        hub.tasks.lock().push(watcher);
        hub
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Admits a connection.
    ///
    /// A connection that asked for `driver` and may drive takes the lease
    /// when it is free or already its own; everyone else joins as a viewer.
    /// A client id only ever belongs to one principal, and the lease
    /// holder's id cannot be reused by a connection that would not drive.
    pub fn join(&self, claims: &AttachClaims, tx: FrameSender) -> Result<Joined, JoinError> {
        let now = now();
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(JoinError::ShutDown);
        }

        let client_id = claims.client_id.as_str();
        if inner
            .owners
            .get(client_id)
            .is_some_and(|owner| *owner != claims.principal)
        {
            drop(inner);
            warn!(session_id = %self.session_id, client_id, principal = %claims.principal, "client id reused by another principal");
            return Err(JoinError::ClientIdTaken);
        }
        let wants_lease = claims.role == Role::Driver && claims.may_drive;
        let holds_lease = inner.lease.is_held_by(client_id, now);
        if holds_lease && !wants_lease {
            drop(inner);
            warn!(session_id = %self.session_id, client_id, principal = %claims.principal, "non-driving join for the lease holder's id");
            return Err(JoinError::LeaseHeld);
        }

        let lease_free = holds_lease || inner.lease.holder(now).is_none();
        let mut lease_changed = false;
        if wants_lease && lease_free {
            inner.lease.grant(client_id, now);
            lease_changed = true;
        }
        let role = if wants_lease && inner.lease.is_held_by(client_id, now) {
            Role::Driver
        } else {
            Role::Viewer
        };
        inner
            .owners
            .entry(client_id.to_string())
            .or_insert_with(|| claims.principal.clone());

        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(Frame::Hello {
            session_id: self.session_id.clone(),
            client_id: client_id.to_string(),
            role,
            driver_id: inner.lease.holder(now).map(str::to_string),
            lease_ms: inner.lease.remaining(now).as_millis() as u64,
        });
        if inner.backend_closed {
            let _ = tx.send(Frame::BackendClosed);
        }

        if lease_changed {
            let state = inner.state_frame(now);
            inner.broadcast(&state);
        }
        let replaced = inner.clients.insert(
            client_id.to_string(),
            Client {
                connection,
                tx,
                principal: claims.principal.clone(),
                may_drive: claims.may_drive,
            },
        );
        let clients = inner.clients.len();
        drop(inner);

        if replaced.is_some() {
            debug!(session_id = %self.session_id, client_id, "client reconnected, replacing older connection");
        }
        if lease_changed {
            self.lease_changed.notify_one();
        }
        info!(
            target: "attach::audit",
            session_id = %self.session_id,
            client_id,
            principal = %claims.principal,
            role = %role,
            clients,
            "client connected"
        );
        Ok(Joined { connection, role })
    }

    /// Drops a connection and returns how many remain. A stale connection
    /// whose client id was taken over by a newer one removes nothing.
    pub fn leave(&self, client_id: &str, connection: u64) -> usize {
        let mut inner = self.inner.lock();
        let current = inner
            .clients
            .get(client_id)
            .is_some_and(|client| client.connection == connection);
        if current {
            if let Some(client) = inner.clients.remove(client_id) {
                info!(
                    target: "attach::audit",
                    session_id = %self.session_id,
                    client_id,
                    principal = %client.principal,
                    "client disconnected"
                );
            }
        }
        inner.clients.len()
    }

    /// Newest request wins: the lease moves to `client_id` and every
    /// connection hears about it.
    pub fn take_control(&self, client_id: &str) {
        let now = now();
        let mut inner = self.inner.lock();
        let Some(client) = inner.clients.get(client_id) else {
            return;
        };
        if !client.may_drive {
            let principal = client.principal.clone();
            inner.send_to(client_id, Frame::error("insufficient role"));
            drop(inner);
            warn!(session_id = %self.session_id, client_id, %principal, "take_control denied");
            return;
        }
        let principal = client.principal.clone();
        let previous = inner.lease.grant(client_id, now);
        let state = inner.state_frame(now);
        inner.broadcast(&state);
        drop(inner);

        self.lease_changed.notify_one();
        info!(
            target: "attach::audit",
            session_id = %self.session_id,
            client_id,
            %principal,
            previous_driver = previous.as_deref().unwrap_or(""),
            "control acquired"
        );
    }

    /// Forwards keystrokes from the lease holder and refreshes its lease.
    pub fn stdin(&self, client_id: &str, data: &[u8]) -> Result<(), WorkloadError> {
        {
            let mut inner = self.inner.lock();
            let may_drive = inner
                .clients
                .get(client_id)
                .is_some_and(|client| client.may_drive);
            if !may_drive || !inner.lease.refresh(client_id, now()) {
                inner.send_to(client_id, Frame::error("read-only"));
                return Ok(());
            }
            if inner.backend_closed {
                return Err(WorkloadError::Closed);
            }
        }
        debug!(
            target: "attach::audit",
            session_id = %self.session_id,
            client_id,
            bytes = data.len(),
            "stdin"
        );
        self.workload.write(data)
    }

    /// Holder keepalives extend the lease; every sender gets the current state.
    pub fn keepalive(&self, client_id: &str) {
        let now = now();
        let mut inner = self.inner.lock();
        inner.lease.refresh(client_id, now);
        let state = inner.state_frame(now);
        inner.send_to(client_id, state);
    }

    /// Applies a resize from the holder, or from anyone while nobody holds
    /// the lease. Returns whether the workload was resized.
    pub fn resize(&self, client_id: &str, size: GridSize) -> Result<bool, WorkloadError> {
        if !size.is_known() {
            return Ok(false);
        }
        let allowed = {
            let inner = self.inner.lock();
            match inner.lease.holder(now()) {
                Some(holder) => holder == client_id,
                None => true,
            }
        };
        if !allowed {
            debug!(session_id = %self.session_id, client_id, %size, "ignoring resize from non-driver");
            return Ok(false);
        }
        self.workload.resize(size)?;
        Ok(true)
    }

    /// Routes one decoded client frame.
    pub fn handle_frame(&self, client_id: &str, frame: Frame) {
        let result = match frame {
            Frame::Stdin { data } => self.stdin(client_id, data.as_bytes()),
            Frame::Resize { cols, rows } => self.resize(client_id, GridSize::new(cols, rows)).map(|_| ()),
            Frame::Keepalive => {
                self.keepalive(client_id);
                Ok(())
            }
            Frame::TakeControl => {
                self.take_control(client_id);
                Ok(())
            }
            other => {
                debug!(client_id, kind = other.kind(), "client sent a server-only frame");
                self.send_to(client_id, Frame::error("unknown message type"));
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(session_id = %self.session_id, client_id, error = %err, "workload rejected client input");
        }
    }

    pub fn send_to(&self, client_id: &str, frame: Frame) {
        self.inner.lock().send_to(client_id, frame);
    }

    pub fn broadcast_output(&self, bytes: Vec<u8>) {
        let frame = Frame::stdout(bytes);
        self.inner.lock().broadcast(&frame);
    }

    /// The workload ended: tell everyone, keep the transports up.
    pub fn mark_backend_closed(&self) {
        let mut inner = self.inner.lock();
        if inner.backend_closed {
            return;
        }
        inner.backend_closed = true;
        inner.broadcast(&Frame::BackendClosed);
        info!(session_id = %self.session_id, clients = inner.clients.len(), "workload exited");
    }

    pub fn is_backend_closed(&self) -> bool {
        self.inner.lock().backend_closed
    }

    /// Clears a lapsed lease and broadcasts the empty state.
    pub fn expire_lease(&self) -> Option<String> {
        let now = now();
        let mut inner = self.inner.lock();
        let expired = inner.lease.expire(now)?;
        let state = inner.state_frame(now);
        inner.broadcast(&state);
        drop(inner);
        info!(session_id = %self.session_id, client_id = %expired, "driver lease expired");
        Some(expired)
    }

    pub fn snapshot(&self) -> HubSnapshot {
        let now = now();
        let inner = self.inner.lock();
        HubSnapshot {
            clients: inner.clients.len(),
            driver_id: inner.lease.holder(now).map(str::to_string),
            lease_ms: inner.lease.remaining(now).as_millis() as u64,
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Remaining lease time plus `grace`.
    pub fn cleanup_delay(&self, grace: Duration) -> Duration {
        self.inner.lock().lease.remaining(now()) + grace
    }

    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.clients.clear();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let workload = self.workload.clone();
        tokio::task::spawn_blocking(move || workload.terminate());
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    async fn watch_lease(self: Arc<Self>) {
        loop {
            let deadline = self.inner.lock().lease.deadline();
            match deadline {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            self.expire_lease();
                        }
                        _ = self.lease_changed.notified() => {}
                    }
                }
                None => self.lease_changed.notified().await,
            }
        }
    }
}

/// Live hubs by session id. Hubs are created on first connect and torn down
/// once the last connection has been gone for the lease remainder plus grace.
#[derive(Clone)]
pub struct SessionHubs {
    inner: Arc<HubsInner>,
}

struct HubsInner {
    hubs: DashMap<String, Arc<SessionHub>>,
    launcher: Arc<dyn WorkloadLauncher>,
    lease: Duration,
    cleanup_grace: Duration,
}

impl SessionHubs {
    pub fn new(launcher: Arc<dyn WorkloadLauncher>, lease: Duration, cleanup_grace: Duration) -> Self {
        Self {
            inner: Arc::new(HubsInner {
                hubs: DashMap::new(),
                launcher,
                lease,
                cleanup_grace,
            }),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHub>> {
        self.inner.hubs.get(session_id).map(|hub| hub.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.hubs.is_empty()
    }

    /// Joins `claims` to the session's hub, launching the workload first if
    /// no live hub exists.
    pub fn connect(
        &self,
        entry: &SessionEntry,
        claims: &AttachClaims,
        tx: FrameSender,
    ) -> Result<(Arc<SessionHub>, Joined), ConnectError> {
        // A hub torn down between lookup and join is replaced once.
        for _ in 0..2 {
            let hub = self.get_or_launch(entry)?;
            match hub.join(claims, tx.clone()) {
                Ok(joined) => return Ok((hub, joined)),
                Err(JoinError::ShutDown) => {}
                Err(err) => return Err(err.into()),
            }
            self.inner
                .hubs
                .remove_if(&entry.id, |_, current| Arc::ptr_eq(current, &hub));
        }
        Err(WorkloadError::Closed.into())
    }

    fn get_or_launch(&self, entry: &SessionEntry) -> Result<Arc<SessionHub>, WorkloadError> {
        let mut stale = None;
        let hub = match self.inner.hubs.entry(entry.id.clone()) {
            Entry::Occupied(occupied) if !occupied.get().is_backend_closed() => {
                return Ok(occupied.get().clone());
            }
            Entry::Occupied(mut occupied) => {
                let hub = self.launch(entry)?;
                stale = Some(occupied.insert(hub.clone()));
                hub
            }
            Entry::Vacant(vacant) => {
                let hub = self.launch(entry)?;
                vacant.insert(hub.clone());
                hub
            }
        };
        if let Some(stale) = stale {
            stale.shutdown();
        }
        Ok(hub)
    }

    fn launch(&self, entry: &SessionEntry) -> Result<Arc<SessionHub>, WorkloadError> {
        let Launched { workload, events } =
            self.inner
                .launcher
                .launch(&entry.id, &entry.workload, GridSize::DEFAULT)?;
        let hub = SessionHub::start(&entry.id, workload, self.inner.lease);
        let pump = tokio::spawn(self.clone().pump_output(hub.clone(), events));
        hub.track(pump);
        info!(session_id = %entry.id, "session hub started");
        Ok(hub)
    }

    async fn pump_output(
        self,
        hub: Arc<SessionHub>,
        mut events: mpsc::UnboundedReceiver<WorkloadEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                WorkloadEvent::Output(bytes) => hub.broadcast_output(bytes),
                WorkloadEvent::Exited => break,
            }
        }
        hub.mark_backend_closed();
        // New connections get a fresh workload; current ones stay on this hub.
        self.inner
            .hubs
            .remove_if(hub.session_id(), |_, current| Arc::ptr_eq(current, &hub));
    }

    /// Called when a connection ends. Schedules teardown when it was the last.
    pub fn release(&self, hub: &Arc<SessionHub>, client_id: &str, connection: u64) {
        if hub.leave(client_id, connection) > 0 {
            return;
        }
        let delay = hub.cleanup_delay(self.inner.cleanup_grace);
        debug!(session_id = %hub.session_id(), ?delay, "last client left, scheduling cleanup");

        let hubs = self.clone();
        let hub = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if hub.client_count() > 0 {
                return;
            }
            hubs.inner.hubs.remove_if(hub.session_id(), |_, current| {
                Arc::ptr_eq(current, &hub) && current.client_count() == 0
            });
            if hub.client_count() == 0 {
                hub.shutdown();
                info!(session_id = %hub.session_id(), "session hub torn down");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadSpec;
    use std::sync::atomic::AtomicBool;

    const LEASE: Duration = Duration::from_secs(30);

    #[derive(Default)]
    struct RecordingWorkload {
        writes: Mutex<Vec<Vec<u8>>>,
        sizes: Mutex<Vec<GridSize>>,
        terminated: AtomicBool,
    }

    impl Workload for RecordingWorkload {
        fn write(&self, data: &[u8]) -> Result<(), WorkloadError> {
            self.writes.lock().push(data.to_vec());
            Ok(())
        }

        fn resize(&self, size: GridSize) -> Result<(), WorkloadError> {
            self.sizes.lock().push(size);
            Ok(())
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    struct RecordingLauncher {
        workload: Arc<RecordingWorkload>,
        events: Mutex<Option<mpsc::UnboundedSender<WorkloadEvent>>>,
    }

    impl RecordingLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                workload: Arc::new(RecordingWorkload::default()),
                events: Mutex::new(None),
            })
        }
    }

    impl WorkloadLauncher for RecordingLauncher {
        fn launch(
            &self,
            _session_id: &str,
            _spec: &WorkloadSpec,
            _size: GridSize,
        ) -> Result<Launched, WorkloadError> {
            let (tx, events) = mpsc::unbounded_channel();
            *self.events.lock() = Some(tx);
            Ok(Launched {
                workload: self.workload.clone(),
                events,
            })
        }
    }

    fn claims(client_id: &str, role: Role, may_drive: bool) -> AttachClaims {
        AttachClaims {
            session_id: "s1".into(),
            client_id: client_id.into(),
            role,
            may_drive,
            principal: format!("user-{client_id}"),
            expires_at: Instant::now() + Duration::from_secs(120),
            expires_at_ms: 0,
        }
    }

    fn entry() -> SessionEntry {
        SessionEntry {
            id: "s1".into(),
            attach_enabled: true,
            workload: WorkloadSpec::Loopback { banner: None },
        }
    }

    fn client() -> (FrameSender, mpsc::UnboundedReceiver<Frame>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn hub_with(workload: Arc<RecordingWorkload>) -> Arc<SessionHub> {
        SessionHub::start("s1", workload, LEASE)
    }

    #[test_timeout::tokio_timeout_test]
    async fn newest_take_control_wins_and_is_broadcast() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();

        let a = hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        assert_eq!(a.role, Role::Driver);
        assert_eq!(
            drain(&mut a_rx),
            vec![Frame::Hello {
                session_id: "s1".into(),
                client_id: "c1".into(),
                role: Role::Driver,
                driver_id: Some("c1".into()),
                lease_ms: 30_000,
            }]
        );

        let b = hub.join(&claims("c2", Role::Viewer, true), b_tx).unwrap();
        assert_eq!(b.role, Role::Viewer);
        match drain(&mut b_rx).as_slice() {
            [Frame::Hello { client_id, role, driver_id, .. }] => {
                assert_eq!(client_id, "c2");
                assert_eq!(*role, Role::Viewer);
                assert_eq!(driver_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected frames: {other:?}"),
        }

        hub.take_control("c2");
        let expected = Frame::State {
            driver_id: Some("c2".into()),
            lease_ms: 30_000,
        };
        assert_eq!(drain(&mut a_rx), vec![expected.clone()]);
        assert_eq!(drain(&mut b_rx), vec![expected]);
        assert_eq!(hub.snapshot().driver_id.as_deref(), Some("c2"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn driver_request_while_held_joins_as_viewer() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (a_tx, _a_rx) = client();
        let (b_tx, _b_rx) = client();
        hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        let b = hub.join(&claims("c2", Role::Driver, true), b_tx).unwrap();
        assert_eq!(b.role, Role::Viewer);

        let (c_tx, _c_rx) = client();
        let reconnect = hub.join(&claims("c1", Role::Driver, true), c_tx).unwrap();
        assert_eq!(reconnect.role, Role::Driver);
        assert_eq!(hub.client_count(), 2);
    }

    fn claims_for(principal: &str, client_id: &str, role: Role, may_drive: bool) -> AttachClaims {
        AttachClaims {
            principal: principal.into(),
            ..claims(client_id, role, may_drive)
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn holder_id_cannot_be_reused_without_drive_rights() {
        let workload = Arc::new(RecordingWorkload::default());
        let hub = hub_with(workload.clone());
        let (a_tx, mut a_rx) = client();
        hub.join(&claims_for("alice", "c1", Role::Driver, true), a_tx).unwrap();
        drain(&mut a_rx);

        let (b_tx, mut b_rx) = client();
        assert_eq!(
            hub.join(&claims_for("bob", "c1", Role::Viewer, false), b_tx),
            Err(JoinError::ClientIdTaken)
        );
        let (c_tx, mut c_rx) = client();
        assert_eq!(
            hub.join(&claims_for("alice", "c1", Role::Viewer, false), c_tx),
            Err(JoinError::LeaseHeld)
        );
        assert!(drain(&mut b_rx).is_empty());
        assert!(drain(&mut c_rx).is_empty());

        // the original driver connection is untouched
        hub.handle_frame("c1", Frame::stdin("id\n"));
        assert_eq!(*workload.writes.lock(), vec![b"id\n".to_vec()]);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.snapshot().driver_id.as_deref(), Some("c1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn driver_request_without_drive_rights_joins_as_viewer() {
        let workload = Arc::new(RecordingWorkload::default());
        let hub = hub_with(workload.clone());
        let (tx, mut rx) = client();
        let joined = hub.join(&claims("c3", Role::Driver, false), tx).unwrap();
        assert_eq!(joined.role, Role::Viewer);
        match drain(&mut rx).as_slice() {
            [Frame::Hello { role, driver_id, .. }] => {
                assert_eq!(*role, Role::Viewer);
                assert_eq!(*driver_id, None);
            }
            other => panic!("unexpected frames: {other:?}"),
        }
        assert_eq!(hub.snapshot().driver_id, None);

        hub.handle_frame("c3", Frame::stdin("id\n"));
        assert_eq!(drain(&mut rx), vec![Frame::error("read-only")]);
        assert!(workload.writes.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn take_control_without_scope_is_refused() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();
        hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        hub.join(&claims("c2", Role::Viewer, false), b_tx).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.take_control("c2");
        assert_eq!(drain(&mut b_rx), vec![Frame::error("insufficient role")]);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(hub.snapshot().driver_id.as_deref(), Some("c1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn only_holder_input_reaches_workload() {
        let workload = Arc::new(RecordingWorkload::default());
        let hub = hub_with(workload.clone());
        let (a_tx, _a_rx) = client();
        let (b_tx, mut b_rx) = client();
        hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        hub.join(&claims("c2", Role::Viewer, true), b_tx).unwrap();
        drain(&mut b_rx);

        hub.handle_frame("c2", Frame::stdin("rm -rf /\n"));
        assert_eq!(drain(&mut b_rx), vec![Frame::error("read-only")]);
        hub.handle_frame("c1", Frame::stdin("ls\n"));
        assert_eq!(*workload.writes.lock(), vec![b"ls\n".to_vec()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn resize_follows_the_lease() {
        let workload = Arc::new(RecordingWorkload::default());
        let hub = hub_with(workload.clone());
        let (b_tx, _b_rx) = client();
        hub.join(&claims("c2", Role::Viewer, true), b_tx).unwrap();

        assert!(hub.resize("c2", GridSize::new(100, 40)).unwrap());
        assert!(!hub.resize("c2", GridSize::new(0, 40)).unwrap());

        let (a_tx, _a_rx) = client();
        hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        assert!(!hub.resize("c2", GridSize::new(90, 30)).unwrap());
        assert!(hub.resize("c1", GridSize::new(120, 50)).unwrap());
        assert_eq!(
            *workload.sizes.lock(),
            vec![GridSize::new(100, 40), GridSize::new(120, 50)]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn server_only_frames_are_rejected() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (a_tx, mut a_rx) = client();
        hub.join(&claims("c1", Role::Viewer, true), a_tx).unwrap();
        drain(&mut a_rx);
        hub.handle_frame("c1", Frame::stdout("x"));
        assert_eq!(drain(&mut a_rx), vec![Frame::error("unknown message type")]);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn lapsed_lease_is_broadcast_as_no_holder() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();
        hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        hub.join(&claims("c2", Role::Viewer, true), b_tx).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        tokio::time::sleep(LEASE + Duration::from_secs(1)).await;
        let expired = Frame::State {
            driver_id: None,
            lease_ms: 0,
        };
        assert_eq!(drain(&mut a_rx), vec![expired.clone()]);
        assert_eq!(drain(&mut b_rx), vec![expired]);
        assert_eq!(hub.snapshot().driver_id, None);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn holder_keepalive_outlives_nominal_lease() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (a_tx, mut a_rx) = client();
        hub.join(&claims("c1", Role::Driver, true), a_tx).unwrap();
        drain(&mut a_rx);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            hub.keepalive("c1");
        }
        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|frame| matches!(
            frame,
            Frame::State { driver_id: Some(id), lease_ms: 30_000 } if id == "c1"
        )));

        tokio::time::sleep(LEASE + Duration::from_secs(1)).await;
        assert_eq!(
            drain(&mut a_rx),
            vec![Frame::State {
                driver_id: None,
                lease_ms: 0
            }]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn workload_exit_reaches_every_connection() {
        let launcher = RecordingLauncher::new();
        let hubs = SessionHubs::new(launcher.clone(), LEASE, Duration::from_secs(5));
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();
        let (hub, _) = hubs
            .connect(&entry(), &claims("c1", Role::Driver, true), a_tx)
            .unwrap();
        hubs.connect(&entry(), &claims("c2", Role::Viewer, true), b_tx)
            .unwrap();

        let events = launcher.events.lock().clone().unwrap();
        events.send(WorkloadEvent::Output(b"bye\r\n".to_vec())).unwrap();
        events.send(WorkloadEvent::Exited).unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            loop {
                match rx.recv().await.unwrap() {
                    Frame::BackendClosed => break,
                    Frame::Hello { .. } | Frame::State { .. } => {}
                    Frame::Stdout { data } => assert_eq!(data.as_bytes(), b"bye\r\n"),
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        }
        assert!(hub.is_backend_closed());
        while hubs.get("s1").is_some() {
            tokio::task::yield_now().await;
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn idle_hub_is_torn_down_after_lease_and_grace() {
        let launcher = RecordingLauncher::new();
        let grace = Duration::from_secs(5);
        let hubs = SessionHubs::new(launcher.clone(), LEASE, grace);
        let (a_tx, _a_rx) = client();
        let (hub, joined) = hubs
            .connect(&entry(), &claims("c1", Role::Driver, true), a_tx)
            .unwrap();

        hubs.release(&hub, "c1", joined.connection);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(hubs.len(), 1);

        tokio::time::sleep(LEASE).await;
        assert!(hubs.is_empty());
        // terminate runs on the blocking pool
        for _ in 0..100 {
            if launcher.workload.terminated.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(launcher.workload.terminated.load(Ordering::SeqCst));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_connection_leave_keeps_replacement() {
        let hub = hub_with(Arc::new(RecordingWorkload::default()));
        let (old_tx, _old_rx) = client();
        let (new_tx, _new_rx) = client();
        let old = hub.join(&claims("c1", Role::Driver, true), old_tx).unwrap();
        let new = hub.join(&claims("c1", Role::Driver, true), new_tx).unwrap();
        assert_eq!(hub.leave("c1", old.connection), 1);
        assert_eq!(hub.leave("c1", new.connection), 0);
    }
}
