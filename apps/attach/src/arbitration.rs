//! Client-side view of the control lease.

use attach_proto::{Frame, Role};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Gained,
    Lost,
}

/// What this client believes about the lease. The backend owns the real
/// lease; this only decides whether local input goes on the wire.
#[derive(Debug, Clone, Default)]
pub struct Arbitration {
    client_id: Option<String>,
    role: Role,
    driver_id: Option<String>,
    lease_ms: u64,
    read_only: bool,
}

impl Arbitration {
    pub fn new(read_only: bool) -> Self {
        Self {
            read_only,
            ..Self::default()
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn driver_id(&self) -> Option<&str> {
        self.driver_id.as_deref()
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn may_send_input(&self) -> bool {
        self.role == Role::Driver && !self.read_only
    }

    /// Folds a `hello` or `state` frame into the local view and reports
    /// whether the local role flipped. Other frames are ignored.
    pub fn apply(&mut self, frame: &Frame) -> Option<RoleChange> {
        let before = self.role;
        match frame {
            Frame::Hello {
                client_id,
                role,
                driver_id,
                lease_ms,
                ..
            } => {
                self.client_id = Some(client_id.clone());
                self.driver_id = driver_id.clone();
                self.lease_ms = *lease_ms;
                self.role = if self.holds_lease() { Role::Driver } else { *role };
            }
            Frame::State {
                driver_id,
                lease_ms,
            } => {
                self.driver_id = driver_id.clone();
                self.lease_ms = *lease_ms;
                self.role = if self.holds_lease() {
                    Role::Driver
                } else {
                    Role::Viewer
                };
            }
            _ => return None,
        }
        debug!(
            target: "attach::arbitration",
            role = %self.role,
            driver_id = self.driver_id.as_deref().unwrap_or(""),
            lease_ms = self.lease_ms,
            "lease view updated"
        );
        match (before, self.role) {
            (Role::Viewer, Role::Driver) => Some(RoleChange::Gained),
            (Role::Driver, Role::Viewer) => Some(RoleChange::Lost),
            _ => None,
        }
    }

    fn holds_lease(&self) -> bool {
        match (&self.client_id, &self.driver_id) {
            (Some(me), Some(driver)) => me == driver,
            _ => false,
        }
    }

    /// The `stdin` frame for local input, or `None` while it must stay local.
    pub fn gate_input(&self, bytes: &[u8]) -> Option<Frame> {
        if bytes.is_empty() || !self.may_send_input() {
            return None;
        }
        Some(Frame::stdin(bytes))
    }

    /// The `take_control` request. Read-only clients never ask.
    pub fn request_control(&self) -> Option<Frame> {
        if self.read_only {
            return None;
        }
        Some(Frame::TakeControl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(client: &str, role: Role, driver: Option<&str>) -> Frame {
        Frame::Hello {
            session_id: "s1".into(),
            client_id: client.into(),
            role,
            driver_id: driver.map(str::to_string),
            lease_ms: 30_000,
        }
    }

    fn state(driver: Option<&str>, lease_ms: u64) -> Frame {
        Frame::State {
            driver_id: driver.map(str::to_string),
            lease_ms,
        }
    }

    #[test_timeout::timeout]
    fn take_control_moves_input_between_clients() {
        let mut a = Arbitration::new(false);
        let mut b = Arbitration::new(false);

        assert_eq!(a.apply(&hello("c1", Role::Driver, Some("c1"))), Some(RoleChange::Gained));
        assert_eq!(b.apply(&hello("c2", Role::Viewer, Some("c1"))), None);
        assert!(a.gate_input(b"ls\n").is_some());
        assert!(b.gate_input(b"ls\n").is_none());

        let broadcast = state(Some("c2"), 30_000);
        assert_eq!(a.apply(&broadcast), Some(RoleChange::Lost));
        assert_eq!(b.apply(&broadcast), Some(RoleChange::Gained));
        assert_eq!(a.driver_id(), b.driver_id());

        assert!(a.gate_input(b"x").is_none());
        assert_eq!(b.gate_input(b"x"), Some(Frame::stdin("x")));
    }

    #[test_timeout::timeout]
    fn expiry_demotes_holder() {
        let mut a = Arbitration::new(false);
        a.apply(&hello("c1", Role::Driver, Some("c1")));
        assert_eq!(a.apply(&state(None, 0)), Some(RoleChange::Lost));
        assert_eq!(a.role(), Role::Viewer);
        assert_eq!(a.lease_ms(), 0);
        assert!(a.gate_input(b"x").is_none());
    }

    #[test_timeout::timeout]
    fn read_only_never_forwards_or_requests() {
        let mut a = Arbitration::new(true);
        a.apply(&hello("c1", Role::Driver, Some("c1")));
        assert_eq!(a.role(), Role::Driver);
        assert!(!a.may_send_input());
        assert!(a.gate_input(b"rm -rf /\n").is_none());
        assert!(a.request_control().is_none());
        assert_eq!(Arbitration::new(false).request_control(), Some(Frame::TakeControl));
    }

    #[test_timeout::timeout]
    fn no_input_before_hello() {
        let mut a = Arbitration::new(false);
        assert!(a.gate_input(b"x").is_none());
        assert_eq!(a.apply(&state(Some("c9"), 100)), None);
        assert!(a.gate_input(b"x").is_none());
        assert_eq!(a.apply(&Frame::stdout("ignored")), None);
    }
}
