use std::time::{Duration, Instant};

/// The single driver lease of one session.
///
/// Pure bookkeeping: every operation takes `now`, so callers serialize access
/// (the session hub holds it under its mutex) and tests drive the clock.
#[derive(Debug, Clone)]
pub struct ControlLease {
    length: Duration,
    holder: Option<String>,
    expires_at: Option<Instant>,
}

impl ControlLease {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            holder: None,
            expires_at: None,
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// Holder of a lease that has not expired yet.
    pub fn holder(&self, now: Instant) -> Option<&str> {
        match self.expires_at {
            Some(deadline) if now < deadline => self.holder.as_deref(),
            _ => None,
        }
    }

    pub fn is_held_by(&self, client_id: &str, now: Instant) -> bool {
        self.holder(now) == Some(client_id)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match (self.holder(now), self.expires_at) {
            (Some(_), Some(deadline)) => deadline.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Hands the lease to `client_id` for a full term, revoking whoever held
    /// it. Returns the previous live holder when it was someone else.
    pub fn grant(&mut self, client_id: &str, now: Instant) -> Option<String> {
        let previous = self
            .holder(now)
            .filter(|holder| *holder != client_id)
            .map(str::to_string);
        self.holder = Some(client_id.to_string());
        self.expires_at = Some(now + self.length);
        previous
    }

    /// Extends the term when `client_id` is the live holder.
    pub fn refresh(&mut self, client_id: &str, now: Instant) -> bool {
        if !self.is_held_by(client_id, now) {
            return false;
        }
        self.expires_at = Some(now + self.length);
        true
    }

    /// Clears a lapsed lease and returns whoever held it. A live or empty
    /// lease is left untouched.
    pub fn expire(&mut self, now: Instant) -> Option<String> {
        match self.expires_at {
            Some(deadline) if now >= deadline => {
                self.expires_at = None;
                self.holder.take()
            }
            _ => None,
        }
    }
}
