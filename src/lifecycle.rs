/// First delay between container probes, in seconds
pub const PROBE_BASE_DELAY: f64 = 0.05;
/// Upper bound for one probe delay
pub const PROBE_MAX_DELAY: f64 = 1.6;
/// Probes before giving up on the container
pub const PROBE_MAX_ATTEMPTS: u32 = 12;

/// Bounded exponential backoff used while the container is missing
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    attempt: u32,
    next_at: f64,
    base: f64,
    max_delay: f64,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(now: f64) -> Self {
        Self {
            attempt: 0,
            next_at: now,
            base: PROBE_BASE_DELAY,
            max_delay: PROBE_MAX_DELAY,
            max_attempts: PROBE_MAX_ATTEMPTS,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_due(&self, now: f64) -> bool {
        now >= self.next_at
    }

    /// Record a failed probe, false once the attempts are used up
    pub fn fail(&mut self, now: f64) -> bool {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return false;
        }
        let delay = (self.base * 2f64.powi(self.attempt as i32 - 1)).min(self.max_delay);
        self.next_at = now + delay;
        true
    }
}

/// Where the picker stands with respect to its container
#[derive(Clone, Debug, PartialEq)]
pub enum Attachment {
    Detached,
    /// Container not there yet, probing with backoff
    Waiting(Backoff),
    /// Container present, following its visibility
    Observing,
}

/// Outcome of one container probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Not waiting, or the next probe is not due yet
    Idle,
    Ready,
    Retry,
    GaveUp,
}

#[derive(Clone, Debug)]
pub struct Lifecycle {
    attachment: Attachment,
    intersection_ratio: f64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self { attachment: Attachment::Detached, intersection_ratio: 0.0 }
    }
}

impl Lifecycle {
    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn is_observing(&self) -> bool {
        self.attachment == Attachment::Observing
    }

    pub fn intersection_ratio(&self) -> f64 {
        self.intersection_ratio
    }

    pub fn attach(&mut self, now: f64) {
        if self.attachment == Attachment::Detached {
            self.attachment = Attachment::Waiting(Backoff::new(now));
        }
    }

    pub fn detach(&mut self) {
        self.attachment = Attachment::Detached;
        self.intersection_ratio = 0.0;
    }

    pub fn probe(&mut self, ready: bool, now: f64) -> ProbeOutcome {
        let Attachment::Waiting(backoff) = &mut self.attachment else {
            return ProbeOutcome::Idle;
        };
        if !backoff.is_due(now) {
            return ProbeOutcome::Idle;
        }
        if ready {
            self.attachment = Attachment::Observing;
            return ProbeOutcome::Ready;
        }
        if backoff.fail(now) {
            ProbeOutcome::Retry
        } else {
            self.attachment = Attachment::Detached;
            ProbeOutcome::GaveUp
        }
    }

    /// Record a visibility report. Returns the ratio when the picker follows
    /// the container, `None` while detached.
    pub fn observe(&mut self, ratio: f64) -> Option<f64> {
        match self.attachment {
            Attachment::Detached => return None,
            // a container that reports intersections exists
            Attachment::Waiting(_) => self.attachment = Attachment::Observing,
            Attachment::Observing => {}
        }
        self.intersection_ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
        Some(self.intersection_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(0.0);
        let mut delays = Vec::new();
        while backoff.fail(0.0) {
            delays.push(backoff.next_at);
        }
        assert_eq!(delays[0], 0.05);
        assert_eq!(delays[1], 0.1);
        assert_eq!(delays.last().copied(), Some(PROBE_MAX_DELAY));
        assert_eq!(backoff.attempts(), PROBE_MAX_ATTEMPTS);
    }

    #[test]
    fn probe_waits_for_schedule() {
        let mut life = Lifecycle::default();
        assert_eq!(life.probe(true, 0.0), ProbeOutcome::Idle);
        life.attach(0.0);
        assert_eq!(life.probe(false, 0.0), ProbeOutcome::Retry);
        assert_eq!(life.probe(true, 0.01), ProbeOutcome::Idle);
        assert_eq!(life.probe(true, 0.05), ProbeOutcome::Ready);
        assert!(life.is_observing());
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut life = Lifecycle::default();
        life.attach(0.0);
        let mut now = 0.0;
        let mut last = ProbeOutcome::Idle;
        for _ in 0..1000 {
            last = life.probe(false, now);
            if last == ProbeOutcome::GaveUp {
                break;
            }
            now += 0.1;
        }
        assert_eq!(last, ProbeOutcome::GaveUp);
        assert_eq!(life.attachment(), &Attachment::Detached);
    }

    #[test]
    fn intersection_implies_container() {
        let mut life = Lifecycle::default();
        assert_eq!(life.observe(1.0), None);
        life.attach(0.0);
        assert_eq!(life.observe(1.5), Some(1.0));
        assert!(life.is_observing());
    }
}
