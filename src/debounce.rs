/// Trailing-edge debouncer driven by explicit timestamps (seconds).
///
/// Every `schedule` replaces the pending value and pushes the deadline out,
/// so at most one value leaves per quiet period.
#[derive(Clone, Debug)]
pub struct Debouncer<T> {
    delay: f64,
    pending: Option<(f64, T)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay: f64) -> Self {
        Self { delay: delay.max(0.0), pending: None }
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn schedule(&mut self, now: f64, value: T) {
        self.pending = Some((now + self.delay, value));
    }

    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take().map(|(_, v)| v)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref().map(|(_, v)| v)
    }

    pub fn deadline(&self) -> Option<f64> {
        self.pending.as_ref().map(|(at, _)| *at)
    }

    /// Hand out the pending value once its deadline has passed
    pub fn poll(&mut self, now: f64) -> Option<T> {
        match self.pending {
            Some((at, _)) if now >= at => self.cancel(),
            _ => None,
        }
    }
}
