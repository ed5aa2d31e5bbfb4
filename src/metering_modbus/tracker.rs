use chrono::{DateTime, Utc};
use crate::models::{LinkState, LinkStateChanged, MeterIdentity};

pub const DEFAULT_ERROR_THRESHOLD: u32 = 2;

/// Communication health of one counter
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationState {
    pub error_streak: u32,
    pub reported: LinkState,
    pub last_transition: Option<DateTime<Utc>>,
}

impl CommunicationState {
    pub fn new() -> Self {
        CommunicationState {
            error_streak: 0,
            reported: LinkState::Up,
            last_transition: None,
        }
    }
}

/// Debounces per-cycle failures into link up/down transitions.
///
/// The link counts as down once more than `threshold` cycles in a row failed.
/// An event is produced only when that view differs from the last reported one.
pub struct ErrorStateTracker {
    identity: MeterIdentity,
    endpoint: Option<String>,
    threshold: u32,
    state: CommunicationState,
}

impl ErrorStateTracker {
    pub fn new(identity: MeterIdentity, threshold: u32) -> Self {
        ErrorStateTracker {
            identity,
            endpoint: None,
            threshold,
            state: CommunicationState::new(),
        }
    }

    /// Endpoint mentioned in the events, updated whenever the driver (re)connects
    pub fn set_endpoint(&mut self, endpoint: Option<String>) {
        self.endpoint = endpoint;
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn state(&self) -> &CommunicationState {
        &self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.state.reported
    }

    pub fn record_cycle(&mut self, cycle_failed: bool) -> Option<LinkStateChanged> {
        self.record_cycle_at(cycle_failed, Utc::now())
    }

    pub fn record_cycle_at(&mut self, cycle_failed: bool, now: DateTime<Utc>) -> Option<LinkStateChanged> {
        if cycle_failed {
            self.state.error_streak = self.state.error_streak.saturating_add(1);
        } else {
            self.state.error_streak = 0;
        }

        let current = if self.state.error_streak > self.threshold { LinkState::Down } else { LinkState::Up };
        if current == self.state.reported {
            return None;
        }

        self.state.reported = current;
        self.state.last_transition = Some(now);

        return Some(LinkStateChanged {
            counter_id: self.identity.counter_id,
            meter_name: self.identity.name.clone(),
            company_id: self.identity.company_id.clone(),
            endpoint: self.endpoint.clone(),
            new_state: current,
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u32) -> ErrorStateTracker {
        ErrorStateTracker::new(MeterIdentity::new(167, 100, "ContadorTeste", "ACME"), threshold)
    }

    #[test]
    fn test_initial_state() {
        let t = tracker(DEFAULT_ERROR_THRESHOLD);
        assert_eq!(t.state(), &CommunicationState::new());
        assert_eq!(t.link_state(), LinkState::Up);
    }

    #[test]
    fn test_down_after_threshold_plus_one_failures() {
        for threshold in [2u32, 6] {
            let mut t = tracker(threshold);
            for cycle in 1..=threshold {
                assert!(t.record_cycle(true).is_none(), "no event expected at failure {}", cycle);
                assert_eq!(t.state().error_streak, cycle);
            }

            let event = t.record_cycle(true).expect("down event");
            assert_eq!(event.new_state, LinkState::Down);
            assert_eq!(event.counter_id, 167);
            assert_eq!(t.link_state(), LinkState::Down);
            assert_eq!(t.state().last_transition, Some(event.timestamp));

            /* further failures stay silent */
            for _ in 0..5 {
                assert!(t.record_cycle(true).is_none());
            }
            assert_eq!(t.state().error_streak, threshold + 6);
        }
    }

    #[test]
    fn test_success_restores_link() {
        let mut t = tracker(2);
        for _ in 0..3 {
            t.record_cycle(true);
        }
        assert_eq!(t.link_state(), LinkState::Down);

        let event = t.record_cycle(false).expect("restore event");
        assert_eq!(event.new_state, LinkState::Up);
        assert_eq!(t.state().error_streak, 0);

        assert!(t.record_cycle(false).is_none());
    }

    #[test]
    fn test_success_below_threshold_is_silent() {
        let mut t = tracker(2);
        assert!(t.record_cycle(true).is_none());
        assert!(t.record_cycle(true).is_none());
        assert!(t.record_cycle(false).is_none());
        assert_eq!(t.state().error_streak, 0);
        assert!(t.state().last_transition.is_none());

        /* the streak starts over */
        assert!(t.record_cycle(true).is_none());
        assert!(t.record_cycle(true).is_none());
        assert!(t.record_cycle(true).is_some());
    }

    #[test]
    fn test_zero_threshold() {
        let mut t = tracker(0);
        assert_eq!(t.record_cycle(true).map(|e| e.new_state), Some(LinkState::Down));
        assert_eq!(t.record_cycle(false).map(|e| e.new_state), Some(LinkState::Up));
    }

    #[test]
    fn test_event_carries_endpoint() {
        let mut t = tracker(0);
        t.set_endpoint(Some("172.16.5.11:502".to_string()));
        let event = t.record_cycle(true).unwrap();
        assert_eq!(event.endpoint.as_deref(), Some("172.16.5.11:502"));
        assert_eq!(event.meter_name, "ContadorTeste");
        assert_eq!(event.company_id, "ACME");
    }
}
