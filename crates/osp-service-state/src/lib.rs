//! Service lifecycle state machine shared by the listener (discovery) and
//! publisher (protocol connection server) roles (spec §4.B).
//!
//! Decouples the externally visible [`ServiceState`] from the asynchronous
//! progress of the underlying service work: a command either invokes the
//! delegate's matching action and, for `Start`/`StartAndSuspend`/`Stop`,
//! moves to the relevant "in transit" state immediately, or it is rejected
//! outright with no side effect.

/// ∈ {Stopped, Starting, Running, Suspended, Stopping}. Initial = Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Suspended,
    Stopping,
}

impl ServiceState {
    /// Whether `self -> to` is one of the arrows in spec.md §4.B's table.
    #[must_use]
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::{Running, Starting, Stopped, Stopping, Suspended};
        matches!(
            (self, to),
            (Stopped, Starting | Stopping)
                | (Starting, Running | Suspended | Stopping)
                | (Running, Suspended | Stopping)
                | (Suspended, Running | Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// The asynchronous action a command delegates to. Implementations may
/// complete later by calling [`ServiceStateMachine::set_state`] — the
/// command methods here only *start* the work.
pub trait ServiceDelegate {
    fn start(&mut self);
    fn start_and_suspend(&mut self);
    fn stop(&mut self);
    fn suspend(&mut self);
    fn resume(&mut self);
}

/// Notified synchronously from within [`ServiceStateMachine::set_state`]
/// (spec §5: "Observer notifications from the service state machine happen
/// synchronously within the `SetState` call").
pub trait ServiceObserver {
    fn on_started(&mut self) {}
    fn on_stopped(&mut self) {}
    fn on_suspended(&mut self) {}
}

/// A [`ServiceObserver`] that does nothing, for delegates that don't need
/// one.
#[derive(Debug, Default)]
pub struct NullObserver;
impl ServiceObserver for NullObserver {}

pub struct ServiceStateMachine<D: ServiceDelegate, O: ServiceObserver> {
    state: ServiceState,
    delegate: D,
    observer: O,
}

impl<D: ServiceDelegate, O: ServiceObserver> ServiceStateMachine<D, O> {
    pub fn new(delegate: D, observer: O) -> Self {
        Self {
            state: ServiceState::Stopped,
            delegate,
            observer,
        }
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Command: `Start`. Valid only from `Stopped`.
    pub fn start(&mut self) -> bool {
        if self.state != ServiceState::Stopped {
            tracing::debug!(?self.state, "Start rejected");
            return false;
        }
        self.delegate.start();
        self.state = ServiceState::Starting;
        true
    }

    /// Command: `StartAndSuspend`. Valid only from `Stopped`.
    pub fn start_and_suspend(&mut self) -> bool {
        if self.state != ServiceState::Stopped {
            tracing::debug!(?self.state, "StartAndSuspend rejected");
            return false;
        }
        self.delegate.start_and_suspend();
        self.state = ServiceState::Starting;
        true
    }

    /// Command: `Stop`. Rejected when already `Stopped` or `Stopping`
    /// (spec §8 idempotence: duplicate `Stop` calls return `false` and do
    /// not invoke the delegate's stop action twice).
    pub fn stop(&mut self) -> bool {
        if matches!(self.state, ServiceState::Stopped | ServiceState::Stopping) {
            tracing::debug!(?self.state, "Stop rejected");
            return false;
        }
        self.delegate.stop();
        self.state = ServiceState::Stopping;
        true
    }

    /// Command: `Suspend`. Valid only from `Running`.
    pub fn suspend(&mut self) -> bool {
        if self.state != ServiceState::Running {
            tracing::debug!(?self.state, "Suspend rejected");
            return false;
        }
        self.delegate.suspend();
        true
    }

    /// Command: `Resume`. Valid only from `Suspended`.
    pub fn resume(&mut self) -> bool {
        if self.state != ServiceState::Suspended {
            tracing::debug!(?self.state, "Resume rejected");
            return false;
        }
        self.delegate.resume();
        true
    }

    /// Called by the delegate once the asynchronous work it started has
    /// actually reached `new_state`. Validates the transition against
    /// spec.md §4.B's table, notifies the observer, and updates `state()`.
    ///
    /// An illegal transition is a programming error (spec §7): debug builds
    /// assert, release builds log and no-op rather than leave the machine in
    /// an inconsistent state.
    pub fn set_state(&mut self, new_state: ServiceState) {
        if !self.state.can_transition_to(new_state) {
            debug_assert!(
                false,
                "illegal service state transition {:?} -> {:?}",
                self.state, new_state
            );
            tracing::error!(from = ?self.state, to = ?new_state, "illegal service state transition ignored");
            return;
        }
        self.state = new_state;
        match new_state {
            ServiceState::Running => self.observer.on_started(),
            ServiceState::Stopped => self.observer.on_stopped(),
            ServiceState::Suspended => self.observer.on_suspended(),
            ServiceState::Starting | ServiceState::Stopping => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingDelegate {
        start_calls: u32,
        start_and_suspend_calls: u32,
        stop_calls: u32,
        suspend_calls: u32,
        resume_calls: u32,
    }

    impl ServiceDelegate for CountingDelegate {
        fn start(&mut self) {
            self.start_calls += 1;
        }
        fn start_and_suspend(&mut self) {
            self.start_and_suspend_calls += 1;
        }
        fn stop(&mut self) {
            self.stop_calls += 1;
        }
        fn suspend(&mut self) {
            self.suspend_calls += 1;
        }
        fn resume(&mut self) {
            self.resume_calls += 1;
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        started: u32,
        stopped: u32,
        suspended: u32,
    }

    impl ServiceObserver for CountingObserver {
        fn on_started(&mut self) {
            self.started += 1;
        }
        fn on_stopped(&mut self) {
            self.stopped += 1;
        }
        fn on_suspended(&mut self) {
            self.suspended += 1;
        }
    }

    // Scenario 1 (spec §8): normal listener lifecycle.
    #[test]
    fn normal_listener_lifecycle() {
        let mut sm = ServiceStateMachine::new(CountingDelegate::default(), CountingObserver::default());
        assert_eq!(sm.state(), ServiceState::Stopped);

        assert!(sm.start());
        assert_eq!(sm.state(), ServiceState::Starting);
        assert_eq!(sm.delegate_mut().start_calls, 1);

        assert!(!sm.start(), "second Start should be rejected");
        assert_eq!(sm.delegate_mut().start_calls, 1, "delegate not invoked twice");

        sm.set_state(ServiceState::Running);
        assert_eq!(sm.state(), ServiceState::Running);
        assert_eq!(sm.observer_mut().started, 1);

        assert!(sm.stop());
        assert_eq!(sm.state(), ServiceState::Stopping);

        sm.set_state(ServiceState::Stopped);
        assert_eq!(sm.observer_mut().stopped, 1);
    }

    // Scenario 2 (spec §8): start-suspended publisher.
    #[test]
    fn start_suspended_publisher() {
        let mut sm = ServiceStateMachine::new(CountingDelegate::default(), CountingObserver::default());
        assert!(sm.start_and_suspend());
        assert_eq!(sm.state(), ServiceState::Starting);

        sm.set_state(ServiceState::Suspended);
        assert_eq!(sm.observer_mut().suspended, 1);
        assert_eq!(sm.observer_mut().started, 0, "never passed through Running");

        assert!(!sm.start(), "Start rejected once not Stopped");
    }

    // Idempotence (spec §8): duplicate Stop calls.
    #[test]
    fn duplicate_stop_is_idempotent() {
        let mut sm = ServiceStateMachine::new(CountingDelegate::default(), CountingObserver::default());
        sm.start();
        sm.set_state(ServiceState::Running);

        assert!(sm.stop());
        assert_eq!(sm.delegate_mut().stop_calls, 1);
        assert!(!sm.stop());
        assert_eq!(sm.delegate_mut().stop_calls, 1, "delegate stop not invoked twice");
    }

    #[test]
    fn suspend_resume_round_trip_from_running() {
        let mut sm = ServiceStateMachine::new(CountingDelegate::default(), CountingObserver::default());
        sm.start();
        sm.set_state(ServiceState::Running);

        assert!(sm.suspend());
        assert_eq!(sm.state(), ServiceState::Running, "no eager transition on Suspend");
        sm.set_state(ServiceState::Suspended);
        assert_eq!(sm.observer_mut().suspended, 1);

        assert!(!sm.suspend(), "Suspend only valid from Running");
        assert!(sm.resume());
        sm.set_state(ServiceState::Running);
        assert_eq!(sm.observer_mut().started, 2, "Running entered twice total");
    }

    #[test]
    fn commands_requiring_a_running_service_are_rejected_while_stopped() {
        let mut sm = ServiceStateMachine::new(CountingDelegate::default(), CountingObserver::default());
        assert!(!sm.suspend());
        assert!(!sm.resume());
        assert!(!sm.stop(), "Stop while already Stopped is rejected");
        assert_eq!(sm.delegate_mut().stop_calls, 0);
    }

    #[test]
    fn state_table_matches_spec() {
        use ServiceState::{Running, Starting, Stopped, Stopping, Suspended};
        assert!(Stopped.can_transition_to(Starting));
        assert!(Stopped.can_transition_to(Stopping));
        assert!(!Stopped.can_transition_to(Running));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Suspended));
        assert!(Starting.can_transition_to(Stopping));
        assert!(!Starting.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Suspended));
        assert!(Running.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Starting));
        assert!(Suspended.can_transition_to(Running));
        assert!(Suspended.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Running));
    }
}
