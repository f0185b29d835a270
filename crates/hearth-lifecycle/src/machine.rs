//! Pure lifecycle state machine: `(state, event) -> (next, actions)`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    Draining,
    Exiting,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Exiting => write!(f, "exiting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Daemon restart: leave workloads running.
    Quiesce,
    /// Host going down: stop every workload within the drain countdown.
    HostShutdown,
    /// Dump a memory profile, nothing else.
    Diagnostic,
    /// The drain engine has stopped or killed everything.
    DrainFinished { timed_out: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stop taking new API connections; in-flight requests finish.
    StopAccepting,
    BeginDrain,
    DumpMemoryProfile,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: LifecycleState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn to(next: LifecycleState, actions: &[Action]) -> Self {
        Self {
            next,
            actions: actions.to_vec(),
        }
    }

    fn stay(state: LifecycleState) -> Self {
        Self::to(state, &[])
    }
}

pub fn step(state: LifecycleState, event: LifecycleEvent) -> Transition {
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (state, event) {
        (S::Exiting, _) => Transition::stay(S::Exiting),

        (S::Running, E::Quiesce) => {
            Transition::to(S::Exiting, &[Action::StopAccepting, Action::Exit])
        }
        (S::Running, E::HostShutdown) => {
            Transition::to(S::Draining, &[Action::StopAccepting, Action::BeginDrain])
        }
        (S::Running, E::DrainFinished { .. }) => Transition::stay(S::Running),

        // A drain already owns the shutdown; repeats and restarts are no-ops.
        (S::Draining, E::HostShutdown | E::Quiesce) => Transition::stay(S::Draining),
        (S::Draining, E::DrainFinished { .. }) => Transition::to(S::Exiting, &[Action::Exit]),

        (s, E::Diagnostic) => Transition::to(s, &[Action::DumpMemoryProfile]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    #[test]
    fn quiesce_exits_without_draining() {
        let t = step(S::Running, E::Quiesce);
        assert_eq!(t.next, S::Exiting);
        assert_eq!(t.actions, vec![Action::StopAccepting, Action::Exit]);
        assert!(!t.actions.contains(&Action::BeginDrain));
    }

    #[test]
    fn host_shutdown_drains_once() {
        let t = step(S::Running, E::HostShutdown);
        assert_eq!(t.next, S::Draining);
        assert!(t.actions.contains(&Action::BeginDrain));

        let again = step(S::Draining, E::HostShutdown);
        assert_eq!(again, Transition::stay(S::Draining));
    }

    #[test]
    fn quiesce_is_ignored_while_draining() {
        assert_eq!(step(S::Draining, E::Quiesce), Transition::stay(S::Draining));
    }

    #[test]
    fn drain_completion_exits() {
        for timed_out in [false, true] {
            let t = step(S::Draining, E::DrainFinished { timed_out });
            assert_eq!(t.next, S::Exiting);
            assert_eq!(t.actions, vec![Action::Exit]);
        }
    }

    #[test]
    fn diagnostic_keeps_state() {
        for s in [S::Running, S::Draining] {
            let t = step(s, E::Diagnostic);
            assert_eq!(t.next, s);
            assert_eq!(t.actions, vec![Action::DumpMemoryProfile]);
        }
    }

    #[test]
    fn exiting_is_terminal() {
        for e in [
            E::Quiesce,
            E::HostShutdown,
            E::Diagnostic,
            E::DrainFinished { timed_out: false },
        ] {
            assert_eq!(step(S::Exiting, e), Transition::stay(S::Exiting));
        }
    }
}
