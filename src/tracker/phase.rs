use crate::traits::MealyMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Event {
    StartRequested,
    StopRequested,
    WorkerExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Command {
    OpenLogSink,
    SpawnWorker,
    SignalCancel,
    AwaitWorker,
}

impl MealyMachine for Phase {
    type Event = Event;
    type Command = Command;

    fn transition(self, event: Event) -> (Self, Vec<Command>) {
        match (self, event) {
            (Phase::Idle, Event::StartRequested) => (
                Phase::Running,
                vec![Command::OpenLogSink, Command::SpawnWorker],
            ),
            (Phase::Running, Event::StopRequested) => (
                Phase::Stopping,
                vec![Command::SignalCancel, Command::AwaitWorker],
            ),
            (Phase::Running | Phase::Stopping, Event::WorkerExited) => (Phase::Idle, vec![]),
            (Phase::Running | Phase::Stopping, Event::StartRequested)
            | (Phase::Idle | Phase::Stopping, Event::StopRequested)
            | (Phase::Idle, Event::WorkerExited) => (self, vec![]),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Idle),
            Just(Phase::Running),
            Just(Phase::Stopping),
        ]
    }

    fn arb_event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::StartRequested),
            Just(Event::StopRequested),
            Just(Event::WorkerExited),
        ]
    }

    #[test]
    fn full_lifecycle() {
        let (phase, cmds) = Phase::Idle.transition(Event::StartRequested);
        assert_eq!(phase, Phase::Running);
        assert_eq!(cmds, vec![Command::OpenLogSink, Command::SpawnWorker]);

        let (phase, cmds) = phase.transition(Event::StopRequested);
        assert_eq!(phase, Phase::Stopping);
        assert_eq!(cmds, vec![Command::SignalCancel, Command::AwaitWorker]);

        let (phase, cmds) = phase.transition(Event::WorkerExited);
        assert_eq!(phase, Phase::Idle);
        assert!(cmds.is_empty());
    }

    #[test]
    fn stop_while_idle_is_noop() {
        let (phase, cmds) = Phase::Idle.transition(Event::StopRequested);
        assert_eq!(phase, Phase::Idle);
        assert!(cmds.is_empty());
    }

    proptest! {
        #[test]
        fn start_while_active_spawns_nothing(
            phase in prop_oneof![Just(Phase::Running), Just(Phase::Stopping)],
        ) {
            let (next, cmds) = phase.transition(Event::StartRequested);
            prop_assert_eq!(next, phase);
            prop_assert!(!cmds.contains(&Command::SpawnWorker));
        }

        #[test]
        fn at_most_one_worker_alive(events in prop::collection::vec(arb_event(), 0..32)) {
            let mut phase = Phase::Idle;
            let mut alive = 0i32;
            for event in events {
                let (next, cmds) = phase.transition(event);
                alive += cmds.iter().filter(|c| **c == Command::SpawnWorker).count() as i32;
                if event == Event::WorkerExited && phase != Phase::Idle {
                    alive -= 1;
                }
                prop_assert!((0..=1).contains(&alive), "{} workers after {:?}", alive, event);
                phase = next;
            }
        }

        #[test]
        fn worker_exit_always_lands_idle(phase in arb_phase()) {
            let (next, _) = phase.transition(Event::WorkerExited);
            prop_assert_eq!(next, Phase::Idle);
        }
    }
}
