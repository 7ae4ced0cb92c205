/// A Mealy machine: `(State, Event) → (State, Vec<Command>)`.
///
/// The tracker lifecycle is expressed this way so its transitions can be
/// tested without spawning a worker.
pub trait MealyMachine: Sized {
    type Event;
    type Command;
    fn transition(self, event: Self::Event) -> (Self, Vec<Self::Command>);
}
