/// Execute an aggregate command deterministically (no IO, no async).
///
/// 1. **Decide**: `aggregate.handle(command)` produces events without mutation.
/// 2. **Evolve**: each event is applied via `aggregate.apply(event)`.
///
/// On error nothing is applied, so the aggregate is untouched. An empty event
/// list (idempotent no-op) leaves the version unchanged.
///
/// Use this for in-process work and tests; `CommandDispatcher` in the infra
/// crate adds persistence, optimistic concurrency and publication.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: stockroom_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
