//! Projection runner utilities (read model builders).
//!
//! Tracks one cursor per aggregate stream so that at-least-once delivery is
//! safe: anything at or below the cursor is a duplicate and is skipped, and a
//! jump past `cursor + 1` means an event was lost.

use std::collections::HashMap;

use stockroom_core::AggregateId;

use crate::{EventEnvelope, Projection};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error("sequence gap on stream {aggregate_id} (last={last}, found={found})")]
    SequenceGap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },

    #[error("sequence number 0 is never assigned (stream {aggregate_id})")]
    ZeroSequence { aggregate_id: AggregateId },
}

/// Outcome of feeding one envelope to the runner.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Duplicate,
}

/// Runs envelopes through a projection and tracks progress per stream.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursors: HashMap<AggregateId, u64>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursors: HashMap::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Last applied sequence number for a stream (0 if none).
    pub fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        self.cursors.get(&aggregate_id).copied().unwrap_or(0)
    }

    /// Apply a single envelope, enforcing gap-free sequencing per stream.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<Applied, ProjectionError> {
        let aggregate_id = envelope.aggregate_id();
        let found = envelope.sequence_number();
        let last = self.cursor(aggregate_id);

        if found == 0 {
            return Err(ProjectionError::ZeroSequence { aggregate_id });
        }
        if found <= last {
            return Ok(Applied::Duplicate);
        }
        if found != last + 1 {
            return Err(ProjectionError::SequenceGap {
                aggregate_id,
                last,
                found,
            });
        }

        self.projection.apply(envelope);
        self.cursors.insert(aggregate_id, found);
        Ok(Applied::Applied)
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(), ProjectionError>
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<Self, ProjectionError>
    where
        P::Ev: 'a,
    {
        let mut runner = ProjectionRunner::new(factory());
        runner.run(envelopes)?;
        Ok(runner)
    }
}
