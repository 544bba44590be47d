use super::{Projection, ReducerRegistry, StatementExecutor};
use crate::errors::{HandlerError, HandlerResult};
use crate::event::Event;
use crate::handler::Handler;
use crate::types::AggregateType;
use async_trait::async_trait;
use tracing::{instrument, trace};

/// Runs a [`Projection`] as a spooled handler.
pub struct ProjectionHandler<P, X> {
    projection: P,
    registry: ReducerRegistry,
    executor: X,
}

impl<P: Projection, X: StatementExecutor> ProjectionHandler<P, X> {
    /// Resolves the projection's reducers once and binds them to `executor`.
    pub fn new(projection: P, executor: X) -> Self {
        let registry = ReducerRegistry::new(&projection);
        Self {
            projection,
            registry,
            executor,
        }
    }

    /// The wrapped projection.
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}

impl<P, X> std::fmt::Debug for ProjectionHandler<P, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHandler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<P: Projection, X: StatementExecutor> Handler for ProjectionHandler<P, X> {
    fn name(&self) -> &str {
        self.projection.name()
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        self.registry.aggregate_types().to_vec()
    }

    #[instrument(
        name = "projection.reduce",
        skip(self, event),
        fields(projection = self.projection.name(), sequence = %event.sequence, event_type = %event.event_type)
    )]
    async fn reduce(&self, event: &Event) -> HandlerResult<()> {
        let statement = self.registry.reduce(event)?;
        if statement.kind.is_no_op() {
            trace!("no statement for event");
            return Ok(());
        }
        self.executor
            .execute(&statement)
            .await
            .map_err(HandlerError::internal)
    }
}
