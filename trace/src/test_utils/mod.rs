//! Deterministic in-process fakes for the collaborator contracts, shared by the unit and
//! scenario tests.

mod context;
mod exchange;
mod forest;
mod runtime;

pub use context::{
    MockAcrossExecutor, MockEquivalenceSet, MockOperation, MockParentContext, RecordedDependence,
};
pub use exchange::{ExchangeFabric, LoopbackExchange};
pub use forest::{IssuedCopy, IssuedFill, MockForest};
pub use runtime::MockRuntime;
