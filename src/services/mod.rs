//! Business logic: the routing engine and its collaborators.

pub mod context;
pub mod evaluator;
pub mod provider;
pub mod router;
pub mod scorer;
pub mod task_type;

pub use context::{fit, FitResult};
pub use evaluator::{evaluate, heuristic_score, Evaluation};
pub use provider::{
    DeltaStream, GenerationRequest, HttpProviderAdapter, NormalizedResponse, ProviderAdapter,
    ProviderError,
};
pub use router::{RouteOutcome, RoutedResponse, RoutedStream, RouterEngine, RouterRequest};
pub use scorer::{score_model, ScoreWeights};
pub use task_type::{infer_task_type, resolve_task_type, TaskType};
