pub mod dispatch;
pub mod modify;
pub mod pipeline;
pub mod search;

pub use dispatch::{ChangeDispatcher, ChangeKind, ChangeListener, ChangeNotification};
pub use modify::Modification;
pub use pipeline::{
    AllowAll, Authorizer, CommittedOperation, OperationContext, OperationFailure, OperationKind,
    OperationPipeline, OperationStage,
};
pub use search::{SearchOutcome, SearchRequest, SearchResult, TruncationReason};
