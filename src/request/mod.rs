//! The request data model (`RequestConfig`, `QueueEntry`) and the typestate
//! lifecycle (`Dispatch<T>`) the processor drives an entry through.

pub mod codec;
pub mod transitions;
pub mod types;

pub use transitions::Resolution;
pub use types::{
    AnyDispatch, Aborted, Backoff, Body, Completed, Dispatch, Failed, IdentifierSnapshot,
    InFlight, Method, Pending, QueryValue, QueueEntry, QueueingPolicy, Request, RequestConfig,
    RequestId, RequestState, RetryPolicy,
};
