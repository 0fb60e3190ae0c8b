//! Lowering errors

use thiserror::Error;

pub type LowerResult<T> = Result<T, LowerError>;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("local `{name}` is pinned and cannot be stored across a suspension point")]
    PinnedCapture { name: String },

    #[error("host function {index} is not declared in the module host table")]
    UnknownHostFunction { index: u32 },

    #[error("suspension point in non-suspendable function `{function}`")]
    SuspendOutsideSuspendable { function: String },

    #[error("function `{function}` has no suspendable flavor to lower")]
    NotSuspendable { function: String },

    #[error("awaiting suspension point {point} in `{function}` has no resumption destination")]
    MissingResumeDestination { function: String, point: u32 },

    #[error("block {block} referenced by `{function}` does not exist")]
    UnknownBlock { function: String, block: u32 },

    #[error("local {local} referenced by `{function}` does not exist")]
    UnknownLocal { function: String, local: u32 },

    #[error("region {region} in `{function}` is not properly nested")]
    MalformedRegion { function: String, region: u32 },

    #[error("internal lowering error: {message}")]
    Internal { message: String },
}
