pub use retry::{RetryIter, RetryPolicy};

mod retry;
