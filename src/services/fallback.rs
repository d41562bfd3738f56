//! Ordered fallback evaluation
//!
//! Several parts of the system try a fixed list of strategies (API paths,
//! listing actions, URL conventions) and keep the first that works. The list
//! stays plain data; this combinator only supplies the evaluation order.

use futures::future::BoxFuture;
use std::fmt::Display;

/// Outcome of one attempt
pub enum Attempt<T> {
    /// Candidate produced a usable result
    Success(T),
    /// Candidate answered but with nothing usable
    Empty,
    /// Candidate failed; the reason is logged and the next one is tried
    Failed(String),
}

impl<T, E: Display> From<Result<Option<T>, E>> for Attempt<T> {
    fn from(result: Result<Option<T>, E>) -> Self {
        match result {
            Ok(Some(value)) => Attempt::Success(value),
            Ok(None) => Attempt::Empty,
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }
}

/// Evaluate `attempt` for each candidate strictly in order and return the first
/// success together with the candidate that produced it.
///
/// Attempts are boxed so callers borrowing their context still produce a
/// `Send` future for spawned tasks and handlers.
pub async fn first_success<'a, C, T, F>(
    candidates: impl IntoIterator<Item = C>,
    mut attempt: F,
) -> Option<(C, T)>
where
    C: Clone + Display,
    F: FnMut(C) -> BoxFuture<'a, Attempt<T>>,
{
    for candidate in candidates {
        match attempt(candidate.clone()).await {
            Attempt::Success(value) => return Some((candidate, value)),
            Attempt::Empty => {
                tracing::debug!(candidate = %candidate, "fallback candidate yielded nothing");
            }
            Attempt::Failed(reason) => {
                tracing::debug!(candidate = %candidate, reason = %reason, "fallback candidate failed");
            }
        }
    }
    None
}
