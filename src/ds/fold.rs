use std::future::Future;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// an [`Advance`] was dropped before `next` or `fail` was called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("continuation dropped without advancing")]
pub struct Abandoned;

/// continuation handed to every fold step.
///
/// calling `next` inside the step keeps the loop going without yielding,
/// calling it later (from another task, a timer, a listener) resumes the
/// loop at the following item.
pub struct Advance<A, E> {
    tx: oneshot::Sender<Result<A, E>>,
}

impl<A, E> Advance<A, E> {
    pub fn next(self, acc: A) {
        let _ = self.tx.send(Ok(acc));
    }

    pub fn fail(self, err: E) {
        let _ = self.tx.send(Err(err));
    }
}

/// asynchronous left fold where every step signals completion explicitly.
///
/// steps are visited strictly in order, a failure stops the fold and the
/// remaining items are never visited. empty input returns `zero` without
/// suspending.
pub async fn fold_left<I, A, E, F, Fut>(items: I, zero: A, mut step: F) -> Result<A, E>
where
    I: IntoIterator,
    F: FnMut(A, I::Item, Advance<A, E>) -> Fut,
    Fut: Future<Output = ()>,
    E: From<Abandoned>,
{
    let mut acc = zero;
    for item in items {
        let (tx, mut rx) = oneshot::channel();
        step(acc, item, Advance { tx }).await;

        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Abandoned.into()),
            },
            Err(TryRecvError::Closed) => return Err(Abandoned.into()),
        };
        acc = outcome?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use std::{sync::{atomic::{AtomicUsize, Ordering}, Arc}, time::Duration};
    use super::{fold_left, Abandoned};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Abandoned,
        Stop(usize),
    }

    impl From<Abandoned> for TestError {
        fn from(_: Abandoned) -> Self {
            Self::Abandoned
        }
    }

    #[tokio::test]
    async fn sync_advance() {
        let sum = fold_left(1..=100usize, 0usize, |acc, n, advance| async move {
            advance.next(acc + n);
        }).await;
        assert_eq!(sum, Ok::<_, TestError>(5050));
    }

    #[tokio::test]
    async fn empty_returns_zero() {
        let out = fold_left(Vec::<u8>::new(), 7u8, |_, _, advance| async move {
            advance.fail(TestError::Stop(0));
        }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn deferred_advance() {
        let out = fold_left(vec!["a", "b", "c"], String::new(), |mut acc, s, advance| async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                acc.push_str(s);
                advance.next(acc);
            });
        }).await;
        assert_eq!(out, Ok::<_, TestError>("abc".to_string()));
    }

    #[tokio::test]
    async fn failure_short_circuits() {
        let visited = Arc::new(AtomicUsize::new(0));
        let counter = visited.clone();
        let out = fold_left(0..10usize, 0usize, move |acc, n, advance| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if n == 3 {
                    advance.fail(TestError::Stop(n));
                } else {
                    advance.next(acc + 1);
                }
            }
        }).await;

        assert_eq!(out, Err(TestError::Stop(3)));
        assert_eq!(visited.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn dropped_advance_is_abandoned() {
        let out = fold_left([1, 2], 0, |acc, n, advance| async move {
            if n == 2 {
                drop(advance);
                return;
            }
            advance.next(acc + n);
        }).await;
        assert_eq!(out, Err(TestError::Abandoned));
    }
}
