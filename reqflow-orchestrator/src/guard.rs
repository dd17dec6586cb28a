//! Panic containment for spawned work.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use reqflow_core::{ReqflowError, Result};

/// Await a fallible future, turning a panic into `ReqflowError::Internal`
pub(crate) async fn catch_panic<T, F>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "Task panicked");
            Err(ReqflowError::internal(format!("task panicked: {}", message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_results_through() {
        assert_eq!(catch_panic(async { Ok(3) }).await, Ok(3));
        assert_eq!(
            catch_panic(async { Err::<(), _>(ReqflowError::backend("down")) }).await,
            Err(ReqflowError::backend("down"))
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let result = catch_panic(async {
            if true {
                panic!("exploded");
            }
            Ok(())
        })
        .await;

        match result {
            Err(ReqflowError::Internal(message)) => assert!(message.contains("exploded")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
