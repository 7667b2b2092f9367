//! Work handler function type

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::WorkItem;

/// Work execution result
pub type WorkResult = Result<serde_json::Value, String>;

/// Work handler function type
pub type WorkHandler = Arc<
    dyn Fn(WorkItem) -> Pin<Box<dyn Future<Output = WorkResult> + Send>> + Send + Sync,
>;

/// Wrap an async closure as a [`WorkHandler`]
///
/// # Example
///
/// ```
/// use taskmesh_dispatch::work::handler_fn;
/// use serde_json::json;
///
/// let handler = handler_fn(|item| async move {
///     Ok(json!({"group": item.group}))
/// });
/// ```
pub fn handler_fn<F, Fut>(handler: F) -> WorkHandler
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(move |item| Box::pin(handler(item)))
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handler_fn_runs_closure() {
        let handler = handler_fn(|item| async move { Ok(json!({"group": item.group})) });
        let result = handler(WorkItem::new("g", json!(null))).await;
        assert_eq!(result, Ok(json!({"group": "g"})));
    }

    #[test]
    fn test_panic_message_variants() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom");

        let caught = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "code 7");
    }
}
