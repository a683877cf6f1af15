use std::fmt;
use std::sync::Arc;

use crate::crawler::context::Context;
use crate::http::Request;

/// A per-task callback run after the response hooks
pub type Handler = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One unit of scheduled work: a request and the handlers for its outcome
#[derive(Clone)]
pub struct Task {
    pub request: Request,
    pub handlers: Vec<Handler>,
}

impl Task {
    pub fn new(request: Request, handlers: Vec<Handler>) -> Self {
        Self { request, handlers }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("request", &self.request.describe())
            .field("depth", &self.request.get_depth())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
