use std::mem;

use serde::Serialize;
use uuid::Uuid;

use crate::crawler::scheduler::Item;
use crate::crawler::task::{Handler, Task};
use crate::http::{Meta, Request, Response};

/// Per-task scratchpad, owned by the worker executing the task
///
/// Handlers read the request and response from here and push follow-up
/// tasks and items into it. Everything pushed is drained back into the
/// scheduler once the task finishes, whether it succeeded or not.
pub struct Context {
    id: Uuid,
    request: Request,
    response: Option<Response>,
    tasks: Vec<Task>,
    items: Vec<Item>,
    meta: Meta,
    handlers: Vec<Handler>,
    aborted: bool,
}

impl Context {
    pub fn new(request: Request, handlers: Vec<Handler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            meta: request.meta().clone(),
            request,
            response: None,
            tasks: Vec::new(),
            items: Vec::new(),
            handlers,
            aborted: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    /// The handlers this task was created with
    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    /// Queue a follow-up task. Relative URLs and depth are resolved
    /// against this task once it finishes.
    pub fn add_task(&mut self, request: Request, handlers: Vec<Handler>) {
        self.tasks.push(Task::new(request, handlers));
    }

    pub fn add_item(&mut self, item: Item) {
        self.items.push(item);
    }

    /// Serialize any value into an item. Values that cannot be represented
    /// as JSON are dropped and `false` is returned.
    pub fn add_serialized<T: Serialize>(&mut self, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(item) => {
                self.items.push(item);
                true
            }
            Err(_) => false,
        }
    }

    /// Stop the remaining response hooks and handlers of this task
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = request;
    }

    pub(crate) fn set_response(&mut self, response: Response) {
        self.meta = response.meta().clone();
        self.response = Some(response);
    }

    pub(crate) fn take_tasks(&mut self) -> Vec<Task> {
        mem::take(&mut self.tasks)
    }

    pub(crate) fn take_items(&mut self) -> Vec<Item> {
        mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_collects_output() {
        let mut request = Request::get("http://example.com/");
        request.meta_mut().insert("tag", "seed");

        let mut ctx = Context::new(request, Vec::new());
        assert_eq!(ctx.meta().get_as::<String>("tag").as_deref(), Some("seed"));

        ctx.add_task(Request::get("/next"), Vec::new());
        ctx.add_item(json!({"title": "home"}));
        assert!(ctx.add_serialized(&vec![1, 2]));

        assert_eq!(ctx.tasks().len(), 1);
        assert_eq!(ctx.items().len(), 2);
        assert!(!ctx.is_aborted());
        ctx.abort();
        assert!(ctx.is_aborted());

        assert_eq!(ctx.take_tasks().len(), 1);
        assert!(ctx.tasks().is_empty());
        assert_eq!(ctx.take_items(), vec![json!({"title": "home"}), json!([1, 2])]);
    }
}
