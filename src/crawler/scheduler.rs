use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

use crate::crawler::task::Task;
use crate::error::CrawlError;

/// A result produced by a task
pub type Item = serde_json::Value;

/// Pop order of pending tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerOrder {
    /// Queue discipline: tasks run in the order they were added
    #[default]
    BreadthFirst,
    /// Stack discipline: the newest task runs first
    DepthFirst,
}

/// Storage for pending tasks and finished items
///
/// Pops never block. The engine handles waiting when both queues are empty,
/// so implementations backed by an external store need no wakeup support.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn add_task(&self, task: Task) -> Result<(), CrawlError>;

    async fn get_task(&self) -> Result<Option<Task>, CrawlError>;

    async fn add_item(&self, item: Item) -> Result<(), CrawlError>;

    async fn get_item(&self) -> Result<Option<Item>, CrawlError>;

    async fn is_task_empty(&self) -> bool;

    async fn is_item_empty(&self) -> bool;
}

/// In-process scheduler
pub struct MemoryScheduler {
    order: SchedulerOrder,
    tasks: Mutex<VecDeque<Task>>,
    items: Mutex<VecDeque<Item>>,
}

impl MemoryScheduler {
    pub fn new(order: SchedulerOrder) -> Self {
        Self {
            order,
            tasks: Mutex::new(VecDeque::new()),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn order(&self) -> SchedulerOrder {
        self.order
    }

    pub async fn task_len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new(SchedulerOrder::BreadthFirst)
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn add_task(&self, task: Task) -> Result<(), CrawlError> {
        trace!("Queueing {:?}", task);
        let mut tasks = self.tasks.lock().await;
        match self.order {
            SchedulerOrder::BreadthFirst => tasks.push_back(task),
            SchedulerOrder::DepthFirst => tasks.push_front(task),
        }
        Ok(())
    }

    async fn get_task(&self) -> Result<Option<Task>, CrawlError> {
        Ok(self.tasks.lock().await.pop_front())
    }

    async fn add_item(&self, item: Item) -> Result<(), CrawlError> {
        self.items.lock().await.push_back(item);
        Ok(())
    }

    async fn get_item(&self) -> Result<Option<Item>, CrawlError> {
        Ok(self.items.lock().await.pop_front())
    }

    async fn is_task_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    async fn is_item_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use serde_json::json;

    fn task(path: &str) -> Task {
        Task::new(Request::get(&format!("http://example.com{}", path)), vec![])
    }

    async fn drain(scheduler: &MemoryScheduler) -> Vec<String> {
        let mut paths = Vec::new();
        while let Some(task) = scheduler.get_task().await.unwrap() {
            paths.push(task.request.url().unwrap().path().to_string());
        }
        paths
    }

    #[tokio::test]
    async fn test_breadth_first_is_fifo() {
        let scheduler = MemoryScheduler::default();
        for path in ["/a", "/b", "/c"] {
            scheduler.add_task(task(path)).await.unwrap();
        }
        assert_eq!(drain(&scheduler).await, vec!["/a", "/b", "/c"]);
        assert!(scheduler.is_task_empty().await);
    }

    #[tokio::test]
    async fn test_depth_first_is_lifo() {
        let scheduler = MemoryScheduler::new(SchedulerOrder::DepthFirst);
        for path in ["/a", "/b", "/c"] {
            scheduler.add_task(task(path)).await.unwrap();
        }
        assert_eq!(scheduler.task_len().await, 3);
        assert_eq!(drain(&scheduler).await, vec!["/c", "/b", "/a"]);
    }

    #[tokio::test]
    async fn test_items_are_fifo_in_both_orders() {
        let scheduler = MemoryScheduler::new(SchedulerOrder::DepthFirst);
        scheduler.add_item(json!(1)).await.unwrap();
        scheduler.add_item(json!(2)).await.unwrap();

        assert!(!scheduler.is_item_empty().await);
        assert_eq!(scheduler.get_item().await.unwrap(), Some(json!(1)));
        assert_eq!(scheduler.get_item().await.unwrap(), Some(json!(2)));
        assert_eq!(scheduler.get_item().await.unwrap(), None);
    }
}
