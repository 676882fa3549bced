//! Helpers to split a large job into many enqueued tasks and collect their
//! results.

use crate::client::HubClient;
use kirosu_core::Task;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub struct TaskSplitter {
    client: HubClient,
}

impl TaskSplitter {
    pub fn new(client: HubClient) -> Self {
        Self { client }
    }

    /// Batch `items` into prompts via a `{item}` template and enqueue one
    /// task per batch. Returns the enqueued task ids in order.
    pub async fn split_and_enqueue(
        &mut self,
        items: &[String],
        prompt_template: &str,
        batch_size: usize,
        task_type: &str,
    ) -> anyhow::Result<Vec<i64>> {
        let batch_size = batch_size.max(1);
        let mut task_ids = Vec::new();
        for batch in items.chunks(batch_size) {
            let prompt = render_prompt(prompt_template, &batch.join("\n---\n"));
            let task_id = self.client.enqueue(&prompt, None, Some(task_type)).await?;
            task_ids.push(task_id);
        }
        Ok(task_ids)
    }

    /// Poll `list(done)` until every id in `task_ids` has completed.
    ///
    /// Tasks that end up `failed` are not collected here; callers watching
    /// for failure should inspect `stats` or `list(failed)` themselves.
    pub async fn wait_for_completion(
        &mut self,
        task_ids: &[i64],
        poll_interval: Duration,
    ) -> anyhow::Result<BTreeMap<i64, Task>> {
        let mut pending: BTreeSet<i64> = task_ids.iter().copied().collect();
        let mut results = BTreeMap::new();

        while !pending.is_empty() {
            let (tasks, _) = self.client.list(Some("done"), 1000).await?;
            for task in tasks {
                if pending.remove(&task.task_id) {
                    results.insert(task.task_id, task);
                }
            }
            if !pending.is_empty() {
                tokio::time::sleep(poll_interval).await;
            }
        }

        Ok(results)
    }
}

fn render_prompt(template: &str, item: &str) -> String {
    template.replace("{item}", item)
}
