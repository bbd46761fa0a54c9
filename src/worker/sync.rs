use crate::events::LocalEventPayload;
use crate::orchestrator::queues::SyncQueueData;

use super::Worker;

impl Worker {
    /// Empties the cross-thread queue in arrival order.
    pub(super) fn drain_events(&mut self) {
        while let Some(event) = self.event_queue.pop() {
            self.logger.trace(
                None,
                &format!(
                    "handling {} event queued at {}",
                    event.kind().as_str(),
                    event.timestamp
                ),
            );
            match event.payload {
                LocalEventPayload::SyncQueueRequest(data) => self.apply_sync(data),
                LocalEventPayload::VoteNotify => self.on_leader_change(),
            }
        }
    }

    fn apply_sync(&mut self, data: SyncQueueData) {
        match self.queues.get_or_create(&data.queue_name) {
            Ok((queue, created)) => {
                queue.update(&data);
                if created {
                    self.logger
                        .info(None, &format!("created queue '{}'", data.queue_name));
                }
            }
            Err(error) => self
                .logger
                .warn(None, &format!("ignoring sync request: {error}")),
        }
    }
}
