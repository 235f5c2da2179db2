use prometheus::{IntCounter, IntGauge, Opts, Registry};

pub struct ChunkGenMetrics {
    pub chunks_requested: IntCounter,
    pub chunks_served: IntCounter,
    pub chunks_canceled: IntCounter,
    pub chunks_timed_out: IntCounter,
    pub active: IntGauge,
    pub waiting: IntGauge,
}

pub struct StreamMetrics {
    pub clients: IntGauge,
    pub sections_sent: IntCounter,
    pub bytes_sent: IntCounter,
    pub send_failures: IntCounter,
    pub batches_received: IntCounter,
    pub batches_completed: IntCounter,
    pub batches_cancelled: IntCounter,
    pub batches_rejected: IntCounter,
    pub positions_rejected: IntCounter,
    pub disk_reads_submitted: IntCounter,
    pub send_queue_len: IntGauge,
    pub dirty_columns_sent: IntCounter,
}

impl ChunkGenMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let chunks_requested = IntCounter::with_opts(Opts::new(
            "lodstream_chunks_requested",
            "number of columns handed to the world for generation",
        ))?;
        let chunks_served = IntCounter::with_opts(Opts::new(
            "lodstream_chunks_served",
            "number of generated columns delivered to waiting clients",
        ))?;
        let chunks_canceled = IntCounter::with_opts(Opts::new(
            "lodstream_chunks_canceled",
            "number of generation jobs dropped because nobody waits for them anymore",
        ))?;
        let chunks_timed_out = IntCounter::with_opts(Opts::new(
            "lodstream_chunks_timed_out",
            "number of generation jobs force-completed after the timeout",
        ))?;
        let active = IntGauge::with_opts(Opts::new(
            "lodstream_generation_active",
            "generation jobs currently running in the world",
        ))?;
        let waiting = IntGauge::with_opts(Opts::new(
            "lodstream_generation_waiting",
            "generation jobs waiting for a free slot",
        ))?;

        registry.register(Box::new(chunks_requested.clone()))?;
        registry.register(Box::new(chunks_served.clone()))?;
        registry.register(Box::new(chunks_canceled.clone()))?;
        registry.register(Box::new(chunks_timed_out.clone()))?;
        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(waiting.clone()))?;

        Ok(Self {
            chunks_requested,
            chunks_served,
            chunks_canceled,
            chunks_timed_out,
            active,
            waiting,
        })
    }
}

impl StreamMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let clients = IntGauge::with_opts(Opts::new(
            "lodstream_clients",
            "clients that completed the handshake",
        ))?;
        let sections_sent = IntCounter::with_opts(Opts::new(
            "lodstream_sections_sent",
            "queued payloads handed to client connections",
        ))?;
        let bytes_sent = IntCounter::with_opts(Opts::new(
            "lodstream_bytes_sent",
            "estimated bytes charged against the bandwidth budget",
        ))?;
        let send_failures = IntCounter::with_opts(Opts::new(
            "lodstream_send_failures",
            "messages the host failed to deliver",
        ))?;
        let batches_received = IntCounter::with_opts(Opts::new(
            "lodstream_batches_received",
            "request batches accepted from clients",
        ))?;
        let batches_completed = IntCounter::with_opts(Opts::new(
            "lodstream_batches_completed",
            "request batches finished with status done",
        ))?;
        let batches_cancelled = IntCounter::with_opts(Opts::new(
            "lodstream_batches_cancelled",
            "request batches finished with status cancelled",
        ))?;
        let batches_rejected = IntCounter::with_opts(Opts::new(
            "lodstream_batches_rejected",
            "request batches rejected because the client had too many pending",
        ))?;
        let positions_rejected = IntCounter::with_opts(Opts::new(
            "lodstream_positions_rejected",
            "requested positions dropped for exceeding the batch size or view distance",
        ))?;
        let disk_reads_submitted = IntCounter::with_opts(Opts::new(
            "lodstream_disk_reads_submitted",
            "columns handed to the disk reader",
        ))?;
        let send_queue_len = IntGauge::with_opts(Opts::new(
            "lodstream_send_queue_len",
            "payloads waiting in all client send queues",
        ))?;
        let dirty_columns_sent = IntCounter::with_opts(Opts::new(
            "lodstream_dirty_columns_sent",
            "dirty column positions pushed to clients",
        ))?;

        registry.register(Box::new(clients.clone()))?;
        registry.register(Box::new(sections_sent.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(batches_received.clone()))?;
        registry.register(Box::new(batches_completed.clone()))?;
        registry.register(Box::new(batches_cancelled.clone()))?;
        registry.register(Box::new(batches_rejected.clone()))?;
        registry.register(Box::new(positions_rejected.clone()))?;
        registry.register(Box::new(disk_reads_submitted.clone()))?;
        registry.register(Box::new(send_queue_len.clone()))?;
        registry.register(Box::new(dirty_columns_sent.clone()))?;

        Ok(Self {
            clients,
            sections_sent,
            bytes_sent,
            send_failures,
            batches_received,
            batches_completed,
            batches_cancelled,
            batches_rejected,
            positions_rejected,
            disk_reads_submitted,
            send_queue_len,
            dirty_columns_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once_per_registry() {
        let registry = Registry::new();
        let gen = ChunkGenMetrics::new(&registry).unwrap();
        let stream = StreamMetrics::new(&registry).unwrap();
        gen.chunks_requested.inc();
        stream.sections_sent.inc_by(3);
        assert_eq!(registry.gather().len(), 18);
        // A second set would collide with the registered names
        assert!(StreamMetrics::new(&registry).is_err());
    }
}
