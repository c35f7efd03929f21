use std::sync::Arc;

use anyhow::Context;
use tlsflow::{
    metrics::server::start_metrics_server,
    poller::TlsPoller,
    runtime::{self, Runtime},
    source::perf::PerfChunkReader,
    stream::{map::StreamMap, sorter::PacketSorter},
};
use tokio::signal;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Runtime { config, .. } = Runtime::new()?;
    runtime::init_tracing(config.log_level);

    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `rlim` is a valid, initialized rlimit that outlives the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!(
            event.name = "system.memlock_failed",
            ret = ret,
            "remove limit on locked memory failed"
        );
    }

    let reader = PerfChunkReader::from_pin(&config.chunks_map_pin, config.perf_buffer_pages)
        .with_context(|| {
            format!(
                "failed to open chunks map pinned at {}",
                config.chunks_map_pin.display()
            )
        })?;
    let closer = reader.closer();

    let stream_map = Arc::new(StreamMap::new());
    let (sorter, mut sorted_packets) = PacketSorter::new(config.packet_channel_capacity);
    let mut poller = TlsPoller::new(&config.poller, Arc::clone(&stream_map), sorter)?;

    let metrics_opts = config.metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_opts).await {
            error!(
                event.name = "metrics.server_failed",
                error.message = %e,
                "metrics server stopped"
            );
        }
    });

    let output = tokio::spawn(async move {
        while let Some(packet) = sorted_packets.recv().await {
            debug!(
                event.name = "sorter.packet",
                stream.id = packet.stream_id,
                stream.is_client = packet.is_client,
                packet.seq = packet.seq,
                packet.offset = packet.offset,
                packet.len = packet.payload.len(),
                packet.truncated = packet.truncated,
                tcp.id = %packet.tcp_id,
                "sorted packet"
            );
        }
    });

    let poll = tokio::spawn(async move { poller.poll(reader).await });

    info!(
        event.name = "tlsflow.started",
        bpf.map.pin = %config.chunks_map_pin.display(),
        "tlsflow started, waiting for ctrl-c"
    );
    signal::ctrl_c().await?;
    info!(event.name = "tlsflow.stopping", "shutting down");

    closer.close();
    poll.await.context("poller task panicked")??;
    output.await.context("output task panicked")?;

    info!(
        event.name = "tlsflow.stopped",
        streams.remaining = stream_map.len(),
        "tlsflow stopped"
    );
    Ok(())
}
