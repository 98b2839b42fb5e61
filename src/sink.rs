//! Statistics sink and status file writer.
//!
//! Two dedicated threads outside the worker pool: the sink thread turns
//! stat snapshots into log output, the file thread appends the same lines
//! to an optional status file. The event loop publishes snapshots on the
//! status interval and asks both threads to stop as its final shutdown
//! gate.

use crate::stats::StatSnapshot;
use crossbeam_channel::{Receiver, Sender};
use std::io::Write;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

enum SinkMsg {
    Snapshot(StatSnapshot),
    Stop,
}

enum FileMsg {
    Line(String),
    Stop,
}

pub struct StatSink {
    tx: Sender<SinkMsg>,
    sink_thread: Option<JoinHandle<()>>,
    file_thread: Option<JoinHandle<()>>,
    stop_requested: bool,
}

impl StatSink {
    pub fn start(status_file: Option<PathBuf>) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<SinkMsg>();
        let (file_tx, file_rx) = crossbeam_channel::unbounded::<FileMsg>();

        let file_thread = std::thread::Builder::new()
            .name("file-writer".to_string())
            .spawn(move || file_loop(file_rx, status_file))?;

        let sink_thread = std::thread::Builder::new()
            .name("stat-sink".to_string())
            .spawn(move || sink_loop(rx, file_tx))?;

        Ok(StatSink {
            tx,
            sink_thread: Some(sink_thread),
            file_thread: Some(file_thread),
            stop_requested: false,
        })
    }

    pub fn publish(&self, snapshot: StatSnapshot) {
        if self.tx.send(SinkMsg::Snapshot(snapshot)).is_err() {
            warn!("stat sink already stopped; snapshot dropped");
        }
    }

    /// Ask the threads to stop after draining. Returns true once both have
    /// finished; the shutdown sequencer re-evaluates on each tick.
    pub fn stop(&mut self) -> bool {
        if !self.stop_requested {
            self.stop_requested = true;
            let _ = self.tx.send(SinkMsg::Stop);
        }
        let sink_done = self
            .sink_thread
            .as_ref()
            .map_or(true, |t| t.is_finished());
        let file_done = self
            .file_thread
            .as_ref()
            .map_or(true, |t| t.is_finished());
        sink_done && file_done
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.sink_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.file_thread.take() {
            let _ = thread.join();
        }
    }
}

fn sink_loop(rx: Receiver<SinkMsg>, file_tx: Sender<FileMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            SinkMsg::Snapshot(snapshot) => {
                let line = format_snapshot(&snapshot);
                info!(target: "status", "{line}");
                let _ = file_tx.send(FileMsg::Line(line));
            }
            SinkMsg::Stop => break,
        }
    }
    let _ = file_tx.send(FileMsg::Stop);
}

fn file_loop(rx: Receiver<FileMsg>, status_file: Option<PathBuf>) {
    let mut file = status_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| warn!(path = %path.display(), error = %e, "cannot open status file"))
            .ok()
    });

    while let Ok(msg) = rx.recv() {
        match msg {
            FileMsg::Line(line) => {
                if let Some(f) = file.as_mut() {
                    if writeln!(f, "{line}").is_err() {
                        warn!("status file write failed; disabling file output");
                        file = None;
                    }
                }
            }
            FileMsg::Stop => break,
        }
    }
    if let Some(f) = file.as_mut() {
        let _ = f.flush();
    }
}

fn format_snapshot(s: &StatSnapshot) -> String {
    let epoch = s
        .taken_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!(
        "t={epoch} clients={} servers={} req[arrived={} processed={} failed={} ignored_bytes={}] \
         resp[sent={} queued_local={} queued_peer={} failed_queue={} failed_send={} failed_forward={}] \
         mem[clients={} req_q={} resp_q={}] hdr_err[{}/{}/{}] panics={}",
        s.clients_active,
        s.servers_connected,
        s.requests.requests_arrived,
        s.requests.requests_processed,
        s.requests.requests_failed_to_process,
        s.requests.request_bytes_ignored,
        s.responses.responses_sent,
        s.responses.responses_in_local_clients_queues,
        s.responses.responses_in_peer_servers_queues,
        s.responses.responses_failed_to_queue,
        s.responses.responses_failed_to_send,
        s.responses.responses_failed_to_forward,
        s.requests.memory_by_clients,
        s.requests.memory_by_requests_in_queue,
        s.responses.memory_by_responses_in_queue,
        s.requests.header_error_preamble,
        s.requests.header_error_version,
        s.requests.header_error_size,
        s.exceptions.processor_panics,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ServerStats;
    use std::time::Duration;

    #[test]
    fn test_snapshot_reaches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.log");

        let mut sink = StatSink::start(Some(path.clone())).unwrap();
        let stats = ServerStats::new(1);
        stats.with_requests(|r| r.requests_arrived = 42);
        sink.publish(stats.snapshot(3, 1));

        while !sink.stop() {
            std::thread::sleep(Duration::from_millis(10));
        }
        sink.join();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("arrived=42"));
        assert!(contents.contains("clients=3"));
    }

    #[test]
    fn test_stop_without_file() {
        let mut sink = StatSink::start(None).unwrap();
        let stats = ServerStats::new(1);
        sink.publish(stats.snapshot(0, 0));

        while !sink.stop() {
            std::thread::sleep(Duration::from_millis(10));
        }
        sink.join();
    }
}
