//! The supervisor loop and `handle_event` decision tree: the one task
//! permitted to mutate [`EventStore`] and [`FirewallBackend`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::adapters::services;
use crate::event_store::{EventStore, StoreError};
use crate::firewall::{FirewallBackend, FirewallError};
use crate::line_parser::{Direction, Event};

const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Resolves a destination port to its `/etc/services` name for log display,
/// falling back to the bare port number when nothing matches.
fn service_label(proto: &str, port: u16) -> String {
    services::services()
        .get(&proto.to_ascii_lowercase())
        .and_then(|by_port| by_port.get(&port.to_string()))
        .cloned()
        .unwrap_or_else(|| port.to_string())
}

pub struct Thresholds {
    pub repeat_period: Duration,
    pub repeat_count: u32,
    pub timeout: Duration,
    pub bad_ip_threshold: u32,
    pub scan_directions: Vec<Direction>,
}

impl Default for Thresholds {
    fn default() -> Thresholds {
        Thresholds {
            repeat_period: Duration::from_secs(300),
            repeat_count: 3,
            timeout: Duration::from_secs(900),
            bad_ip_threshold: 25,
            scan_directions: vec![Direction::Inbound],
        }
    }
}

/// One tailer's pair of output queues.
pub struct TailerQueues {
    pub label: String,
    pub events: mpsc::Receiver<Event>,
    pub invalid: mpsc::Receiver<String>,
}

pub struct PolicyEngine<F: FirewallBackend> {
    store: EventStore,
    firewall: Arc<F>,
    thresholds: Thresholds,
    started: bool,
    log: slog::Logger,
}

impl<F: FirewallBackend> PolicyEngine<F> {
    pub fn new(
        store: EventStore,
        firewall: Arc<F>,
        thresholds: Thresholds,
        log: slog::Logger,
    ) -> PolicyEngine<F> {
        PolicyEngine {
            store,
            firewall,
            thresholds,
            started: false,
            log,
        }
    }

    /// Replays every permanently-blocked address into the firewall. Kernel
    /// state does not survive a restart; the `bad` table does.
    pub async fn replay_bad_ips(&self) -> Result<(), StoreError> {
        for ip in self.store.list_bad().await? {
            if let Err(err) = self.firewall.block_permanent(&ip).await {
                slog::error!(self.log, "failed to re-install permanent block at boot"; "ip" => ip, "error" => err.to_string());
            }
        }
        Ok(())
    }

    /// Drains every tailer's queues once, in order, then commits if dirty.
    /// Returns when every queue reports closed (used for tests); the real
    /// supervisor loop calls this in a `loop` with an idle sleep between
    /// passes.
    pub async fn drain_once(&mut self, tailers: &mut [TailerQueues]) {
        for tailer in tailers.iter_mut() {
            while let Ok(event) = tailer.events.try_recv() {
                self.handle_event(event).await;
            }
        }
        for tailer in tailers.iter_mut() {
            while let Ok(line) = tailer.invalid.try_recv() {
                if let Err(err) = self.store.insert_invalid(&line).await {
                    slog::error!(self.log, "failed to archive invalid line"; "error" => err.to_string());
                }
            }
        }
        if let Err(err) = self.store.commit().await {
            slog::error!(self.log, "failed to commit event store"; "error" => err.to_string());
        }
    }

    /// Runs the supervisor loop forever: drain every tailer's queues, sleep,
    /// repeat. Marks `started` after the first pass so duplicate-event
    /// logging downgrades from warning to debug.
    pub async fn run(mut self, mut tailers: Vec<TailerQueues>) {
        self.drain_once(&mut tailers).await;
        self.started = true;
        loop {
            self.drain_once(&mut tailers).await;
            tokio::time::sleep(DRAIN_IDLE_SLEEP).await;
        }
    }

    /// The five-branch decision tree: insert, count recent drops from the
    /// same source, then promote to permanent block, extend an existing
    /// timed block, or install a fresh one.
    pub async fn handle_event(&mut self, event: Event) {
        match self.store.insert_event(&event).await {
            Ok(()) => {}
            Err(StoreError::EventExists) => {
                if self.started {
                    slog::warn!(self.log, "duplicate event"; "src" => event.src.clone(), "hash" => event.hash.clone());
                } else {
                    slog::debug!(self.log, "duplicate event during startup backlog"; "src" => event.src.clone());
                }
                return;
            }
            Err(err) => {
                slog::error!(self.log, "failed to insert event"; "error" => err.to_string());
                return;
            }
        }

        let recent = match self
            .store
            .recent_from(&event.src, self.thresholds.repeat_period.as_secs() as i64)
            .await
        {
            Ok(recent) => recent,
            Err(err) => {
                slog::error!(self.log, "failed to query recent drops"; "error" => err.to_string());
                return;
            }
        };
        let n = recent.len() as u32;

        if n >= self.thresholds.bad_ip_threshold {
            self.block_permanent(&event.src).await;
            return;
        }

        let is_timed_out = match self.store.is_timed_out(&event.src).await {
            Ok(v) => v,
            Err(err) => {
                slog::error!(self.log, "failed to query timeout state"; "error" => err.to_string());
                return;
            }
        };

        if is_timed_out {
            self.time_out(&event.src).await;
            return;
        }

        if self.thresholds.scan_directions.contains(&event.direction) && n >= self.thresholds.repeat_count {
            self.time_out(&event.src).await;
            if let Err(err) = self.store.insert_timeout(&event.src).await {
                slog::error!(self.log, "failed to record timeout"; "error" => err.to_string());
            } else {
                slog::info!(
                    self.log,
                    "installed timeout";
                    "src" => event.src.clone(),
                    "service" => service_label(&event.proto, event.dpt),
                );
            }
        }
    }

    async fn block_permanent(&self, ip: &str) {
        match self.firewall.block_permanent(ip).await {
            Ok(()) => {
                if let Err(err) = self.store.insert_bad(ip).await {
                    slog::error!(self.log, "failed to record bad ip"; "error" => err.to_string());
                }
            }
            Err(err) => self.log_firewall_error(ip, err),
        }
    }

    async fn time_out(&self, ip: &str) {
        if let Err(err) = self
            .firewall
            .time_out(ip, self.thresholds.timeout.as_secs())
            .await
        {
            self.log_firewall_error(ip, err);
        }
    }

    fn log_firewall_error(&self, ip: &str, err: FirewallError) {
        slog::error!(self.log, "firewall command failed"; "ip" => ip, "error" => err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_parser::parse;
    use std::sync::Mutex;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[derive(Default)]
    struct RecordingFirewall {
        timed_out: Mutex<Vec<(String, u64)>>,
        blocked: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl FirewallBackend for RecordingFirewall {
        async fn time_out(&self, ip: &str, seconds: u64) -> Result<(), FirewallError> {
            self.timed_out.lock().unwrap().push((ip.to_string(), seconds));
            Ok(())
        }
        async fn block_permanent(&self, ip: &str) -> Result<(), FirewallError> {
            self.blocked.lock().unwrap().push(ip.to_string());
            Ok(())
        }
    }

    fn line_for(src: &str, nonce: u32) -> String {
        format!(
            "Dec 28 22:16:{:02} hostname kernel: [{}] Dropped input traffic: IN=wan OUT= MAC=aa:bb:cc:dd:ee:ff:ff:ee:dd:cc:bb:aa:08:00 SRC={} DST=4.3.2.1 LEN=48 TOS=0x00 PREC=0x00 TTL=113 ID={} DF PROTO=TCP SPT=51004 DPT=37888 WINDOW=64240 RES=0x00 SYN URGP=0 ",
            nonce % 60, nonce, src, nonce
        )
    }

    async fn engine(firewall: Arc<RecordingFirewall>) -> PolicyEngine<RecordingFirewall> {
        let store = EventStore::open("sqlite::memory:", &test_log()).await.unwrap();
        PolicyEngine::new(
            store,
            firewall,
            Thresholds {
                repeat_period: Duration::from_secs(300),
                repeat_count: 3,
                timeout: Duration::from_secs(900),
                bad_ip_threshold: 5,
                scan_directions: vec![Direction::Inbound],
            },
            test_log(),
        )
    }

    #[tokio::test]
    async fn repeated_identical_line_does_not_trigger_a_block() {
        let firewall = Arc::new(RecordingFirewall::default());
        let mut engine = engine(firewall.clone()).await;
        let event = parse(&line_for("1.2.3.4", 1)).unwrap();
        engine.handle_event(event.clone()).await;
        engine.handle_event(event.clone()).await;
        engine.handle_event(event).await;
        assert!(firewall.timed_out.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn third_distinct_event_triggers_timed_block() {
        let firewall = Arc::new(RecordingFirewall::default());
        let mut engine = engine(firewall.clone()).await;
        for i in 1..=3u32 {
            let event = parse(&line_for("1.2.3.4", i)).unwrap();
            engine.handle_event(event).await;
        }
        let calls = firewall.timed_out.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("1.2.3.4".to_string(), 900));
        assert!(engine.store.is_timed_out("1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn already_timed_out_source_refreshes_on_every_new_event() {
        let firewall = Arc::new(RecordingFirewall::default());
        let mut engine = engine(firewall.clone()).await;
        for i in 1..=3u32 {
            engine.handle_event(parse(&line_for("1.2.3.4", i)).unwrap()).await;
        }
        engine.handle_event(parse(&line_for("1.2.3.4", 4)).unwrap()).await;
        assert_eq!(firewall.timed_out.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn crossing_bad_ip_threshold_promotes_to_permanent_block() {
        let firewall = Arc::new(RecordingFirewall::default());
        let mut engine = engine(firewall.clone()).await;
        for i in 1..=5u32 {
            engine.handle_event(parse(&line_for("9.9.9.9", i)).unwrap()).await;
        }
        assert_eq!(firewall.blocked.lock().unwrap().as_slice(), ["9.9.9.9"]);
        assert!(engine.store.is_bad("9.9.9.9").await.unwrap());
    }

    #[tokio::test]
    async fn non_scanned_direction_is_never_timed_out() {
        let firewall = Arc::new(RecordingFirewall::default());
        let mut engine = engine(firewall.clone()).await;
        for i in 1..=4u32 {
            let line = format!(
                "Dec 28 22:16:{:02} hostname kernel: stmt IN= OUT=wan MAC=aa:bb:cc:dd:ee:ff:ff:ee:dd:cc:bb:aa:08:00 SRC=1.2.3.4 DST=4.3.2.1 PROTO=TCP SPT=1 DPT=2 {}",
                i, i
            );
            engine.handle_event(parse(&line).unwrap()).await;
        }
        assert!(firewall.timed_out.lock().unwrap().is_empty());
    }
}
