use super::spec::{EventKind, EventSpec};
use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How often the events directory is rescanned. Cron evaluation stays at
/// minute granularity regardless; this only bounds pickup latency for new
/// files and due one-shots.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Receives a firing: `(channel_id, synthesized_text)`. Returns `false`
/// when the channel queue refused the work (cap reached).
pub type EventSink = Arc<dyn Fn(&str, String) -> bool + Send + Sync>;

pub struct EventScheduler {
    events_dir: PathBuf,
    sink: EventSink,
    /// At-most-once latch for immediate/one-shot files.
    fired: HashSet<String>,
    /// Per periodic file: the minute (in its own timezone) it last fired.
    last_fired_minute: HashMap<String, String>,
    /// Files already reported as invalid, to log each only once.
    invalid: HashSet<String>,
}

impl EventScheduler {
    pub fn new(events_dir: PathBuf, sink: EventSink) -> Self {
        Self {
            events_dir,
            sink,
            fired: HashSet::new(),
            last_fired_minute: HashMap::new(),
            invalid: HashSet::new(),
        }
    }

    /// Watch the events directory forever.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(Utc::now()) {
                tracing::warn!("event scheduler tick failed: {e:#}");
            }
        }
    }

    /// One evaluation pass at `now`. Split out from [`run`] for testability.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.events_dir.exists() {
            return Ok(());
        }

        let mut present = HashSet::new();
        for dir_entry in std::fs::read_dir(&self.events_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            present.insert(name.clone());

            let spec = match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| EventSpec::parse(&raw))
            {
                Ok(spec) => spec,
                Err(e) => {
                    if self.invalid.insert(name.clone()) {
                        tracing::warn!(event = %name, "skipping invalid event file: {e:#}");
                    }
                    continue;
                }
            };

            match spec.kind {
                EventKind::Immediate => self.fire_once(&name, &path, &spec, now, "immediate"),
                EventKind::OneShot => {
                    // Validation guarantees `at` parses.
                    let Ok(at) = spec.fire_at() else { continue };
                    if at.with_timezone(&Utc) <= now {
                        self.fire_once(&name, &path, &spec, now, "one-shot");
                    }
                }
                EventKind::Periodic => self.evaluate_periodic(&name, &spec, now),
            }
        }

        // Forget state for files that no longer exist.
        self.fired.retain(|name| present.contains(name));
        self.last_fired_minute.retain(|name, _| present.contains(name));
        self.invalid.retain(|name| present.contains(name));
        Ok(())
    }

    /// Fire an immediate/one-shot event at most once, then delete its file.
    fn fire_once(
        &mut self,
        name: &str,
        path: &std::path::Path,
        spec: &EventSpec,
        now: DateTime<Utc>,
        mode: &str,
    ) {
        if self.fired.contains(name) {
            return;
        }
        self.fired.insert(name.to_string());

        let stamp = match spec.kind {
            EventKind::OneShot => spec.at.clone().unwrap_or_default(),
            _ => now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        self.dispatch(name, &spec.channel_id, mode, &stamp, &spec.text);

        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(event = %name, "failed to delete fired event file: {e}");
        }
    }

    /// Fire a periodic event at most once per (file, minute-in-timezone).
    fn evaluate_periodic(&mut self, name: &str, spec: &EventSpec, now: DateTime<Utc>) {
        let (Ok(schedule), Ok(tz)) = (spec.cron_schedule(), spec.tz()) else {
            return;
        };
        let local = now.with_timezone(&tz);
        let minute_key = local.format("%Y-%m-%dT%H:%M").to_string();
        if self.last_fired_minute.get(name) == Some(&minute_key) {
            return;
        }

        let Some(minute_start) = local.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
            return;
        };
        if !schedule.includes(minute_start) {
            return;
        }

        self.last_fired_minute.insert(name.to_string(), minute_key);
        let stamp = local.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.dispatch(name, &spec.channel_id, "periodic", &stamp, &spec.text);
    }

    fn dispatch(&self, name: &str, channel_id: &str, mode: &str, stamp: &str, text: &str) {
        let message = format!("[EVENT:{name}:{mode}:{stamp}] {text}");
        tracing::info!(event = %name, channel = %channel_id, mode = %mode, "event fired");
        if !(self.sink)(channel_id, message) {
            tracing::warn!(event = %name, channel = %channel_id, "channel queue rejected event firing");
        }
    }
}
