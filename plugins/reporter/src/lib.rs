//! # Reporter Plugin
//!
//! Listens for `counter.changed` and publishes a human-readable line on
//! `reporter.line` every `reporter.every` changes (default 1). Requires
//! `counter` in `[0.1.0, 1.0.0)`, so it is initialized after it and
//! reloaded whenever the counter is.

use parking_lot::Mutex;
use std::sync::Arc;
use weft_plugin_api::prelude::*;

/// Topic the reporter listens on
pub const CHANGED_TOPIC: &str = "counter.changed";

/// Topic the reporter writes to
pub const LINE_TOPIC: &str = "reporter.line";

#[derive(Debug, Default)]
struct Tally {
    last: u64,
    seen: u64,
}

/// Reports counter changes
#[derive(Debug)]
pub struct ReporterPlugin {
    metadata: PluginMetadata,
    tally: Arc<Mutex<Tally>>,
    initialized: bool,
}

impl ReporterPlugin {
    /// Create an uninitialized reporter
    pub fn new() -> Self {
        Self {
            metadata: Self::describe(),
            tally: Arc::default(),
            initialized: false,
        }
    }

    /// Metadata exported through the unit's manifest
    pub fn describe() -> PluginMetadata {
        PluginMetadata::new("reporter", Version::new(0, 1, 0))
            .with_author("Weft Contributors")
            .with_description("Reports the counter total")
            .with_license("MIT OR Apache-2.0")
            .with_dependency(
                DependencyDescriptor::required("counter")
                    .at_least(Version::new(0, 1, 0))
                    .below(Version::new(1, 0, 0)),
            )
    }

    /// Last total seen and how many changes were observed
    pub fn tally(&self) -> (u64, u64) {
        let tally = self.tally.lock();
        (tally.last, tally.seen)
    }
}

impl Default for ReporterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ReporterPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn initialize(&mut self, ctx: &PluginContext) -> bool {
        let every = ctx
            .config()
            .and_then(|config| config.get("reporter.every"))
            .and_then(|every| every.as_u64())
            .filter(|every| *every > 0)
            .unwrap_or(1);

        let tally = self.tally.clone();
        let bus = ctx.event_bus().clone();
        ctx.subscribe(CHANGED_TOPIC, move |_, payload| {
            let Some(count) = payload["count"].as_u64() else {
                return;
            };
            let line = {
                let mut tally = tally.lock();
                tally.last = count;
                tally.seen += 1;
                (tally.seen % every == 0)
                    .then(|| format!("counter at {count} after {} changes", tally.seen))
            };
            if let Some(line) = line {
                bus.publish(LINE_TOPIC, &serde_json::Value::String(line));
            }
        });

        self.initialized = true;
        true
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    // `last,seen`
    fn serialize_state(&self) -> String {
        let tally = self.tally.lock();
        if tally.seen == 0 {
            return String::new();
        }
        format!("{},{}", tally.last, tally.seen)
    }

    fn deserialize_state(&mut self, state: &str) {
        let Some((last, seen)) = state.split_once(',') else {
            return;
        };
        if let (Ok(last), Ok(seen)) = (last.parse(), seen.parse()) {
            *self.tally.lock() = Tally { last, seen };
        }
    }
}

weft_plugin_api::declare_plugin!(ReporterPlugin, ReporterPlugin::new, ReporterPlugin::describe);

#[cfg(test)]
mod tests {
    use super::*;
    use weft_plugin_api::{
        EventBus, InMemoryEventBus, InMemoryServiceRegistry, JsonConfigStore, PausableHost,
    };

    fn context(bus: &Arc<InMemoryEventBus>, every: u64) -> PluginContext {
        PluginContext::new(
            "reporter",
            bus.clone(),
            Arc::new(InMemoryServiceRegistry::new()),
            Arc::new(PausableHost::new("test")),
        )
        .with_config(Arc::new(JsonConfigStore::new(serde_json::json!({
            "reporter": { "every": every }
        }))))
    }

    fn collect_lines(bus: &InMemoryEventBus) -> Arc<Mutex<Vec<String>>> {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        bus.subscribe(
            "observer",
            LINE_TOPIC,
            Arc::new(move |_: &str, payload: &serde_json::Value| {
                if let Some(line) = payload.as_str() {
                    sink.lock().push(line.to_string());
                }
            }),
        );
        lines
    }

    #[test]
    fn test_requires_counter_below_one() {
        let metadata = ReporterPlugin::describe();
        let dependency = &metadata.dependencies[0];
        assert_eq!(dependency.plugin_name, "counter");
        assert!(dependency.accepts(&Version::new(0, 2, 0)));
        assert!(!dependency.accepts(&Version::new(1, 0, 0)));
    }

    #[test]
    fn test_reports_every_nth_change() {
        let bus = Arc::new(InMemoryEventBus::new());
        let lines = collect_lines(&bus);

        let mut plugin = ReporterPlugin::new();
        assert!(plugin.initialize(&context(&bus, 2)));

        for count in 1..=5 {
            bus.publish(CHANGED_TOPIC, &serde_json::json!({ "count": count }));
        }
        bus.publish(CHANGED_TOPIC, &serde_json::json!({ "unrelated": true }));

        assert_eq!(plugin.tally(), (5, 5));
        assert_eq!(
            *lines.lock(),
            vec![
                "counter at 2 after 2 changes".to_string(),
                "counter at 4 after 4 changes".to_string(),
            ]
        );
    }

    #[test]
    fn test_state_round_trip() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut old = ReporterPlugin::new();
        assert_eq!(old.serialize_state(), "");
        assert!(old.initialize(&context(&bus, 1)));
        bus.publish(CHANGED_TOPIC, &serde_json::json!({ "count": 7 }));

        let mut new = ReporterPlugin::new();
        new.deserialize_state(&old.serialize_state());
        assert_eq!(new.tally(), (7, 1));

        new.deserialize_state("garbage");
        assert_eq!(new.tally(), (7, 1));
    }
}
