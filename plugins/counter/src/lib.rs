//! # Counter Plugin
//!
//! Counts `host.tick` events and republishes the running total as
//! `counter.changed`. The count is carried across hot reloads.
//!
//! ## Configuration
//!
//! - `counter.step`: amount added per tick (default 1)
//!
//! ## Services
//!
//! - `counter`: an `Arc<AtomicU64>` holding the current count

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use weft_plugin_api::prelude::*;

/// Topic counted by the plugin
pub const TICK_TOPIC: &str = "host.tick";

/// Topic published after every change
pub const CHANGED_TOPIC: &str = "counter.changed";

/// Counts host ticks
#[derive(Debug)]
pub struct CounterPlugin {
    metadata: PluginMetadata,
    count: Arc<AtomicU64>,
    step: u64,
    initialized: bool,
}

impl CounterPlugin {
    /// Create an uninitialized counter starting at zero
    pub fn new() -> Self {
        Self {
            metadata: Self::describe(),
            count: Arc::new(AtomicU64::new(0)),
            step: 1,
            initialized: false,
        }
    }

    /// Metadata exported through the unit's manifest
    pub fn describe() -> PluginMetadata {
        PluginMetadata::new("counter", Version::new(0, 2, 0))
            .with_author("Weft Contributors")
            .with_description("Counts host ticks")
            .with_license("MIT OR Apache-2.0")
            .with_priority(200)
    }

    /// Current count
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CounterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for CounterPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn initialize(&mut self, ctx: &PluginContext) -> bool {
        self.step = ctx
            .config()
            .and_then(|config| config.get("counter.step"))
            .and_then(|step| step.as_u64())
            .unwrap_or(1);

        let count = self.count.clone();
        let step = self.step;
        let bus = ctx.event_bus().clone();
        ctx.subscribe(TICK_TOPIC, move |_, _| {
            let total = count.fetch_add(step, Ordering::SeqCst) + step;
            bus.publish(CHANGED_TOPIC, &serde_json::json!({ "count": total }));
        });
        ctx.provide("counter", self.count.clone());

        self.initialized = true;
        true
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn serialize_state(&self) -> String {
        match self.count() {
            0 => String::new(),
            n => n.to_string(),
        }
    }

    fn deserialize_state(&mut self, state: &str) {
        if let Ok(count) = state.trim().parse() {
            self.count.store(count, Ordering::SeqCst);
        }
    }
}

weft_plugin_api::declare_plugin!(CounterPlugin, CounterPlugin::new, CounterPlugin::describe);
