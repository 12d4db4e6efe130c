//! Thread topology: which units to spawn and how each is configured.
//!
//! Every spawned unit gets a [`ThreadConfiguration`] built from the
//! defaults of its [`ThreadType`], then the per-type template, then (for
//! workers) the overrides of its channel entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    /// Declares broker topology once at boot
    Infrastructure,
    /// Reserved for centralized configuration refresh
    Configuration,
    #[default]
    Worker,
}

impl ThreadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadType::Infrastructure => "infrastructure",
            ThreadType::Configuration => "configuration",
            ThreadType::Worker => "worker",
        }
    }
}

impl fmt::Display for ThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one spawned unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfiguration {
    pub thread_type: ThreadType,
    /// Router name; workers fall back to their channel name
    pub handler: Option<String>,
    pub minimum: usize,
    /// Live instance cap per channel, 0 for no cap
    pub maximum: usize,
    /// Carried as-is; not interpreted by the runtime
    pub triggers: Vec<String>,
    /// Seconds before the unit recycles itself, 0 to live forever
    pub ttl: u64,
    /// Deliveries before the unit recycles itself, 0 for no limit
    pub max_jobs: u64,
    pub rpc_allowed: bool,
    /// Channels a handler may publish to, empty for any
    pub channels: Vec<String>,
    /// Channel consumed by a worker
    pub channel_name: Option<String>,
    pub enabled: bool,
}

impl Default for ThreadConfiguration {
    fn default() -> Self {
        Self::for_type(ThreadType::Worker)
    }
}

impl ThreadConfiguration {
    /// Built-in defaults for a thread type
    pub fn for_type(thread_type: ThreadType) -> Self {
        let maximum = match thread_type {
            ThreadType::Worker => 0,
            ThreadType::Infrastructure | ThreadType::Configuration => 1,
        };
        Self {
            thread_type,
            handler: None,
            minimum: 1,
            maximum,
            triggers: Vec::new(),
            ttl: 0,
            max_jobs: 0,
            rpc_allowed: false,
            channels: Vec::new(),
            channel_name: None,
            enabled: true,
        }
    }

    /// Worker configuration consuming the given channel
    pub fn worker(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: Some(channel_name.into()),
            ..Self::for_type(ThreadType::Worker)
        }
    }

    pub fn ttl_duration(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_secs(self.ttl))
    }

    /// Router name this unit dispatches to
    pub fn handler_name(&self) -> Option<&str> {
        self.handler.as_deref().or(self.channel_name.as_deref())
    }

    /// Key used to count live instances against `maximum`
    pub fn pool_key(&self) -> String {
        match &self.channel_name {
            Some(channel) => format!("{}:{}", self.thread_type, channel),
            None => self.thread_type.to_string(),
        }
    }
}

/// Partial configuration layered over a base
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThreadOverrides {
    pub handler: Option<String>,
    pub minimum: Option<usize>,
    pub maximum: Option<usize>,
    pub triggers: Option<Vec<String>>,
    pub ttl: Option<u64>,
    pub max_jobs: Option<u64>,
    pub rpc_allowed: Option<bool>,
    pub channels: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

impl ThreadOverrides {
    pub fn apply(&self, base: &ThreadConfiguration) -> ThreadConfiguration {
        let mut merged = base.clone();
        if let Some(handler) = &self.handler {
            merged.handler = Some(handler.clone());
        }
        if let Some(minimum) = self.minimum {
            merged.minimum = minimum;
        }
        if let Some(maximum) = self.maximum {
            merged.maximum = maximum;
        }
        if let Some(triggers) = &self.triggers {
            merged.triggers = triggers.clone();
        }
        if let Some(ttl) = self.ttl {
            merged.ttl = ttl;
        }
        if let Some(max_jobs) = self.max_jobs {
            merged.max_jobs = max_jobs;
        }
        if let Some(rpc_allowed) = self.rpc_allowed {
            merged.rpc_allowed = rpc_allowed;
        }
        if let Some(channels) = &self.channels {
            merged.channels = channels.clone();
        }
        if let Some(enabled) = self.enabled {
            merged.enabled = enabled;
        }
        merged
    }
}

/// Per-type templates
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThreadTemplates {
    pub infrastructure: ThreadOverrides,
    pub configuration: ThreadOverrides,
    pub worker: ThreadOverrides,
}

impl ThreadTemplates {
    pub fn resolve(&self, thread_type: ThreadType) -> ThreadConfiguration {
        let template = match thread_type {
            ThreadType::Infrastructure => &self.infrastructure,
            ThreadType::Configuration => &self.configuration,
            ThreadType::Worker => &self.worker,
        };
        template.apply(&ThreadConfiguration::for_type(thread_type))
    }
}

/// Worker pool for one contract channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelThreads {
    pub channel_name: String,
    #[serde(flatten)]
    pub overrides: ThreadOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub has_infrastructure_thread: bool,
    pub has_centralized_configuration_thread: bool,
    pub templates: ThreadTemplates,
    pub channels: Vec<ChannelThreads>,
}

impl TopologyConfig {
    /// One configuration per pool: infrastructure, configuration, then one per channel
    pub fn thread_configurations(&self) -> Vec<ThreadConfiguration> {
        let mut configurations = Vec::with_capacity(self.channels.len() + 2);
        if self.has_infrastructure_thread {
            configurations.push(self.templates.resolve(ThreadType::Infrastructure));
        }
        if self.has_centralized_configuration_thread {
            configurations.push(self.templates.resolve(ThreadType::Configuration));
        }

        let worker = self.templates.resolve(ThreadType::Worker);
        for channel in &self.channels {
            let mut configuration = channel.overrides.apply(&worker);
            configuration.channel_name = Some(channel.channel_name.clone());
            configurations.push(configuration);
        }
        configurations
    }
}
