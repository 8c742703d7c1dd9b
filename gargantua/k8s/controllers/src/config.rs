use std::time::Duration;

/// Settings shared by every controller.
#[derive(Clone, Debug)]
pub struct Config {
    /// The namespace HobbyFarm resources live in.
    pub namespace: String,

    /// How long events are kept before they are collected.
    pub event_retention: Duration,

    /// How long a claim may wait for a machine before it fails.
    pub claim_timeout: Duration,

    /// The number of workers each controller runs.
    pub workers: usize,

    /// Identifies this replica on the events it reports.
    pub instance: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "hobbyfarm".to_string(),
            event_retention: Duration::from_secs(60 * 60),
            claim_timeout: Duration::from_secs(300),
            workers: 2,
            instance: "gargantua".to_string(),
        }
    }
}
