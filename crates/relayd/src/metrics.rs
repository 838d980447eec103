use prometheus::{IntCounter, Registry, TextEncoder};

/// The relay's delivery counters, attached to an explicitly owned
/// registry rather than the process-global default so that each
/// instance (including every test) carries its own counter state.
pub struct RelayMetrics {
    registry: Registry,
    pub received: IntCounter,
    pub forwarded: IntCounter,
    pub failed: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let received = IntCounter::new(
            "smtp_emails_received_total",
            "Total number of emails received by the SMTP relay.",
        )?;
        let forwarded = IntCounter::new(
            "smtp_emails_forwarded_total",
            "Total number of emails successfully forwarded.",
        )?;
        let failed = IntCounter::new(
            "smtp_emails_failed_total",
            "Total number of emails that failed to forward.",
        )?;

        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(forwarded.clone()))?;
        registry.register(Box::new(failed.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            received,
            forwarded,
            failed,
        })
    }

    /// Render the registry in the prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}
