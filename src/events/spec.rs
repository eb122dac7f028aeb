use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "immediate")]
    Immediate,
    #[serde(rename = "one-shot")]
    OneShot,
    #[serde(rename = "periodic")]
    Periodic,
}

/// One event file. Unknown fields are ignored; files that fail validation
/// are logged and skipped by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub channel_id: String,
    pub text: String,
    /// One-shot fire time; must carry a UTC offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    /// Five-field cron expression for periodic events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// IANA timezone the cron fields are interpreted in. Defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl EventSpec {
    /// Parse and validate one event file's content.
    pub fn parse(raw: &str) -> Result<Self> {
        let spec: EventSpec = serde_json::from_str(raw).context("invalid event JSON")?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<()> {
        if self.channel_id.trim().is_empty() {
            anyhow::bail!("event has empty channelId");
        }
        match self.kind {
            EventKind::Immediate => Ok(()),
            EventKind::OneShot => {
                self.fire_at()?;
                Ok(())
            }
            EventKind::Periodic => {
                self.cron_schedule()?;
                self.tz()?;
                Ok(())
            }
        }
    }

    /// One-shot fire time, offset required.
    pub fn fire_at(&self) -> Result<DateTime<FixedOffset>> {
        let raw = self
            .at
            .as_deref()
            .context("one-shot event requires 'at'")?;
        DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("'at' must be RFC3339 with offset, got '{raw}'"))
    }

    /// The cron schedule, normalized from standard 5-field crontab syntax
    /// to the crate's seconds-leading form.
    pub fn cron_schedule(&self) -> Result<cron::Schedule> {
        let expr = self
            .schedule
            .as_deref()
            .context("periodic event requires 'schedule'")?
            .trim();
        let field_count = expr.split_whitespace().count();
        if field_count != 5 {
            anyhow::bail!("cron expression must have 5 fields, got {field_count}: '{expr}'");
        }
        cron::Schedule::from_str(&format!("0 {expr}"))
            .with_context(|| format!("invalid cron expression '{expr}'"))
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        let name = self.timezone.as_deref().unwrap_or("UTC");
        chrono_tz::Tz::from_str(name)
            .map_err(|_| anyhow::anyhow!("invalid IANA timezone '{name}'"))
    }
}
