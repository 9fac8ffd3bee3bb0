//! Structured logging setup: an `EnvFilter`-gated `tracing-subscriber`
//! stderr writer. `RUST_LOG` always wins over the configured default level.

use tracing::Level;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

pub struct TracingBuilder {
    level: Level,
    json: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
        }
    }
}

impl TracingBuilder {
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Switch to newline-delimited JSON output, for log aggregation.
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn init(self) -> Result<(), Error> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()
            .expect("invalid RUST_LOG");

        if self.json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init()?;
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .try_init()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_builder_uses_info_level() {
        let builder = TracingBuilder::default();
        assert_eq!(builder.level, Level::INFO);
    }
}
