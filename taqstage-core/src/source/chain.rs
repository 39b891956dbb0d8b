//! Ordered fallback across several sources.

use super::{BatchStream, SourceAdapter, SourceError};
use crate::domain::DataKind;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

/// Serves each kind from the first source that supports it and has the date.
pub struct ChainedSource {
    sources: Vec<Box<dyn SourceAdapter>>,
    label: String,
}

impl ChainedSource {
    pub fn new(sources: Vec<Box<dyn SourceAdapter>>) -> Self {
        let label = sources
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { sources, label }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Index of the first source able to serve `kind` on `date`.
    fn pick(&mut self, kind: DataKind, date: NaiveDate) -> Option<usize> {
        for (i, source) in self.sources.iter_mut().enumerate() {
            if !source.supports(kind) {
                debug!(source = source.name(), %kind, "kind not supported, trying next source");
                continue;
            }
            match source.is_available(date, &[kind]) {
                Ok(true) => return Some(i),
                Ok(false) => debug!(source = source.name(), %kind, %date, "not available"),
                Err(e) => warn!(source = source.name(), %kind, %date, error = %e, "availability check failed"),
            }
        }
        None
    }
}

impl SourceAdapter for ChainedSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn supports(&self, kind: DataKind) -> bool {
        self.sources.iter().any(|s| s.supports(kind))
    }

    fn extract<'a>(
        &'a mut self,
        kind: DataKind,
        date: NaiveDate,
        symbols: &[String],
    ) -> Result<BatchStream<'a>, SourceError> {
        let Some(index) = self.pick(kind, date) else {
            return Err(SourceError::Unavailable {
                what: format!("{kind} from {}", self.label),
                date,
            });
        };
        let source = &mut self.sources[index];
        if index > 0 {
            warn!(source = source.name(), %kind, %date, "falling back to secondary source");
        } else {
            info!(source = source.name(), %kind, %date, "using primary source");
        }
        source.extract(kind, date, symbols)
    }

    fn is_available(&mut self, date: NaiveDate, kinds: &[DataKind]) -> Result<bool, SourceError> {
        for &kind in kinds {
            if self.pick(kind, date).is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn default_symbols(&mut self, date: NaiveDate) -> Result<Vec<String>, SourceError> {
        let mut last = None;
        for source in &mut self.sources {
            match source.default_symbols(date) {
                Ok(symbols) if !symbols.is_empty() => return Ok(symbols),
                Ok(_) => debug!(source = source.name(), "no default symbols"),
                Err(e) => {
                    debug!(source = source.name(), error = %e, "default symbols unavailable");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| SourceError::Config(format!("{} has no default symbols", self.label))))
    }
}
