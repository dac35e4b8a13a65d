//! Advertisement filtering
//!
//! Only peripherals advertising one of the supported hardware model names are
//! surfaced, and each peripheral is surfaced at most once per scan.

use std::collections::HashSet;

use crate::bluetooth::types::{Advertisement, PeripheralIdentity};

/// Allow-list of supported hardware models
///
/// Matching is a case-insensitive prefix match on the advertised name, so
/// "NavBand" also accepts "NavBand-4F2A". Advertisements without a name never
/// match.
#[derive(Debug, Clone)]
pub struct ModelFilter {
    models: Vec<String>,
}

impl ModelFilter {
    pub fn new<S: AsRef<str>>(models: &[S]) -> Self {
        Self {
            models: models
                .iter()
                .map(|m| m.as_ref().trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, peripheral: &PeripheralIdentity) -> bool {
        match &peripheral.display_name {
            Some(name) => {
                let name = name.trim().to_lowercase();
                self.models.iter().any(|m| name.starts_with(m.as_str()))
            }
            None => false,
        }
    }
}

/// Per-scan view of the advertisements that passed the allow-list
///
/// Reset at the start of every scan; repeated advertisements from a peripheral
/// already seen in this scan are dropped.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    models: ModelFilter,
    seen: HashSet<String>,
}

impl ScanFilter {
    pub fn new(models: ModelFilter) -> Self {
        Self {
            models,
            seen: HashSet::new(),
        }
    }

    /// Forget every peripheral seen so far
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Returns the advertisement if it is a supported model seen for the first
    /// time in this scan
    pub fn admit(&mut self, advertisement: Advertisement) -> Option<Advertisement> {
        if !self.models.matches(&advertisement.peripheral) {
            return None;
        }
        if !self.seen.insert(advertisement.peripheral.id.clone()) {
            return None;
        }
        Some(advertisement)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> ModelFilter {
        ModelFilter::new(&["NavBand", "WayCue"])
    }

    #[test]
    fn test_model_prefix_match_is_case_insensitive() {
        let filter = models();
        assert!(filter.matches(&PeripheralIdentity::new("AA:01", Some("navband-4F2A".into()))));
        assert!(filter.matches(&PeripheralIdentity::new("AA:02", Some("WayCue".into()))));
        assert!(!filter.matches(&PeripheralIdentity::new("AA:03", Some("Galaxy Buds".into()))));
        assert!(!filter.matches(&PeripheralIdentity::new("AA:04", None)));
    }

    #[test]
    fn test_blank_models_are_ignored() {
        let filter = ModelFilter::new(&["", "  "]);
        assert!(!filter.matches(&PeripheralIdentity::new("AA:01", Some("NavBand".into()))));
    }

    #[test]
    fn test_scan_filter_dedupes_by_identity() {
        let mut scan = ScanFilter::new(models());

        assert!(scan.admit(Advertisement::new("AA:01", Some("NavBand"))).is_some());
        // Same peripheral, renamed advertisement
        assert!(scan.admit(Advertisement::new("AA:01", Some("NavBand Pro"))).is_none());
        assert!(scan.admit(Advertisement::new("BB:02", Some("Speaker"))).is_none());
        assert_eq!(scan.seen_count(), 1);

        scan.reset();
        assert!(scan.admit(Advertisement::new("AA:01", Some("NavBand"))).is_some());
    }
}
