use chrono::Utc;
use geo::{Centroid, Contains};
use geo_types::{Geometry, Point};
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::config::{RegionBoundary, RegionPolicy};
use crate::domain::{CountryPrefix, RawObservation, RegionCode};
use crate::error::ParcelError;
use crate::store::{ClaimOutcome, Store, WriteTx};

/// Decides which region's counter an observation draws from.
pub trait RegionResolver: Send + Sync {
    fn region_for(
        &self,
        observation: &RawObservation,
        geometry: Option<&Geometry<f64>>,
    ) -> Result<RegionCode, ParcelError>;
}

pub struct FixedRegion(RegionCode);

impl FixedRegion {
    pub fn new(code: RegionCode) -> Self {
        Self(code)
    }
}

impl RegionResolver for FixedRegion {
    fn region_for(
        &self,
        _observation: &RawObservation,
        _geometry: Option<&Geometry<f64>>,
    ) -> Result<RegionCode, ParcelError> {
        Ok(self.0.clone())
    }
}

/// Region whose area contains the centroid of the observation's geometry.
/// Boundaries are checked in configuration order.
pub struct BoundaryRegions {
    boundaries: Vec<RegionBoundary>,
    fallback: Option<RegionCode>,
}

impl BoundaryRegions {
    pub fn new(boundaries: Vec<RegionBoundary>, fallback: Option<RegionCode>) -> Self {
        Self {
            boundaries,
            fallback,
        }
    }

    fn locate(&self, point: &Point<f64>) -> Option<&RegionCode> {
        self.boundaries
            .iter()
            .find(|boundary| boundary.area.contains(point))
            .map(|boundary| &boundary.code)
    }
}

impl RegionResolver for BoundaryRegions {
    fn region_for(
        &self,
        observation: &RawObservation,
        geometry: Option<&Geometry<f64>>,
    ) -> Result<RegionCode, ParcelError> {
        geometry
            .and_then(|geometry| geometry.centroid())
            .and_then(|centroid| self.locate(&centroid))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ParcelError::MissingRegion(observation.source_key.to_string()))
    }
}

pub fn resolver_for(policy: &RegionPolicy) -> Box<dyn RegionResolver> {
    match policy {
        RegionPolicy::Fixed(code) => Box::new(FixedRegion::new(code.clone())),
        RegionPolicy::Boundaries {
            boundaries,
            fallback,
        } => Box::new(BoundaryRegions::new(boundaries.clone(), fallback.clone())),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CanonicalizeReport {
    pub pending: usize,
    pub created: usize,
    pub already_canonical: usize,
    pub failed: usize,
    pub codes: Vec<String>,
}

pub struct Canonicalizer {
    prefix: CountryPrefix,
    resolver: Box<dyn RegionResolver>,
}

impl Canonicalizer {
    pub fn new(prefix: CountryPrefix, resolver: Box<dyn RegionResolver>) -> Self {
        Self { prefix, resolver }
    }

    /// Assigns codes to every observation without one. The whole pass holds
    /// the store's write lock, so concurrent passes run one after another.
    pub fn run(
        &self,
        store: &Store,
        sink: &dyn ProgressSink,
    ) -> Result<CanonicalizeReport, ParcelError> {
        let start = std::time::Instant::now();
        let report = store.write(|tx| {
            let pending = tx.pending_observations()?;
            let mut report = CanonicalizeReport {
                pending: pending.len(),
                ..CanonicalizeReport::default()
            };
            for observation in &pending {
                let observation = match observation {
                    Ok(observation) => observation,
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable observation row");
                        report.failed += 1;
                        continue;
                    }
                };
                match self.assign(tx, observation) {
                    Ok(ClaimOutcome::Created(address)) => {
                        report.created += 1;
                        report.codes.push(address.canonical_code.to_string());
                    }
                    Ok(ClaimOutcome::AlreadyCanonical) => report.already_canonical += 1,
                    Err(err) => {
                        warn!(
                            raw_id = %observation.raw_id,
                            source_key = %observation.source_key,
                            error = %err,
                            "leaving observation uncanonicalized"
                        );
                        report.failed += 1;
                    }
                }
            }
            Ok(report)
        })?;

        info!(
            created = report.created,
            failed = report.failed,
            "canonicalization finished"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Canonicalize; created={} failed={}",
                report.created, report.failed
            ),
            elapsed: Some(start.elapsed()),
        });
        Ok(report)
    }

    fn assign(
        &self,
        tx: &mut WriteTx<'_>,
        observation: &RawObservation,
    ) -> Result<ClaimOutcome, ParcelError> {
        let geometry = observation.geometry()?;
        let region = self.resolver.region_for(observation, geometry.as_ref())?;
        tx.claim_address(observation, &region, &self.prefix, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use geo_types::{MultiPolygon, polygon};
    use uuid::Uuid;

    use super::*;
    use crate::domain::{Properties, SourceKey};

    fn observation() -> RawObservation {
        RawObservation {
            raw_id: Uuid::new_v4(),
            source: "test".to_string(),
            source_key: SourceKey::new("a.kml::0"),
            properties: Properties::new(),
            geometry: None,
            footprint: None,
            srid: 4326,
            fetched_at: Utc::now(),
        }
    }

    fn regions(fallback: Option<&str>) -> BoundaryRegions {
        let square = polygon![
            (x: 58.0, y: 23.0),
            (x: 59.0, y: 23.0),
            (x: 59.0, y: 24.0),
            (x: 58.0, y: 24.0),
            (x: 58.0, y: 23.0),
        ];
        BoundaryRegions::new(
            vec![RegionBoundary {
                code: "MS001".parse().unwrap(),
                area: MultiPolygon::new(vec![square]),
            }],
            fallback.map(|code| code.parse().unwrap()),
        )
    }

    #[test]
    fn centroid_inside_boundary() {
        let point = Geometry::Point(Point::new(58.5, 23.5));
        let region = regions(None).region_for(&observation(), Some(&point)).unwrap();
        assert_eq!(region.as_str(), "MS001");
    }

    #[test]
    fn outside_uses_fallback() {
        let point = Geometry::Point(Point::new(10.0, 10.0));
        let region = regions(Some("WL001"))
            .region_for(&observation(), Some(&point))
            .unwrap();
        assert_eq!(region.as_str(), "WL001");
    }

    #[test]
    fn outside_without_fallback_is_missing() {
        let err = regions(None).region_for(&observation(), None).unwrap_err();
        assert!(matches!(err, ParcelError::MissingRegion(_)));
    }
}
