//! Session anomaly detection.
//!
//! Consulted once per session creation, against the user's other sessions
//! (live and archived). A fingerprint never seen before is a new device; a
//! coordinate farther than the configured radius from every prior coordinate
//! is a new location.

use realmgate_core::config::AnomalyDetectionConfig;
use realmgate_events::AnomalyKind;

use crate::session::Session;

/// Mean Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates (Haversine)
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// A prior session's device and location footprint
#[derive(Debug, Clone)]
pub struct PriorFootprint {
    pub device_fingerprint: Option<String>,
    pub coordinates: Option<(f64, f64)>,
}

impl From<&Session> for PriorFootprint {
    fn from(session: &Session) -> Self {
        Self {
            device_fingerprint: session.device_fingerprint.clone(),
            coordinates: session.coordinates(),
        }
    }
}

/// Stateless anomaly detector configured per realm
pub struct AnomalyDetector {
    config: AnomalyDetectionConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyDetectionConfig) -> Self {
        Self { config }
    }

    /// Compare a just-created session against the user's prior footprints
    /// (the new session itself must not be in `priors`).
    pub fn detect(&self, created: &Session, priors: &[PriorFootprint]) -> Vec<AnomalyKind> {
        let mut anomalies = Vec::new();

        if self.config.detect_new_device {
            if let Some(fingerprint) = &created.device_fingerprint {
                let known = priors
                    .iter()
                    .any(|p| p.device_fingerprint.as_ref() == Some(fingerprint));
                if !known && !priors.is_empty() {
                    anomalies.push(AnomalyKind::NewDevice);
                }
            }
        }

        if self.config.detect_new_location {
            if let Some(coords) = created.coordinates() {
                let prior_coords: Vec<(f64, f64)> =
                    priors.iter().filter_map(|p| p.coordinates).collect();
                if !prior_coords.is_empty() {
                    let min_distance = prior_coords
                        .iter()
                        .map(|prior| haversine_km(coords, *prior))
                        .fold(f64::INFINITY, f64::min);
                    if min_distance > self.config.location_radius_km {
                        anomalies.push(AnomalyKind::NewLocation);
                    }
                }
            }
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use realmgate_core::id::{SessionId, TokenFamily, UserId};
    use crate::session::SessionStatus;

    const NEW_YORK: (f64, f64) = (40.7128, -74.0060);
    const LOS_ANGELES: (f64, f64) = (34.0522, -118.2437);

    fn session_at(coords: Option<(f64, f64)>, fingerprint: Option<&str>) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(),
            user_id: UserId::new(),
            token_family: TokenFamily::new(),
            device_fingerprint: fingerprint.map(String::from),
            device_name: None,
            ip_address: None,
            user_agent: None,
            latitude: coords.map(|c| c.0),
            longitude: coords.map(|c| c.1),
            created_at: now,
            last_activity_at: now,
            expires_at: now + chrono::Duration::hours(24),
            status: SessionStatus::Active,
            revoked_reason: None,
            revoked_at: None,
        }
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyDetectionConfig {
            detect_new_device: true,
            detect_new_location: true,
            location_radius_km: 100.0,
        })
    }

    #[test]
    fn test_haversine_known_distance() {
        // New York to Los Angeles is roughly 3940 km.
        let d = haversine_km(NEW_YORK, LOS_ANGELES);
        assert!((3900.0..4000.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_cross_country_login_is_new_location() {
        let prior = session_at(Some(NEW_YORK), Some("fp-1"));
        let created = session_at(Some(LOS_ANGELES), Some("fp-1"));

        let anomalies = detector().detect(&created, &[PriorFootprint::from(&prior)]);
        assert_eq!(anomalies, vec![AnomalyKind::NewLocation]);
    }

    #[test]
    fn test_nearby_login_is_not_new_location() {
        let prior = session_at(Some(NEW_YORK), Some("fp-1"));
        // ~10 km north of the prior coordinate.
        let created = session_at(Some((40.8028, -74.0060)), Some("fp-1"));

        let anomalies = detector().detect(&created, &[PriorFootprint::from(&prior)]);
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_unknown_fingerprint_is_new_device() {
        let prior = session_at(None, Some("fp-1"));
        let created = session_at(None, Some("fp-2"));

        let anomalies = detector().detect(&created, &[PriorFootprint::from(&prior)]);
        assert_eq!(anomalies, vec![AnomalyKind::NewDevice]);
    }

    #[test]
    fn test_first_session_is_never_anomalous() {
        let created = session_at(Some(NEW_YORK), Some("fp-1"));
        assert!(detector().detect(&created, &[]).is_empty());
    }

    #[test]
    fn test_disabled_detection() {
        let detector = AnomalyDetector::new(AnomalyDetectionConfig {
            detect_new_device: false,
            detect_new_location: false,
            location_radius_km: 100.0,
        });
        let prior = session_at(Some(NEW_YORK), Some("fp-1"));
        let created = session_at(Some(LOS_ANGELES), Some("fp-2"));

        assert!(detector
            .detect(&created, &[PriorFootprint::from(&prior)])
            .is_empty());
    }
}
