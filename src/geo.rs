//! Coordinate resolution with a shared cache, reverse lookup, and
//! great-circle math.
//!
//! Lookup order: in-memory cache → curated table of non-standard locations
//! (ski resorts, airports, abbreviations) → Nominatim constrained to Russia.
//! Every geocoder outcome is cached, including misses, so uncommon names do
//! not generate repeated external calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coords {
    pub lat: f64,
    pub lon: f64,
}

impl Coords {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Haversine great-circle distance in kilometres.
pub fn distance_km(a: Coords, b: Coords) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Inclusive boundary: a driver exactly `radius_km` away still matches.
pub fn within_radius(driver: Coords, origin: Coords, radius_km: f64) -> bool {
    distance_km(driver, origin) <= radius_km
}

/// Hand-curated locations the geocoder resolves badly or not at all:
/// ski resorts, airports, shorthand and rural points, plus the large
/// cities we see in almost every order (saves a remote call).
const KNOWN_COORDINATES: &[(&str, f64, f64)] = &[
    // ski resorts / recreation
    ("солнечная долина", 55.0344, 60.0878),
    ("завьялиха", 55.0267, 59.9567),
    ("банное", 53.5983, 58.6317),
    ("абзаково", 53.8000, 58.6167),
    ("аджигардак", 54.9500, 58.7833),
    ("гора белая", 57.6500, 59.5667),
    ("уктус", 56.7833, 60.6167),
    ("роза хутор", 43.6572, 40.2971),
    ("красная поляна", 43.6833, 40.2000),
    ("шерегеш", 52.9333, 87.9833),
    ("манжерок", 51.8167, 85.7833),
    ("белокуриха", 51.9833, 84.9833),
    ("архыз", 43.5500, 41.2833),
    ("домбай", 43.2903, 41.6506),
    ("эльбрус", 43.4167, 42.5000),
    ("санаторий танып", 55.9667, 56.8333),
    // airports
    ("аэропорт челябинска", 55.3000, 61.5000),
    ("баландино", 55.3000, 61.5000),
    ("кольцово", 56.7500, 60.8000),
    ("аэропорт екатеринбурга", 56.7500, 60.8000),
    // shorthand
    ("челны", 55.7167, 52.4167),
    ("н.челны", 55.7167, 52.4167),
    ("набережные челны", 55.7167, 52.4167),
    ("ростов на дону", 47.2222, 39.7198),
    // frequent cities
    ("москва", 55.7558, 37.6173),
    ("санкт-петербург", 59.9343, 30.3351),
    ("екатеринбург", 56.8389, 60.6057),
    ("челябинск", 55.1644, 61.4368),
    ("магнитогорск", 53.4072, 58.9791),
    ("златоуст", 55.1711, 59.6508),
    ("миасс", 55.0456, 60.1078),
    ("тюмень", 57.1530, 65.5343),
    ("курган", 55.4500, 65.3333),
    ("казань", 55.7887, 49.1221),
    ("уфа", 54.7431, 55.9678),
    ("стерлитамак", 53.6333, 55.9500),
    ("самара", 53.1959, 50.1002),
    ("тольятти", 53.5078, 49.4204),
    ("пермь", 58.0105, 56.2502),
    ("оренбург", 51.7727, 55.0988),
    ("ижевск", 56.8527, 53.2114),
    ("саратов", 51.5336, 46.0343),
    ("ульяновск", 54.3142, 48.4031),
    ("пенза", 53.1959, 45.0183),
    ("нижний новгород", 56.2965, 43.9361),
    ("чебоксары", 56.1439, 47.2489),
    ("киров", 58.6035, 49.6680),
    ("новосибирск", 55.0084, 82.9357),
    ("омск", 54.9885, 73.3242),
    ("краснодар", 45.0355, 38.9753),
    ("сочи", 43.6028, 39.7342),
    ("воронеж", 51.6720, 39.1843),
    ("волгоград", 48.7080, 44.5133),
    ("тула", 54.1961, 37.6182),
    ("курск", 51.7373, 36.1874),
    ("смоленск", 54.7826, 32.0453),
    ("минск", 53.9006, 27.5590),
];

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

#[derive(Deserialize)]
struct NominatimReverse {
    #[serde(default)]
    address: Option<NominatimAddress>,
}

#[derive(Deserialize, Default)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
}

/// Shared resolver. Concurrent extraction tasks may race on the same
/// uncached key and each issue one remote query; the last write wins and
/// the cache stays consistent either way.
pub struct GeoResolver {
    http: HttpClient,
    user_agent: String,
    cache: Mutex<HashMap<String, Option<Coords>>>,
    remote_enabled: bool,
}

impl GeoResolver {
    pub fn new(user_agent: &str) -> Self {
        Self {
            http: HttpClient::new(),
            user_agent: user_agent.to_string(),
            cache: Mutex::new(HashMap::new()),
            remote_enabled: true,
        }
    }

    /// Resolver that answers only from the curated table and cache.
    /// Used by tests and by deployments without geocoder access.
    pub fn offline() -> Self {
        Self {
            http: HttpClient::new(),
            user_agent: "ride-scout-test".into(),
            cache: Mutex::new(HashMap::new()),
            remote_enabled: false,
        }
    }

    pub async fn resolve(&self, name: &str) -> Option<Coords> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }

        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return *hit;
        }

        if let Some(&(_, lat, lon)) = KNOWN_COORDINATES.iter().find(|(n, _, _)| *n == key) {
            let coords = Coords::new(lat, lon);
            self.cache.lock().unwrap().insert(key, Some(coords));
            return Some(coords);
        }

        if !self.remote_enabled {
            return None;
        }

        match self.geocode(&key).await {
            Ok(found) => {
                // Negative results are cached too, to bound repeat lookups.
                self.cache.lock().unwrap().insert(key, found);
                found
            }
            Err(e) => {
                // Transport errors are not cached so a later retry can succeed.
                warn!("Geocode failed for '{key}': {e}");
                None
            }
        }
    }

    async fn geocode(&self, name: &str) -> anyhow::Result<Option<Coords>> {
        let url = format!(
            "https://nominatim.openstreetmap.org/search?q={}&format=json&limit=1",
            url_encode(&format!("{name}, Россия"))
        );
        let places: Vec<NominatimPlace> = self
            .http
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;

        let Some(place) = places.first() else {
            debug!("Geocoder returned nothing for '{name}'");
            return Ok(None);
        };
        let lat: f64 = place.lat.parse()?;
        let lon: f64 = place.lon.parse()?;
        Ok(Some(Coords::new(lat, lon)))
    }

    /// Reverse lookup used to label a driver's registered location.
    pub async fn reverse_resolve(&self, lat: f64, lon: f64) -> Option<String> {
        if !self.remote_enabled {
            return None;
        }
        let url = format!(
            "https://nominatim.openstreetmap.org/reverse?lat={lat}&lon={lon}&format=json&accept-language=ru"
        );
        let resp = self
            .http
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        let parsed: NominatimReverse = resp.json().await.ok()?;
        let addr = parsed.address?;
        addr.city
            .or(addr.town)
            .or(addr.village)
            .or(addr.municipality)
            .or(addr.state)
    }
}

/// Minimal percent-encoding for query values (UTF-8 bytes outside the
/// unreserved set).
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_zero_for_same_point() {
        let p = Coords::new(55.0, 60.0);
        assert!(distance_km(p, p) < 1e-9);
    }

    #[test]
    fn distance_is_symmetric() {
        let ufa = Coords::new(54.7431, 55.9678);
        let kazan = Coords::new(55.7887, 49.1221);
        let d1 = distance_km(ufa, kazan);
        let d2 = distance_km(kazan, ufa);
        assert!((d1 - d2).abs() < 1e-9);
        // Ufa–Kazan is roughly 450 km as the crow flies.
        assert!(d1 > 400.0 && d1 < 500.0, "unexpected distance {d1}");
    }

    #[test]
    fn one_degree_of_latitude() {
        let a = Coords::new(55.0, 50.0);
        let b = Coords::new(56.0, 50.0);
        let d = distance_km(a, b);
        assert!((d - 111.19).abs() < 0.1, "got {d}");
    }

    #[test]
    fn radius_boundary_is_inclusive() {
        let a = Coords::new(55.0, 50.0);
        let b = Coords::new(55.3, 50.0);
        let d = distance_km(a, b);
        assert!(within_radius(a, b, d));
        assert!(!within_radius(a, b, d - 0.001));
    }

    #[tokio::test]
    async fn offline_resolver_uses_curated_table() {
        let geo = GeoResolver::offline();
        let ufa = geo.resolve("Уфа").await.unwrap();
        assert!((ufa.lat - 54.7431).abs() < 1e-6);
        // Second hit comes from the cache.
        assert!(geo.resolve("уфа ").await.is_some());
        assert!(geo.resolve("Несуществующийград").await.is_none());
    }

    #[test]
    fn url_encode_cyrillic() {
        assert_eq!(url_encode("Уфа"), "%D0%A3%D1%84%D0%B0");
        assert_eq!(url_encode("a b"), "a%20b");
    }
}
